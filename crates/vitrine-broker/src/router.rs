//! Event routing: target resolution, bounded delivery queue, worker pool.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vitrine_events::Event;

use crate::groups::GroupIndex;
use crate::registry::Registry;

/// Failures surfaced to the producer; never blocks the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The delivery queue is full. The event is dropped; the session that
    /// produced it keeps running.
    #[error("delivery queue is full")]
    QueueFull,
    /// The router has been closed.
    #[error("router is shut down")]
    Shutdown,
}

/// One unit of delivery work: an event bound for one recipient.
struct Job {
    event: Event,
    recipient: String,
}

/// Routes events to registered connections through a bounded work queue.
///
/// Resolution: a target naming a group with at least one member fans out
/// to every member; anything else is treated as a display name, whether or
/// not such a display is currently connected.
///
/// Ordering: jobs are queued FIFO, but with more than one worker two
/// events from the same sender may be written to their recipients in
/// either order. Per-(sender, recipient) ordering holds only when the
/// router runs a single worker.
pub struct Router {
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    groups: Arc<GroupIndex>,
}

impl Router {
    /// Spawn `num_workers` delivery workers over a queue of `queue_depth`
    /// jobs.
    pub fn start(
        registry: Arc<Registry>,
        groups: Arc<GroupIndex>,
        num_workers: usize,
        queue_depth: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth);
        let rx = Arc::new(AsyncMutex::new(rx));
        let workers = (0..num_workers)
            .map(|id| {
                debug!(worker = id, "starting delivery worker");
                tokio::spawn(delivery_worker(id, rx.clone(), registry.clone()))
            })
            .collect();
        Self {
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            groups,
        }
    }

    /// Resolve the event's target and enqueue one job per recipient.
    ///
    /// On a full queue the remaining recipients of a fan-out are skipped
    /// and [`RouterError::QueueFull`] is reported; the caller drops the
    /// event and moves on.
    pub fn send(&self, event: Event) -> Result<(), RouterError> {
        let jobs = self.jobs.lock();
        let Some(tx) = jobs.as_ref() else {
            return Err(RouterError::Shutdown);
        };
        match self.groups.members(&event.target) {
            Some(members) => {
                for recipient in members {
                    enqueue(
                        tx,
                        Job {
                            event: event.clone(),
                            recipient,
                        },
                    )?;
                }
                Ok(())
            }
            None => {
                let recipient = event.target.clone();
                enqueue(tx, Job { event, recipient })
            }
        }
    }

    /// Close the queue and wait for the workers to drain it.
    ///
    /// Workers still running after `drain_timeout` are aborted.
    pub async fn close(&self, drain_timeout: Duration) {
        drop(self.jobs.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        let abort_handles: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(drain_timeout, futures::future::join_all(workers))
            .await
            .is_err()
        {
            warn!("timed out draining the delivery queue, aborting workers");
            for handle in abort_handles {
                handle.abort();
            }
        }
    }

    /// Whether [`Router::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.jobs.lock().is_none()
    }
}

fn enqueue(tx: &mpsc::Sender<Job>, job: Job) -> Result<(), RouterError> {
    use mpsc::error::TrySendError;
    match tx.try_send(job) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(job)) => {
            warn!(
                kind = %job.event.kind,
                recipient = %job.recipient,
                "delivery queue full, dropping event"
            );
            Err(RouterError::QueueFull)
        }
        Err(TrySendError::Closed(_)) => Err(RouterError::Shutdown),
    }
}

/// Drains the shared queue until it is closed and empty. A failed delivery
/// abandons the job and keeps the worker alive.
async fn delivery_worker(
    id: usize,
    jobs: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    registry: Arc<Registry>,
) {
    loop {
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else { break };
        match registry.get(&job.recipient) {
            None => {
                debug!(
                    worker = id,
                    recipient = %job.recipient,
                    kind = %job.event.kind,
                    "no connection for recipient, dropping event"
                );
            }
            Some(conn) => {
                if !conn.send_event(&job.event) {
                    warn!(
                        worker = id,
                        recipient = %job.recipient,
                        kind = %job.event.kind,
                        "recipient mailbox unavailable, dropping event"
                    );
                }
            }
        }
    }
    debug!(worker = id, "delivery worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    use crate::registry::ConnectionHandle;

    const WAIT: Duration = Duration::from_secs(2);

    fn register(
        registry: &Registry,
        name: &str,
        port: u16,
        capacity: usize,
    ) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(capacity);
        registry
            .add(Arc::new(ConnectionHandle::new(
                name,
                true,
                ([127, 0, 0, 1], port).into(),
                tx,
                CancellationToken::new(),
            )))
            .unwrap();
        rx
    }

    async fn next_event(rx: &mut mpsc::Receiver<Message>) -> Event {
        let frame = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        match frame {
            Message::Text(text) => Event::parse(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn direct_delivery_by_name() {
        let registry = Arc::new(Registry::new());
        let groups = Arc::new(GroupIndex::new());
        let mut rx = register(&registry, "b", 1000, 8);
        let router = Router::start(registry, groups, 1, 100);

        router.send(Event::message("a", "b", "hi").unwrap()).unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.target, "b");
        assert_eq!(event.text_payload().unwrap(), "hi");
        router.close(WAIT).await;
    }

    #[tokio::test]
    async fn group_target_fans_out() {
        let registry = Arc::new(Registry::new());
        let groups = Arc::new(GroupIndex::new());
        let mut rx_a = register(&registry, "a", 1000, 8);
        let mut rx_b = register(&registry, "b", 1001, 8);
        groups.attach("a", "g1");
        groups.attach("b", "g1");
        let router = Router::start(registry, groups, 2, 100);

        router
            .send(Event::message("c", "g1", "hello").unwrap())
            .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let event = next_event(rx).await;
            // Fan-out keeps the group name as the target.
            assert_eq!(event.target, "g1");
            assert_eq!(event.source, "c");
        }
        router.close(WAIT).await;
    }

    #[tokio::test]
    async fn group_resolution_wins_over_display_name() {
        let registry = Arc::new(Registry::new());
        let groups = Arc::new(GroupIndex::new());
        let mut rx_same = register(&registry, "g1", 1000, 8);
        let mut rx_member = register(&registry, "b", 1001, 8);
        groups.attach("b", "g1");
        let router = Router::start(registry, groups, 1, 100);

        router.send(Event::message("c", "g1", "x").unwrap()).unwrap();

        let event = next_event(&mut rx_member).await;
        assert_eq!(event.target, "g1");
        // The display that happens to share the group's name gets nothing.
        assert!(rx_same.try_recv().is_err());
        router.close(WAIT).await;
    }

    #[tokio::test]
    async fn unknown_recipient_is_dropped_silently() {
        let registry = Arc::new(Registry::new());
        let groups = Arc::new(GroupIndex::new());
        let router = Router::start(registry, groups, 1, 100);

        // No such display; send succeeds, the worker drops the job.
        router
            .send(Event::message("a", "nobody", "hi").unwrap())
            .unwrap();
        router.close(WAIT).await;
    }

    #[tokio::test]
    async fn full_queue_reports_queue_full() {
        let registry = Arc::new(Registry::new());
        let groups = Arc::new(GroupIndex::new());
        // No workers: nothing drains the queue.
        let router = Router::start(registry, groups, 0, 1);

        router.send(Event::message("a", "b", "1").unwrap()).unwrap();
        let err = router
            .send(Event::message("a", "b", "2").unwrap())
            .unwrap_err();
        assert_eq!(err, RouterError::QueueFull);
    }

    #[tokio::test]
    async fn send_returns_quickly_when_saturated() {
        let registry = Arc::new(Registry::new());
        let groups = Arc::new(GroupIndex::new());
        let router = Router::start(registry, groups, 0, 1);
        router.send(Event::message("a", "b", "1").unwrap()).unwrap();

        // A saturated queue must fail fast, not block the session reader.
        let started = std::time::Instant::now();
        let _ = router.send(Event::message("a", "b", "2").unwrap());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn send_after_close_reports_shutdown() {
        let registry = Arc::new(Registry::new());
        let groups = Arc::new(GroupIndex::new());
        let router = Router::start(registry, groups, 1, 100);
        router.close(WAIT).await;

        let err = router
            .send(Event::message("a", "b", "hi").unwrap())
            .unwrap_err();
        assert_eq!(err, RouterError::Shutdown);
        assert!(router.is_closed());
    }

    #[tokio::test]
    async fn close_drains_pending_jobs() {
        let registry = Arc::new(Registry::new());
        let groups = Arc::new(GroupIndex::new());
        let mut rx = register(&registry, "b", 1000, 32);
        let router = Router::start(registry.clone(), groups, 1, 100);

        for i in 0..10 {
            router
                .send(Event::message("a", "b", &format!("m{i}")).unwrap())
                .unwrap();
        }
        router.close(WAIT).await;

        for i in 0..10 {
            let event = next_event(&mut rx).await;
            assert_eq!(event.text_payload().unwrap(), format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn single_worker_preserves_per_recipient_order() {
        let registry = Arc::new(Registry::new());
        let groups = Arc::new(GroupIndex::new());
        let mut rx = register(&registry, "b", 1000, 64);
        let router = Router::start(registry, groups, 1, 100);

        for i in 0..20 {
            router
                .send(Event::message("a", "b", &format!("{i}")).unwrap())
                .unwrap();
        }
        for i in 0..20 {
            let event = next_event(&mut rx).await;
            assert_eq!(event.text_payload().unwrap(), format!("{i}"));
        }
        router.close(WAIT).await;
    }
}
