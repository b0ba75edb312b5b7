//! Process shutdown signals.

use tracing::info;

/// Wait until the process receives `SIGINT` or `SIGTERM`.
pub async fn wait_for_signal() {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if result.is_ok() {
                info!("received interrupt");
            }
        }
        () = terminate() => {
            info!("received terminate");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}
