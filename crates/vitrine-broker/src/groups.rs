//! Group index: group name → subscribed display names.
//!
//! The index holds names only. A member whose connection has gone away is
//! skipped at delivery time and cleaned up when the disconnect is
//! observed; nothing here touches sockets.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Mapping from group name to an ordered set of display names.
///
/// Mutations are idempotent on both sides: attaching an existing member or
/// detaching a non-member is a no-op. Groups with no members are dropped
/// from the index, so a group "exists" exactly while it has members.
#[derive(Default)]
pub struct GroupIndex {
    groups: RwLock<HashMap<String, Vec<String>>>,
}

impl GroupIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `name` to `group`.
    pub fn attach(&self, name: &str, group: &str) {
        let mut groups = self.groups.write();
        let members = groups.entry(group.to_owned()).or_default();
        if !members.iter().any(|member| member == name) {
            members.push(name.to_owned());
        }
    }

    /// Unsubscribe `name` from `group`.
    pub fn detach(&self, name: &str, group: &str) {
        let mut groups = self.groups.write();
        if let Some(members) = groups.get_mut(group) {
            members.retain(|member| member != name);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    /// Remove `name` from every group it is part of. Linear in the total
    /// number of (group, member) entries.
    pub fn detach_all(&self, name: &str) {
        let mut groups = self.groups.write();
        groups.retain(|_, members| {
            members.retain(|member| member != name);
            !members.is_empty()
        });
    }

    /// Members of `group` in subscription order, or `None` when no such
    /// group (i.e. no members).
    pub fn members(&self, group: &str) -> Option<Vec<String>> {
        self.groups.read().get(group).cloned()
    }

    /// Whether `name` is currently subscribed to `group`.
    pub fn contains(&self, group: &str, name: &str) -> bool {
        self.groups
            .read()
            .get(group)
            .is_some_and(|members| members.iter().any(|member| member == name))
    }

    /// Number of groups with at least one member.
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Whether any group has members.
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}
