//! Deleted file cleanup
//!
//! Deleting a file only removes it from the namespace. The path then waits
//! in the trash for a grace period before every ALIVE storage node is told
//! to drop its content.

use crate::membership::ClientMembership;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, info};
use tracker_common::config::MembershipConfig;

/// Paths deleted from the namespace, oldest first
pub struct TrashQueue {
    entries: Mutex<VecDeque<(String, u64)>>,
    grace_ms: u64,
}

impl TrashQueue {
    pub fn new(grace_ms: u64) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            grace_ms,
        }
    }

    pub fn push(&self, path: impl Into<String>, deleted_at_ms: u64) {
        self.entries.lock().push_back((path.into(), deleted_at_ms));
    }

    /// Remove and return every path deleted at least the grace period ago
    pub fn drain_expired(&self, now_ms: u64) -> Vec<String> {
        let mut entries = self.entries.lock();
        let mut expired = Vec::new();
        while let Some((_, deleted_at)) = entries.front() {
            if now_ms.saturating_sub(*deleted_at) < self.grace_ms {
                break;
            }
            if let Some((path, _)) = entries.pop_front() {
                expired.push(path);
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Outcome of one trash pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TrashPass {
    pub paths: usize,
    pub commands: usize,
    pub purged_clients: usize,
}

/// Turn expired trash into removal commands and drop long-dead clients
pub fn run_trash_pass(
    trash: &TrashQueue,
    membership: &ClientMembership,
    config: &MembershipConfig,
    now_ms: u64,
) -> TrashPass {
    let expired = trash.drain_expired(now_ms);
    let pass = TrashPass {
        paths: expired.len(),
        commands: membership.enqueue_removals(&expired),
        purged_clients: membership.purge_dead(now_ms, config.dead_retention_ms),
    };
    if pass == TrashPass::default() {
        debug!("Trash pass: nothing to do");
    } else {
        info!(
            "Trash pass: {} paths, {} removal commands queued, {} dead clients removed",
            pass.paths, pass.commands, pass.purged_clients
        );
    }
    pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tracker_common::MonotonicIdGenerator;

    #[test]
    fn test_grace_period() {
        let trash = TrashQueue::new(100);
        trash.push("/a", 0);
        trash.push("/b", 50);
        trash.push("/c", 200);

        assert!(trash.drain_expired(99).is_empty());
        assert_eq!(trash.drain_expired(150), vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(trash.len(), 1);
        assert_eq!(trash.drain_expired(300), vec!["/c".to_string()]);
        assert!(trash.is_empty());
    }

    #[test]
    fn test_trash_pass() {
        let config = MembershipConfig {
            heartbeat_timeout_ms: 1000,
            dead_retention_ms: 1000,
            trash_grace_ms: 100,
            ..MembershipConfig::default()
        };
        let members = ClientMembership::new(&config, Arc::new(MonotonicIdGenerator::new()));
        let alive = members.register("alive", 7000, 0).unwrap();
        let dead = members.register("dead", 7000, 0).unwrap();
        members.heartbeat(alive, 1500);
        members.scan_liveness(1600);

        let trash = TrashQueue::new(config.trash_grace_ms);
        trash.push("/x", 1600);

        let pass = run_trash_pass(&trash, &members, &config, 1700);
        assert_eq!(
            pass,
            TrashPass {
                paths: 1,
                commands: 1,
                purged_clients: 0
            }
        );
        assert_eq!(members.get(alive).unwrap().pending_commands(), 1);

        let pass = run_trash_pass(&trash, &members, &config, 2600);
        assert_eq!(pass.purged_clients, 1);
        assert!(members.get(dead).is_none());
    }
}
