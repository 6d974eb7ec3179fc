use std::collections::HashSet;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

/// Viewers waiting for a device to come online, keyed by device id.
///
/// Each device key lives in its own shard entry, so registrations for
/// different devices never serialize on a shared lock. A device's entry
/// exists only while at least one token waits on it.
#[derive(Default)]
pub struct PrejoinQueue {
    waiting: DashMap<String, HashSet<Uuid>>,
}

impl PrejoinQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` as waiting for `device_id`. Idempotent per token.
    pub fn wait(&self, token: Uuid, device_id: &str) {
        self.waiting
            .entry(device_id.to_string())
            .or_default()
            .insert(token);
    }

    /// Remove `token` from `device_id`'s waiters. Returns true only for the
    /// call that actually removed it, so a token is consumed at most once.
    pub fn consume(&self, device_id: &str, token: Uuid) -> bool {
        match self.waiting.entry(device_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(&token);
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Tokens currently waiting for a device.
    pub fn waiters(&self, device_id: &str) -> Vec<Uuid> {
        self.waiting
            .get(device_id)
            .map(|tokens| tokens.iter().copied().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn is_waiting(&self, device_id: &str, token: Uuid) -> bool {
        self.waiting
            .get(device_id)
            .is_some_and(|tokens| tokens.contains(&token))
    }

    /// Number of devices with at least one waiter.
    #[cfg(test)]
    pub fn device_count(&self) -> usize {
        self.waiting.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn wait_is_idempotent() {
        let queue = PrejoinQueue::new();
        let token = Uuid::new_v4();
        queue.wait(token, "dev-1");
        queue.wait(token, "dev-1");
        assert_eq!(queue.waiters("dev-1"), vec![token]);
    }

    #[test]
    fn consume_is_at_most_once() {
        let queue = PrejoinQueue::new();
        let token = Uuid::new_v4();
        queue.wait(token, "dev-1");
        assert!(queue.consume("dev-1", token));
        assert!(!queue.consume("dev-1", token));
        assert!(!queue.is_waiting("dev-1", token));
    }

    #[test]
    fn last_token_removes_device_entry() {
        let queue = PrejoinQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.wait(a, "dev-1");
        queue.wait(b, "dev-1");
        queue.consume("dev-1", a);
        assert_eq!(queue.device_count(), 1);
        queue.consume("dev-1", b);
        assert_eq!(queue.device_count(), 0);
    }

    #[test]
    fn consume_for_other_device_leaves_token() {
        let queue = PrejoinQueue::new();
        let token = Uuid::new_v4();
        queue.wait(token, "dev-1");
        assert!(!queue.consume("dev-2", token));
        assert!(queue.is_waiting("dev-1", token));
        assert_eq!(queue.device_count(), 1, "no entry created for dev-2");
    }

    #[test]
    fn concurrent_consumers_remove_token_once() {
        let queue = Arc::new(PrejoinQueue::new());
        let token = Uuid::new_v4();
        queue.wait(token, "dev-1");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || queue.consume("dev-1", token))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|removed| *removed)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(queue.device_count(), 0);
    }
}
