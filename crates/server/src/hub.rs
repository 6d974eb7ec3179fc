use std::collections::HashSet;
use std::time::Duration;

use castgate_protocol::{AgentMessage, CasterMessage, ViewerMessage};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-connection outbound queue depth.
pub(crate) const OUTBOUND_CAPACITY: usize = 64;

/// How long a send waits on a full queue before the message is dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Anything the hub can deliver to a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Viewer(ViewerMessage),
    Caster(CasterMessage),
    Agent(AgentMessage),
}

impl Outbound {
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Viewer(m) => serde_json::to_string(m),
            Self::Caster(m) => serde_json::to_string(m),
            Self::Agent(m) => serde_json::to_string(m),
        }
    }
}

impl From<ViewerMessage> for Outbound {
    fn from(m: ViewerMessage) -> Self {
        Self::Viewer(m)
    }
}

impl From<CasterMessage> for Outbound {
    fn from(m: CasterMessage) -> Self {
        Self::Caster(m)
    }
}

impl From<AgentMessage> for Outbound {
    fn from(m: AgentMessage) -> Self {
        Self::Agent(m)
    }
}

/// Addressed delivery to live connections and named groups of connections.
///
/// The maps are sharded so unrelated connections never contend on one lock.
/// Senders are cloned out of the map before awaiting, so no shard guard is
/// held across a suspension point. At most one shard guard is held at a time.
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<Uuid, mpsc::Sender<Outbound>>,
    groups: DashMap<String, HashSet<Uuid>>,
    /// Reverse index of `groups`: the groups each connection joined
    memberships: DashMap<Uuid, HashSet<String>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection, returning its id and outbound queue.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let id = Uuid::new_v4();
        self.connections.insert(id, tx);
        (id, rx)
    }

    /// Drop a connection and remove it from every group it joined.
    /// Only the groups recorded for this connection are touched.
    pub fn unregister(&self, id: Uuid) {
        self.connections.remove(&id);
        let Some((_, joined)) = self.memberships.remove(&id) else {
            return;
        };
        for group in joined {
            self.leave(&group, id);
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self, id: Uuid) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Deliver a message to one connection. Returns false when the target
    /// is gone, its queue has closed, or it stayed full past the timeout.
    pub async fn send(&self, id: Uuid, msg: impl Into<Outbound>) -> bool {
        let Some(tx) = self.connections.get(&id).map(|e| e.value().clone()) else {
            return false;
        };
        match tx.send_timeout(msg.into(), SEND_TIMEOUT).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                tracing::warn!(connection_id = %id, "Outbound queue full, message dropped");
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => false,
        }
    }

    pub fn add_to_group(&self, group: &str, id: Uuid) {
        self.groups.entry(group.to_string()).or_default().insert(id);
        self.memberships
            .entry(id)
            .or_default()
            .insert(group.to_string());
    }

    pub fn remove_from_group(&self, group: &str, id: Uuid) {
        self.leave(group, id);
        let mut empty = false;
        if let Some(mut joined) = self.memberships.get_mut(&id) {
            joined.remove(group);
            empty = joined.is_empty();
        }
        if empty {
            self.memberships.remove_if(&id, |_, joined| joined.is_empty());
        }
    }

    /// Remove `id` from one group, dropping the group once it is empty.
    fn leave(&self, group: &str, id: Uuid) {
        let mut empty = false;
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(&id);
            empty = members.is_empty();
        }
        if empty {
            self.groups.remove_if(group, |_, members| members.is_empty());
        }
    }

    /// Deliver a message to every member of a group. Returns the number of
    /// connections that accepted it.
    pub async fn send_to_group(&self, group: &str, msg: impl Into<Outbound>) -> usize {
        let members: Vec<Uuid> = self
            .groups
            .get(group)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        let msg = msg.into();
        let mut delivered = 0;
        for id in members {
            if self.send(id, msg.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_reaches_registered_connection() {
        let hub = ConnectionHub::new();
        let (id, mut rx) = hub.register();
        assert!(hub.send(id, ViewerMessage::RequestingScreenCast).await);
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Viewer(ViewerMessage::RequestingScreenCast))
        );
    }

    #[tokio::test]
    async fn send_to_unknown_connection_is_dropped() {
        let hub = ConnectionHub::new();
        assert!(!hub.send(Uuid::new_v4(), ViewerMessage::Unauthorized).await);
    }

    #[tokio::test]
    async fn send_after_unregister_is_dropped() {
        let hub = ConnectionHub::new();
        let (id, _rx) = hub.register();
        hub.unregister(id);
        assert!(!hub.is_connected(id));
        assert!(!hub.send(id, ViewerMessage::Unauthorized).await);
    }

    #[tokio::test]
    async fn group_delivery_and_membership() {
        let hub = ConnectionHub::new();
        let (a, mut rx_a) = hub.register();
        let (b, mut rx_b) = hub.register();
        hub.add_to_group("wait", a);
        hub.add_to_group("wait", b);

        let n = hub.send_to_group("wait", ViewerMessage::ScreenCasterDisconnected).await;
        assert_eq!(n, 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());

        hub.remove_from_group("wait", a);
        let n = hub.send_to_group("wait", ViewerMessage::ScreenCasterDisconnected).await;
        assert_eq!(n, 1);

        hub.unregister(b);
        assert_eq!(
            hub.send_to_group("wait", ViewerMessage::ScreenCasterDisconnected).await,
            0
        );
        assert!(hub.groups.is_empty(), "empty groups are removed");
        assert!(hub.memberships.is_empty());
    }

    #[tokio::test]
    async fn unregister_leaves_other_groups_untouched() {
        let hub = ConnectionHub::new();
        let (leaving, _rx_leaving) = hub.register();
        let (staying, mut rx_staying) = hub.register();
        hub.add_to_group("shared", leaving);
        hub.add_to_group("shared", staying);
        hub.add_to_group("own", leaving);
        hub.add_to_group("other", staying);

        hub.unregister(leaving);

        assert!(!hub.memberships.contains_key(&leaving));
        assert!(!hub.groups.contains_key("own"));
        assert_eq!(
            hub.groups.get("shared").map(|m| m.value().clone()),
            Some(HashSet::from([staying]))
        );
        assert_eq!(
            hub.memberships.get(&staying).map(|m| m.len()),
            Some(2),
            "the remaining member keeps both groups"
        );
        assert_eq!(
            hub.send_to_group("other", ViewerMessage::ScreenCasterDisconnected)
                .await,
            1
        );
        assert!(rx_staying.recv().await.is_some());
    }

    #[test]
    fn serializes_for_the_wire() {
        let json = Outbound::from(ViewerMessage::Unauthorized).to_json().unwrap();
        assert_eq!(json, r#"{"type":"unauthorized"}"#);
    }
}
