use std::future::Future;
use std::sync::Arc;

use hub_store::CoordinationStore;
use hub_types::{HubError, NodeId};

use crate::keys::LEADER_KEY;

/// Answers "who is the leader right now". Election itself happens elsewhere.
pub trait LeaderSource: Send + Sync + 'static {
    fn leader_id(&self) -> impl Future<Output = Result<Option<NodeId>, HubError>> + Send;
}

/// Fixed leader taken from configuration.
#[derive(Debug, Clone)]
pub struct StaticLeader(pub Option<NodeId>);

impl LeaderSource for StaticLeader {
    async fn leader_id(&self) -> Result<Option<NodeId>, HubError> {
        Ok(self.0.clone())
    }
}

/// Reads the UTF-8 node ID written to `cluster:leader` by the external
/// election.
pub struct StoreLeader<S> {
    store: Arc<S>,
}

impl<S> StoreLeader<S> {
    pub fn new(store: Arc<S>) -> Self {
        StoreLeader { store }
    }
}

impl<S: CoordinationStore> LeaderSource for StoreLeader<S> {
    async fn leader_id(&self) -> Result<Option<NodeId>, HubError> {
        let Some(entry) = self.store.get(LEADER_KEY).await? else {
            return Ok(None);
        };
        let id = String::from_utf8(entry.value)
            .map_err(|e| HubError::Codec(format!("leader key is not UTF-8: {e}")))?;
        Ok(Some(id).filter(|s| !s.is_empty()))
    }
}

/// Either leader source, so the context can pick one at runtime.
pub enum Leader<S> {
    Static(StaticLeader),
    Store(StoreLeader<S>),
}

impl<S> Leader<S> {
    pub fn fixed(id: Option<NodeId>) -> Self {
        Leader::Static(StaticLeader(id))
    }

    pub fn from_store(store: Arc<S>) -> Self {
        Leader::Store(StoreLeader::new(store))
    }
}

impl<S: CoordinationStore> LeaderSource for Leader<S> {
    async fn leader_id(&self) -> Result<Option<NodeId>, HubError> {
        match self {
            Leader::Static(l) => l.leader_id().await,
            Leader::Store(l) => l.leader_id().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_store::MemStore;

    #[tokio::test]
    async fn static_leader_is_fixed() {
        let leader: Leader<MemStore> = Leader::fixed(Some("n1".into()));
        assert_eq!(leader.leader_id().await.unwrap().as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn store_leader_follows_key() {
        let store = Arc::new(MemStore::new());
        let leader = Leader::from_store(store.clone());
        assert_eq!(leader.leader_id().await.unwrap(), None);

        store.set(LEADER_KEY, b"n2".to_vec(), None).await.unwrap();
        assert_eq!(leader.leader_id().await.unwrap().as_deref(), Some("n2"));

        store.set(LEADER_KEY, vec![0xff, 0xfe], None).await.unwrap();
        assert_eq!(leader.leader_id().await.unwrap_err().kind(), "codec");
    }
}
