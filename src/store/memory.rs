use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{FleetNode, HashrateSample, NodeStore, StoreError};

/// In-memory document store. The `DashMap` entry API holds the shard lock
/// for the duration of the mutation closure, which gives every node its own
/// serialization point without a store-wide lock.
#[derive(Default)]
pub struct MemoryStore {
    nodes: DashMap<String, FleetNode>,
    hashrates: DashMap<String, VecDeque<HashrateSample>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn get_node(&self, system_id: &str) -> Result<Option<FleetNode>, StoreError> {
        Ok(self.nodes.get(system_id).map(|entry| entry.value().clone()))
    }

    async fn list_nodes(&self) -> Result<Vec<FleetNode>, StoreError> {
        let mut nodes: Vec<FleetNode> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.system_id.cmp(&b.system_id));
        Ok(nodes)
    }

    async fn update_node(
        &self,
        system_id: &str,
        mutate: Box<dyn for<'a> FnOnce(&'a mut FleetNode) + Send>,
    ) -> Result<FleetNode, StoreError> {
        let mut entry = self
            .nodes
            .get_mut(system_id)
            .ok_or_else(|| StoreError::NodeNotFound(system_id.to_owned()))?;
        mutate(entry.value_mut());
        entry.updated_at = Utc::now();
        Ok(entry.value().clone())
    }

    async fn update_or_insert_node(
        &self,
        system_id: &str,
        mutate: Box<dyn for<'a> FnOnce(&'a mut FleetNode, bool) + Send>,
    ) -> Result<FleetNode, StoreError> {
        let mut inserted = false;
        let mut entry = self.nodes.entry(system_id.to_owned()).or_insert_with(|| {
            inserted = true;
            FleetNode::new(system_id)
        });
        mutate(entry.value_mut(), inserted);
        entry.updated_at = Utc::now();
        Ok(entry.value().clone())
    }

    async fn append_hashrate(
        &self,
        system_id: &str,
        sample: HashrateSample,
        cap: usize,
    ) -> Result<(), StoreError> {
        let mut samples = self.hashrates.entry(system_id.to_owned()).or_default();
        samples.push_back(sample);
        while samples.len() > cap {
            samples.pop_front();
        }
        Ok(())
    }

    async fn hashrate_history(&self, system_id: &str) -> Result<Vec<HashrateSample>, StoreError> {
        Ok(self
            .hashrates
            .get(system_id)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DeviceType;

    fn sample(hashrate: f64) -> HashrateSample {
        HashrateSample {
            time: Utc::now(),
            device_type: DeviceType::Gpu,
            algorithm: "kawpow".to_owned(),
            hashrate,
        }
    }

    #[tokio::test]
    async fn hashrate_retention_evicts_oldest_first() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append_hashrate("AA:BB", sample(i as f64), 4)
                .await
                .unwrap();
        }

        let history = store.hashrate_history("AA:BB").await.unwrap();
        assert_eq!(history.len(), 4, "history must stay at the cap");
        assert_eq!(history[0].hashrate, 1.0, "oldest sample is evicted first");
        assert_eq!(history[3].hashrate, 4.0);
    }

    #[tokio::test]
    async fn hashrate_history_is_isolated_per_node() {
        let store = MemoryStore::new();
        store
            .append_hashrate("AA:BB", sample(1.0), 10)
            .await
            .unwrap();

        assert_eq!(store.hashrate_history("AA:BB").await.unwrap().len(), 1);
        assert!(store.hashrate_history("CC:DD").await.unwrap().is_empty());
    }
}
