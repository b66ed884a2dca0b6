//! Subdomain routing table

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Maps one public subdomain to the agent serving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub subdomain: String,
    pub project_id: String,
    pub agent_id: String,
    /// Port of the local application behind the agent
    pub local_port: u16,
}

/// Routing lookup errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Routing store error: {0}")]
    Store(String),

    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(String),
}

/// Source of routing entries, queried on every public request
#[async_trait]
pub trait RoutingTable: Send + Sync {
    async fn resolve(&self, subdomain: &str) -> Result<Option<RoutingEntry>, RoutingError>;

    /// Insert or replace the entry for `entry.subdomain`
    async fn upsert(&self, entry: RoutingEntry) -> Result<(), RoutingError>;

    /// Returns true if an entry was removed
    async fn remove(&self, subdomain: &str) -> Result<bool, RoutingError>;

    async fn list(&self) -> Result<Vec<RoutingEntry>, RoutingError>;
}

/// In-memory routing table
#[derive(Debug, Default)]
pub struct MemoryRoutingTable {
    entries: DashMap<String, RoutingEntry>,
}

impl MemoryRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoutingTable for MemoryRoutingTable {
    async fn resolve(&self, subdomain: &str) -> Result<Option<RoutingEntry>, RoutingError> {
        Ok(self.entries.get(subdomain).map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, entry: RoutingEntry) -> Result<(), RoutingError> {
        debug!(
            "Routing {} -> agent {} (port {})",
            entry.subdomain, entry.agent_id, entry.local_port
        );
        self.entries.insert(entry.subdomain.clone(), entry);
        Ok(())
    }

    async fn remove(&self, subdomain: &str) -> Result<bool, RoutingError> {
        Ok(self.entries.remove(subdomain).is_some())
    }

    async fn list(&self) -> Result<Vec<RoutingEntry>, RoutingError> {
        let mut entries: Vec<RoutingEntry> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(subdomain: &str, agent: &str) -> RoutingEntry {
        RoutingEntry {
            subdomain: subdomain.to_string(),
            project_id: "proj-1".to_string(),
            agent_id: agent.to_string(),
            local_port: 3000,
        }
    }

    #[tokio::test]
    async fn test_upsert_resolve_remove() {
        let table = MemoryRoutingTable::new();
        assert_eq!(table.resolve("blog-alice").await.unwrap(), None);

        table.upsert(entry("blog-alice", "agent-1")).await.unwrap();
        table.upsert(entry("blog-alice", "agent-2")).await.unwrap();
        let resolved = table.resolve("blog-alice").await.unwrap().unwrap();
        assert_eq!(resolved.agent_id, "agent-2");

        assert!(table.remove("blog-alice").await.unwrap());
        assert!(!table.remove("blog-alice").await.unwrap());
        assert_eq!(table.resolve("blog-alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let table = MemoryRoutingTable::new();
        table.upsert(entry("shop-bob", "agent-2")).await.unwrap();
        table.upsert(entry("blog-alice", "agent-1")).await.unwrap();

        let names: Vec<String> = table
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.subdomain)
            .collect();
        assert_eq!(names, vec!["blog-alice", "shop-bob"]);
    }
}
