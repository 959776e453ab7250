//! Hash-ring membership for this process.
//!
//! Each worker registers V virtual nodes at startup and derives its claim
//! ranges from the sorted ring on every pass, so membership churn is picked
//! up without coordination beyond the shared table.

use crate::db::errors::Result;
use crate::db::handlers::HashRing;
use crate::db::Database;
use crate::hashing::{self, HashRange};

/// Virtual nodes registered per worker.
pub const VIRTUAL_NODES: u32 = 128;

#[derive(Debug, Clone)]
pub struct Membership {
    node_name: String,
    virtual_keys: Vec<i64>,
}

impl Membership {
    pub fn new(node_name: String) -> Self {
        let virtual_keys = (0..VIRTUAL_NODES)
            .map(|virtual_id| hashing::virtual_node_hash(&node_name, virtual_id))
            .collect();
        Self { node_name, virtual_keys }
    }

    /// `{hostname}-{suffix}`: stable for the process lifetime, distinct
    /// across restarts so an old registration never collides with a new one.
    pub fn generate_node_name() -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{host}-{}", &suffix[..8])
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn virtual_keys(&self) -> &[i64] {
        &self.virtual_keys
    }

    /// Insert every virtual node. Idempotent: re-running on restart with the
    /// same name is a no-op per virtual.
    pub async fn register(&self, db: &Database) -> Result<()> {
        let mut conn = db.pool().acquire().await?;
        let mut ring = HashRing::new(&mut conn);
        for (virtual_id, key) in self.virtual_keys.iter().enumerate() {
            ring.register(&self.node_name, virtual_id as i32, *key).await?;
        }
        tracing::info!(
            node = %self.node_name,
            virtual_nodes = self.virtual_keys.len(),
            "Registered node in hash ring"
        );
        Ok(())
    }

    /// This node's claim ranges under the current ring.
    pub async fn ranges(&self, db: &Database) -> Result<Vec<HashRange>> {
        let mut conn = db.pool().acquire().await?;
        let members = HashRing::new(&mut conn).sorted_ring().await?;
        let ring: Vec<i64> = members.iter().map(|m| m.hash_key).collect();
        Ok(hashing::node_ranges(&self.virtual_keys, &ring))
    }
}
