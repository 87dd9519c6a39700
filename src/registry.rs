//! Node registry: speed-node registration, heartbeats, endpoint lookup.
//!
//! Rows are keyed by `(instance_id, online)` and cached read-through for the
//! heartbeat window, so the scheduler's hot path rarely touches the database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    Set,
};

use crate::cache::{speed_key, TtlCache};
use crate::db::entities::speed_node::{self, Entity as SpeedNode};
use crate::error::{Result, ServerError};

pub struct NodeRegistry {
    db: DatabaseConnection,
    cache: Arc<TtlCache<speed_node::Model>>,
    speed_ttl: Duration,
    heartbeat_gap: chrono::Duration,
}

impl NodeRegistry {
    pub fn new(
        db: DatabaseConnection,
        cache: Arc<TtlCache<speed_node::Model>>,
        speed_ttl: Duration,
        heartbeat_gap: chrono::Duration,
    ) -> Self {
        Self {
            db,
            cache,
            speed_ttl,
            heartbeat_gap,
        }
    }

    /// Upsert by `(instance_id, online)`; returns the row id.
    pub async fn register(
        &self,
        instance_id: &str,
        host: &str,
        port: i32,
        online: bool,
    ) -> Result<i32> {
        if instance_id.is_empty() || host.is_empty() || port <= 0 {
            return Err(ServerError::InvalidParam(
                "instance_id, host and port are required".to_string(),
            ));
        }
        let now = Utc::now();
        let existing = self.find_entity(instance_id, online).await?;
        let id = match existing {
            Some(row) => {
                let mut active: speed_node::ActiveModel = row.into();
                active.host = Set(host.to_string());
                active.port = Set(port);
                active.updated_at = Set(now);
                let updated = active.update(&self.db).await?;
                updated.id
            }
            None => {
                let active = speed_node::ActiveModel {
                    instance_id: Set(instance_id.to_string()),
                    host: Set(host.to_string()),
                    port: Set(port),
                    online: Set(online),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };
                let inserted = active.insert(&self.db).await?;
                inserted.id
            }
        };
        self.refresh_cache(instance_id, online).await;
        tracing::info!(instance_id, host, port, online, "speed node registered");
        Ok(id)
    }

    /// Bump the freshness timestamp. Registry calls never retry; a lost
    /// heartbeat just costs freshness until the next one.
    pub async fn heartbeat(&self, id: i32, instance_id: &str, online: bool) -> Result<()> {
        if id <= 0 {
            return Err(ServerError::InvalidParam(format!(
                "speed node id is unlawful: {id}"
            )));
        }
        let active = speed_node::ActiveModel {
            id: Set(id),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        active.update(&self.db).await?;
        self.refresh_cache(instance_id, online).await;
        Ok(())
    }

    /// The single "where to talk to this instance" source of truth: the
    /// online row if present, else the offline row, else a database read.
    pub async fn get_best(&self, instance_id: &str) -> Result<Option<speed_node::Model>> {
        if let Some(node) = self.cache.get(&speed_key(instance_id, true)) {
            return Ok(Some(node));
        }
        if let Some(node) = self.cache.get(&speed_key(instance_id, false)) {
            return Ok(Some(node));
        }
        for online in [true, false] {
            if let Some(node) = self.find_entity(instance_id, online).await? {
                self.cache
                    .insert(speed_key(instance_id, online), node.clone(), self.speed_ttl);
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Strict lookup of the online row; proxy paths require it.
    pub async fn get_online(&self, instance_id: &str) -> Result<speed_node::Model> {
        if let Some(node) = self.cache.get(&speed_key(instance_id, true)) {
            return Ok(node);
        }
        match self.find_entity(instance_id, true).await? {
            Some(node) => {
                self.cache
                    .insert(speed_key(instance_id, true), node.clone(), self.speed_ttl);
                Ok(node)
            }
            None => Err(ServerError::NotRegistered(instance_id.to_string())),
        }
    }

    pub async fn count_online(&self) -> Result<u64> {
        Ok(SpeedNode::find()
            .filter(speed_node::Column::Online.eq(true))
            .count(&self.db)
            .await?)
    }

    pub fn is_fresh(&self, updated_at: chrono::DateTime<Utc>) -> bool {
        Utc::now() - updated_at <= self.heartbeat_gap
    }

    pub fn base_url(node: &speed_node::Model) -> String {
        format!("http://{}:{}", node.host, node.port)
    }

    async fn find_entity(
        &self,
        instance_id: &str,
        online: bool,
    ) -> Result<Option<speed_node::Model>> {
        Ok(SpeedNode::find()
            .filter(speed_node::Column::InstanceId.eq(instance_id))
            .filter(speed_node::Column::Online.eq(online))
            .one(&self.db)
            .await?)
    }

    async fn refresh_cache(&self, instance_id: &str, online: bool) {
        match self.find_entity(instance_id, online).await {
            Ok(Some(node)) => {
                self.cache
                    .insert(speed_key(instance_id, online), node, self.speed_ttl);
            }
            Ok(None) => {}
            Err(e) => tracing::error!(instance_id, online, "cache refresh failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    async fn registry() -> NodeRegistry {
        NodeRegistry::new(
            test_db().await,
            Arc::new(TtlCache::new()),
            Duration::from_secs(300),
            chrono::Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn test_register_validates_params() {
        let reg = registry().await;
        assert!(reg.register("", "h", 1, true).await.is_err());
        assert!(reg.register("i", "", 1, true).await.is_err());
        assert!(reg.register("i", "h", 0, true).await.is_err());
    }

    #[tokio::test]
    async fn test_register_heartbeat_roundtrip() {
        let reg = registry().await;
        let id = reg.register("node-a", "h1", 9000, true).await.unwrap();
        assert!(id > 0);
        reg.heartbeat(id, "node-a", true).await.unwrap();
        let best = reg.get_best("node-a").await.unwrap().unwrap();
        assert_eq!(best.host, "h1");
        assert_eq!(best.port, 9000);
        assert!(reg.is_fresh(best.updated_at));
    }

    #[tokio::test]
    async fn test_register_upserts_endpoint() {
        let reg = registry().await;
        let id1 = reg.register("node-a", "h1", 9000, true).await.unwrap();
        let id2 = reg.register("node-a", "h2", 9001, true).await.unwrap();
        assert_eq!(id1, id2);
        let best = reg.get_best("node-a").await.unwrap().unwrap();
        assert_eq!((best.host.as_str(), best.port), ("h2", 9001));
    }

    #[tokio::test]
    async fn test_online_and_offline_rows_coexist() {
        let reg = registry().await;
        let id_on = reg.register("node-a", "h1", 9000, true).await.unwrap();
        let id_off = reg.register("node-a", "h9", 9900, false).await.unwrap();
        assert_ne!(id_on, id_off);
        // Online row wins.
        let best = reg.get_best("node-a").await.unwrap().unwrap();
        assert_eq!(best.port, 9000);
    }

    #[tokio::test]
    async fn test_get_best_falls_back_to_offline() {
        let reg = registry().await;
        reg.register("node-a", "h9", 9900, false).await.unwrap();
        let best = reg.get_best("node-a").await.unwrap().unwrap();
        assert_eq!(best.port, 9900);
        assert!(reg.get_online("node-a").await.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_rejects_bad_id() {
        let reg = registry().await;
        assert!(reg.heartbeat(0, "node-a", true).await.is_err());
        assert!(reg.heartbeat(-3, "node-a", true).await.is_err());
    }

    #[tokio::test]
    async fn test_get_online_requires_registration() {
        let reg = registry().await;
        match reg.get_online("ghost").await {
            Err(ServerError::NotRegistered(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected NotRegistered, got {other:?}"),
        }
    }
}
