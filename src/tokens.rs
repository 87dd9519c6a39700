//! Cached bearer token for outbound speed-node calls.
//!
//! The first enabled row of `hub_token` wins; when the table is empty the
//! configured global token is used. `refresh` drops the cached value so the
//! next call re-reads the table.

use parking_lot::Mutex;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use crate::db::entities::hub_token::{self, Entity as HubToken};
use crate::error::Result;

pub struct TokenCache {
    db: DatabaseConnection,
    fallback: String,
    cached: Mutex<Option<String>>,
}

impl TokenCache {
    pub fn new(db: DatabaseConnection, fallback: String) -> Self {
        Self {
            db,
            fallback,
            cached: Mutex::new(None),
        }
    }

    /// The token to attach to outbound calls; `None` when neither the table
    /// nor the config provides one.
    pub async fn current(&self) -> Result<Option<String>> {
        if let Some(token) = self.cached.lock().clone() {
            return Ok(non_empty(token));
        }
        let token = self.read_default().await?;
        *self.cached.lock() = Some(token.clone());
        Ok(non_empty(token))
    }

    /// Invalidate and re-read; returns the fresh token.
    pub async fn refresh(&self) -> Result<Option<String>> {
        *self.cached.lock() = None;
        self.current().await
    }

    async fn read_default(&self) -> Result<String> {
        let row = HubToken::find()
            .filter(hub_token::Column::Enabled.eq(true))
            .order_by_asc(hub_token::Column::Id)
            .one(&self.db)
            .await?;
        Ok(match row {
            Some(row) => row.token,
            None => self.fallback.clone(),
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use sea_orm::{ActiveModelTrait, Set};

    #[tokio::test]
    async fn test_falls_back_to_config_token() {
        let cache = TokenCache::new(test_db().await, "cfg-token".to_string());
        assert_eq!(cache.current().await.unwrap().as_deref(), Some("cfg-token"));
    }

    #[tokio::test]
    async fn test_empty_everywhere_is_none() {
        let cache = TokenCache::new(test_db().await, String::new());
        assert_eq!(cache.current().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_table_row_wins_after_refresh() {
        let db = test_db().await;
        let cache = TokenCache::new(db.clone(), "cfg-token".to_string());
        // Warm the cache with the fallback, then add a row.
        assert_eq!(cache.current().await.unwrap().as_deref(), Some("cfg-token"));
        hub_token::ActiveModel {
            token: Set("db-token".to_string()),
            enabled: Set(true),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();
        // Cached value sticks until refresh.
        assert_eq!(cache.current().await.unwrap().as_deref(), Some("cfg-token"));
        assert_eq!(cache.refresh().await.unwrap().as_deref(), Some("db-token"));
    }
}
