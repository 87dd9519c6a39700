//! Organization avatar persistence.
//!
//! Best-effort side effect of repo promotion: make sure the org has a row
//! and a downloaded avatar. Failures are logged by the caller and never
//! block promotion.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};

use crate::error::{Result, ServerError};
use crate::db::entities::organization::{self, Entity as Organization};

/// Where avatar bytes come from; swapped for a stub in tests.
#[async_trait]
pub trait AvatarSource: Send + Sync {
    async fn fetch(&self, org: &str) -> Result<Option<Bytes>>;
}

/// Scrapes the hub's org page for the avatar image.
pub struct HubAvatarSource {
    client: reqwest::Client,
    hub_base: String,
}

impl HubAvatarSource {
    pub fn new(hub_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            hub_base,
        }
    }
}

#[async_trait]
impl AvatarSource for HubAvatarSource {
    async fn fetch(&self, org: &str) -> Result<Option<Bytes>> {
        let page = self
            .client
            .get(format!("{}/{}", self.hub_base, org))
            .header("User-Agent", "Mozilla/5.0")
            .send()
            .await?;
        if !page.status().is_success() {
            return Ok(None);
        }
        let html = page.text().await?;
        let Some(url) = extract_avatar_url(&html) else {
            return Ok(None);
        };
        let img = self.client.get(&url).send().await?;
        if !img.status().is_success() {
            return Ok(None);
        }
        Ok(Some(img.bytes().await?))
    }
}

/// Finds the first avatar-CDN image URL in the org page.
fn extract_avatar_url(html: &str) -> Option<String> {
    let start = html.find("https://cdn-avatars.")?;
    let rest = &html[start..];
    let end = rest.find(|c| c == '"' || c == '\'' || c == ' ')?;
    Some(rest[..end].to_string())
}

pub struct OrgLogoService {
    db: DatabaseConnection,
    source: Arc<dyn AvatarSource>,
    avatar_dir: PathBuf,
}

impl OrgLogoService {
    pub fn new(db: DatabaseConnection, source: Arc<dyn AvatarSource>, avatar_dir: PathBuf) -> Self {
        Self {
            db,
            source,
            avatar_dir,
        }
    }

    /// Idempotent: an org that already has a row is left alone.
    pub async fn persist_org_logo(&self, org: &str) -> Result<()> {
        let existing = Organization::find()
            .filter(organization::Column::Name.eq(org))
            .one(&self.db)
            .await?;
        if existing.is_some() {
            return Ok(());
        }
        let Some(bytes) = self.source.fetch(org).await? else {
            return Err(ServerError::Upstream(format!(
                "no avatar found for org {org}"
            )));
        };
        let file_name = format!("_{org}_avatar.jpg");
        tokio::fs::create_dir_all(&self.avatar_dir).await?;
        tokio::fs::write(self.avatar_dir.join(&file_name), &bytes).await?;
        organization::ActiveModel {
            name: Set(org.to_string()),
            icon: Set(file_name),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        tracing::info!(org, "organization avatar persisted");
        Ok(())
    }

    /// Icon key for an org; empty when nothing has been scraped yet.
    pub async fn icon_for(&self, org: &str) -> Result<String> {
        Ok(Organization::find()
            .filter(organization::Column::Name.eq(org))
            .one(&self.db)
            .await?
            .map(|o| o.icon)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    struct FixedSource(Option<Bytes>);

    #[async_trait]
    impl AvatarSource for FixedSource {
        async fn fetch(&self, _org: &str) -> Result<Option<Bytes>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_extract_avatar_url() {
        let html = r#"<img class="rounded" src="https://cdn-avatars.example.com/v1/org.png" alt>"#;
        assert_eq!(
            extract_avatar_url(html).as_deref(),
            Some("https://cdn-avatars.example.com/v1/org.png")
        );
        assert_eq!(extract_avatar_url("<html></html>"), None);
    }

    #[tokio::test]
    async fn test_persist_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("avatars-{}", std::process::id()));
        let svc = OrgLogoService::new(
            test_db().await,
            Arc::new(FixedSource(Some(Bytes::from_static(b"jpg")))),
            dir.clone(),
        );
        svc.persist_org_logo("acme").await.unwrap();
        svc.persist_org_logo("acme").await.unwrap();
        assert_eq!(svc.icon_for("acme").await.unwrap(), "_acme_avatar.jpg");
        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test]
    async fn test_missing_avatar_is_an_error_without_row() {
        let svc = OrgLogoService::new(
            test_db().await,
            Arc::new(FixedSource(None)),
            std::env::temp_dir(),
        );
        assert!(svc.persist_org_logo("ghost").await.is_err());
        assert_eq!(svc.icon_for("ghost").await.unwrap(), "");
    }
}
