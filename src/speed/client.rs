//! HTTP client for scheduler → speed-node calls.
//!
//! Every call goes through the fixed-delay retry policy from config and
//! carries a bearer token when one is configured. Responses are captured
//! whole (status, headers, body); proxy handlers forward them verbatim.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::config::RetryConfig;
use crate::error::{Result, ServerError};

/// Upstream repo metadata as served by a speed node's `/api/{datatype}/{org}/{repo}`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RepoMeta {
    #[serde(default)]
    pub pipeline_tag: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub likes: i32,
    #[serde(default)]
    pub downloads: i32,
    #[serde(default, rename = "lastModified")]
    pub last_modified: String,
    #[serde(default)]
    pub siblings: Vec<Sibling>,
    #[serde(default, rename = "usedStorage")]
    pub used_storage: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Sibling {
    pub rfilename: String,
}

/// One job's in-flight throughput and progress, from `/api/cacheJob/realtime`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEntry {
    #[serde(default)]
    pub stock_speed: String,
    #[serde(default)]
    pub stock_process: f64,
}

/// A captured node response, forwardable as-is.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ServerError::Upstream(format!("node response decode error: {e}")))
    }
}

pub struct SpeedClient {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl SpeedClient {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            retry,
        }
    }

    /// GET `{base}/api/{datatype}/{org}/{repo}[/revision/{rev}]`.
    pub async fn repo_meta(
        &self,
        base: &str,
        datatype: &str,
        org_repo: &str,
        revision: Option<&str>,
        token: Option<&str>,
    ) -> Result<RawResponse> {
        let uri = match revision {
            Some(rev) => format!("{base}/api/{datatype}/{org_repo}/revision/{rev}"),
            None => format!("{base}/api/{datatype}/{org_repo}"),
        };
        self.get_with_retry(&uri, token).await
    }

    /// GET `{base}/{datatype}/{org_repo}/resolve/{sha}/README.md`.
    pub async fn repo_card(
        &self,
        base: &str,
        datatype: &str,
        org_repo: &str,
        sha: &str,
        token: Option<&str>,
    ) -> Result<RawResponse> {
        let uri = format!("{base}/{datatype}/{org_repo}/resolve/{sha}/README.md");
        self.get_with_retry(&uri, token).await
    }

    /// GET `{base}/api/{datatype}/{org_repo}/files/{sha}/[{path}]`.
    pub async fn repo_files(
        &self,
        base: &str,
        datatype: &str,
        org_repo: &str,
        sha: &str,
        file_path: &str,
        token: Option<&str>,
    ) -> Result<RawResponse> {
        let mut uri = format!("{base}/api/{datatype}/{org_repo}/files/{sha}/");
        uri.push_str(file_path);
        self.get_with_retry(&uri, token).await
    }

    pub async fn cache_job_create<T: Serialize>(
        &self,
        base: &str,
        body: &T,
        token: Option<&str>,
    ) -> Result<RawResponse> {
        self.post_with_retry(&format!("{base}/api/cacheJob/create"), body, token)
            .await
    }

    pub async fn cache_job_stop<T: Serialize>(
        &self,
        base: &str,
        body: &T,
        token: Option<&str>,
    ) -> Result<RawResponse> {
        self.post_with_retry(&format!("{base}/api/cacheJob/stop"), body, token)
            .await
    }

    pub async fn cache_job_resume<T: Serialize>(
        &self,
        base: &str,
        body: &T,
        token: Option<&str>,
    ) -> Result<RawResponse> {
        self.post_with_retry(&format!("{base}/api/cacheJob/resume"), body, token)
            .await
    }

    /// Fan out one realtime query for a batch of job ids.
    pub async fn cache_job_realtime(
        &self,
        base: &str,
        job_ids: &[i64],
        token: Option<&str>,
    ) -> Result<HashMap<i64, RealtimeEntry>> {
        let body = serde_json::json!({ "jobIds": job_ids });
        let resp = self
            .post_with_retry(&format!("{base}/api/cacheJob/realtime"), &body, token)
            .await?;
        if resp.status != 200 {
            return Err(ServerError::Upstream(format!(
                "realtime status returned {}",
                resp.status
            )));
        }
        resp.json()
    }

    async fn get_with_retry(&self, uri: &str, token: Option<&str>) -> Result<RawResponse> {
        self.with_retry(|| {
            let mut req = self.client.get(uri);
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            async move { capture(req.send().await?).await }
        })
        .await
    }

    async fn post_with_retry<T: Serialize>(
        &self,
        uri: &str,
        body: &T,
        token: Option<&str>,
    ) -> Result<RawResponse> {
        self.with_retry(|| {
            let mut req = self.client.post(uri).json(body);
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            async move { capture(req.send().await?).await }
        })
        .await
    }

    /// Fixed-delay retry; only transport errors are retried, any HTTP status
    /// is a completed exchange.
    async fn with_retry<F, Fut>(&self, f: F) -> Result<RawResponse>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<RawResponse>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(self.retry.delay_secs)).await;
            }
            match f().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    tracing::warn!("speed node call failed (attempt {}): {e}", attempt + 1);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ServerError::Upstream("no attempts made".to_string())))
    }
}

async fn capture(resp: reqwest::Response) -> Result<RawResponse> {
    let status = resp.status().as_u16();
    let headers = header_pairs(resp.headers());
    let body = resp.bytes().await?;
    Ok(RawResponse {
        status,
        headers,
        body,
    })
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_string(), v.to_string()))
        })
        .filter(|(k, _)| k != "transfer-encoding" && k != "connection")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_meta_decodes_hub_shape() {
        let body = br#"{
            "sha": "abc123",
            "pipeline_tag": "text-generation",
            "tags": ["pytorch", "llama"],
            "likes": 12,
            "downloads": 340,
            "lastModified": "2025-05-01T10:00:00.000Z",
            "siblings": [{"rfilename": "config.json"}, {"rfilename": "model.bin"}],
            "usedStorage": 123456
        }"#;
        let resp = RawResponse {
            status: 200,
            headers: vec![],
            body: Bytes::from_static(body),
        };
        let meta: RepoMeta = resp.json().unwrap();
        assert_eq!(meta.sha, "abc123");
        assert_eq!(meta.siblings.len(), 2);
        assert_eq!(meta.pipeline_tag, "text-generation");
        assert_eq!(meta.used_storage, 123456);
    }

    #[test]
    fn test_repo_meta_tolerates_missing_fields() {
        let resp = RawResponse {
            status: 200,
            headers: vec![],
            body: Bytes::from_static(b"{\"sha\": \"x\"}"),
        };
        let meta: RepoMeta = resp.json().unwrap();
        assert!(meta.siblings.is_empty());
        assert_eq!(meta.likes, 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_error() {
        // Nothing listens on this port; every attempt is a transport error.
        let client = SpeedClient::new(RetryConfig {
            delay_secs: 0,
            attempts: 2,
        });
        let err = client
            .repo_meta("http://127.0.0.1:9", "models", "o/r", None, None)
            .await;
        assert!(err.is_err());
    }
}
