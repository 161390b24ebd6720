//! HTTP client for the data-plane admin API.
//!
//! Database and cache operations are keyed by target name:
//!
//! - `POST /v1/targets/{name}/failover`
//! - `GET  /v1/targets/{name}/replication` returns `{"in_sync": bool}`
//! - `POST /v1/targets/{name}/cache/flush`
//! - `GET  /v1/targets/{name}/cache/flush` returns `{"complete": bool}`
//! - `POST /v1/targets/{name}/optimize`

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::services::{DataPlaneService, FailoverParams, FlushParams, OptimizeParams, Target};

#[derive(Debug, Deserialize)]
struct ReplicationStatus {
    in_sync: bool,
}

#[derive(Debug, Deserialize)]
struct FlushStatus {
    complete: bool,
}

/// [`DataPlaneService`] over HTTP.
pub struct HttpDataPlane {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDataPlane {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, target: &Target, path: &str) -> String {
        format!("{}/v1/targets/{}/{path}", self.base_url, target.name)
    }

    async fn post<B: Serialize + Sync>(&self, target: &Target, path: &str, body: &B) -> Result<()> {
        let url = self.url(target, path);
        debug!(url = %url, "Data-plane request");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to call {url}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("{path} for {} returned {status}: {body}", target.name);
        }
        Ok(())
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, target: &Target, path: &str) -> Result<T> {
        let url = self.url(target, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to call {url}"))?;

        if !response.status().is_success() {
            bail!("{path} for {} returned {}", target.name, response.status());
        }
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {path} response"))
    }
}

#[async_trait]
impl DataPlaneService for HttpDataPlane {
    async fn failover(&self, target: &Target, params: &FailoverParams) -> Result<()> {
        self.post(target, "failover", params).await?;
        info!(target = %target.name, replica = ?params.replica, "Failover requested");
        Ok(())
    }

    async fn replication_in_sync(&self, target: &Target) -> Result<bool> {
        let status: ReplicationStatus = self.get(target, "replication").await?;
        Ok(status.in_sync)
    }

    async fn flush_cache(&self, target: &Target, params: &FlushParams) -> Result<()> {
        self.post(target, "cache/flush", params).await?;
        info!(target = %target.name, pattern = ?params.pattern, "Cache flush requested");
        Ok(())
    }

    async fn flush_complete(&self, target: &Target) -> Result<bool> {
        let status: FlushStatus = self.get(target, "cache/flush").await?;
        Ok(status.complete)
    }

    async fn optimize(&self, target: &Target, params: &OptimizeParams) -> Result<()> {
        self.post(target, "optimize", params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpDataPlane {
        HttpDataPlane::new(format!("{}/", server.uri()), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_failover_posts_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/targets/orders-db/failover"))
            .and(body_json(serde_json::json!({"wait_for_sync": true, "replica": "replica-2"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let params = FailoverParams {
            wait_for_sync: true,
            replica: Some("replica-2".to_string()),
        };
        client(&server)
            .failover(&Target::named("data", "orders-db"), &params)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/targets/cache/cache/flush"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"complete": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/targets/cache/replication"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"in_sync": false})))
            .mount(&server)
            .await;

        let data_plane = client(&server);
        let target = Target::named("data", "cache");
        assert!(data_plane.flush_complete(&target).await.unwrap());
        assert!(!data_plane.replication_in_sync(&target).await.unwrap());
    }

    #[tokio::test]
    async fn test_error_status_fails_operation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/targets/orders-db/optimize"))
            .respond_with(ResponseTemplate::new(409).set_body_string("vacuum already running"))
            .mount(&server)
            .await;

        let err = client(&server)
            .optimize(&Target::named("data", "orders-db"), &OptimizeParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("vacuum already running"));
    }
}
