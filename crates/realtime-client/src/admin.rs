//! HTTP client for the realtime server's administrative endpoints.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::types::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /stats` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub connections: u64,
    pub topics: u64,
    #[serde(default)]
    pub messages_published: Option<u64>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
}

/// `POST /broadcast` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResult {
    pub delivered_to: u64,
}

#[derive(Serialize)]
struct BroadcastRequest<'a> {
    topic: &'a str,
    payload: &'a Value,
}

/// Talks to the admin API with an elevated bearer token.
#[derive(Clone)]
pub struct AdminClient {
    client: Client,
    base_url: String,
    token: String,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>, admin_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(base_url = %base_url, "admin client initialized");
        Ok(Self {
            client,
            base_url,
            token: admin_token.into(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        self.client.request(method, url).bearer_auth(&self.token)
    }

    /// Connection and topic counts from the server.
    pub async fn server_stats(&self) -> Result<ServerStats> {
        let resp = self.request(reqwest::Method::GET, "/stats").send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, "stats request failed: {body}");
            return Err(Error::Admin {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    /// Deliver `payload` to every subscriber of `topic`, bypassing the client
    /// connection.
    pub async fn broadcast(&self, topic: &str, payload: &Value) -> Result<BroadcastResult> {
        let resp = self
            .request(reqwest::Method::POST, "/broadcast")
            .json(&BroadcastRequest { topic, payload })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, topic, "broadcast failed: {body}");
            return Err(Error::Admin {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn fetches_stats() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/admin/stats")
                    .header("authorization", "Bearer secret");
                then.status(200)
                    .json_body(json!({"connections": 3, "topics": 2, "uptimeSeconds": 60}));
            })
            .await;

        let admin = AdminClient::new(format!("{}/admin/", server.base_url()), "secret").unwrap();
        let stats = admin.server_stats().await.unwrap();
        mock.assert_async().await;
        assert_eq!(stats.connections, 3);
        assert_eq!(stats.topics, 2);
        assert_eq!(stats.messages_published, None);
        assert_eq!(stats.uptime_seconds, Some(60));
    }

    #[tokio::test]
    async fn broadcast_posts_topic_and_payload() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/broadcast")
                    .header("authorization", "Bearer secret")
                    .json_body(json!({"topic": "alerts", "payload": {"level": "high"}}));
                then.status(200).json_body(json!({"deliveredTo": 7}));
            })
            .await;

        let admin = AdminClient::new(server.base_url(), "secret").unwrap();
        let result = admin
            .broadcast("alerts", &json!({"level": "high"}))
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(result.delivered_to, 7);
    }

    #[tokio::test]
    async fn non_success_status_is_an_admin_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/broadcast");
                then.status(403).body("forbidden");
            })
            .await;

        let admin = AdminClient::new(server.base_url(), "wrong").unwrap();
        match admin.broadcast("alerts", &Value::Null).await {
            Err(Error::Admin { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body, "forbidden");
            }
            other => panic!("expected Admin error, got {other:?}"),
        }
    }
}
