//! Bing Webmaster `SubmitUrlbatch` client.
//!
//! One status code covers the whole call, so every URL in a request shares the
//! same classification. Bing has no deletion endpoint.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::{truncate_body, ApiResponse, IndexingApi};
use crate::messages::OutcomeResult;
use crate::model::{Engine, IndexAction};

/// Per-call ceiling we use; Bing itself accepts up to 500.
pub const BING_BATCH_LIMIT: usize = 100;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitUrlBatch<'a> {
    site_url: &'a str,
    url_list: &'a [String],
}

/// Normalize a shop URL to the `http://www.host` form Bing keys sites by.
///
/// ```
/// use indexing_pipeline::engines::bing::normalize_site_url;
///
/// assert_eq!(normalize_site_url("https://example.com/"), "http://www.example.com");
/// assert_eq!(normalize_site_url("www.example.com"), "http://www.example.com");
/// ```
pub fn normalize_site_url(raw: &str) -> String {
    let host = raw
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    if host.starts_with("www.") {
        format!("http://{}", host)
    } else {
        format!("http://www.{}", host)
    }
}

pub struct BingClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    site_url: String,
}

impl BingClient {
    pub fn new(client: reqwest::Client, endpoint: &str, api_key: &str, site_url: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            site_url: normalize_site_url(site_url),
        }
    }

    pub fn site_url(&self) -> &str {
        &self.site_url
    }
}

#[async_trait]
impl IndexingApi for BingClient {
    fn engine(&self) -> Engine {
        Engine::Bing
    }

    fn batch_limit(&self) -> usize {
        BING_BATCH_LIMIT
    }

    async fn submit_batch(&self, urls: &[String], action: IndexAction) -> Vec<ApiResponse> {
        if action != IndexAction::Index {
            return urls
                .iter()
                .map(|u| ApiResponse::local(u, OutcomeResult::Invalid, format!("bing does not support {}", action)))
                .collect();
        }
        if urls.is_empty() {
            return Vec::new();
        }

        let body = SubmitUrlBatch { site_url: &self.site_url, url_list: urls };
        let sent = self
            .client
            .post(&self.endpoint)
            .query(&[("apikey", self.api_key.as_str())])
            .json(&body)
            .send()
            .await;

        let (status, message) = match sent {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                (Some(status), truncate_body(&text))
            }
            Err(e) => {
                warn!(site = %self.site_url, urls = urls.len(), error = %e, "Bing request failed");
                (None, e.to_string())
            }
        };

        debug!(site = %self.site_url, urls = urls.len(), status = ?status, "Bing batch submitted");
        urls.iter()
            .map(|u| ApiResponse::from_status(u, status, message.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://shop.example/p/{}", i)).collect()
    }

    fn client(server: &MockServer) -> BingClient {
        BingClient::new(
            reqwest::Client::new(),
            &format!("{}/SubmitUrlbatch", server.uri()),
            "key-1",
            "https://shop.example/",
        )
    }

    #[test]
    fn test_normalize_site_url() {
        assert_eq!(normalize_site_url("http://shop.example"), "http://www.shop.example");
        assert_eq!(normalize_site_url("https://www.shop.example///"), "http://www.shop.example");
    }

    #[tokio::test]
    async fn test_success_applies_to_every_url() {
        let server = MockServer::start().await;
        let batch = urls(3);
        Mock::given(method("POST"))
            .and(path("/SubmitUrlbatch"))
            .and(query_param("apikey", "key-1"))
            .and(body_json(json!({"siteUrl": "http://www.shop.example", "urlList": batch})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"d": null})))
            .expect(1)
            .mount(&server)
            .await;

        let out = client(&server).submit_batch(&batch, IndexAction::Index).await;
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.result == OutcomeResult::Success));
        assert_eq!(out[2].url, batch[2]);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("ThrottleUser"))
            .mount(&server)
            .await;

        let out = client(&server).submit_batch(&urls(2), IndexAction::Index).await;
        assert!(out.iter().all(|r| r.result == OutcomeResult::RateLimited));
        assert_eq!(out[0].message, "ThrottleUser");
    }

    #[tokio::test]
    async fn test_delete_is_rejected_without_a_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let out = client(&server).submit_batch(&urls(1), IndexAction::Delete).await;
        assert_eq!(out[0].result, OutcomeResult::Invalid);
    }

    #[tokio::test]
    async fn test_connection_failure_is_transient() {
        let c = BingClient::new(reqwest::Client::new(), "http://127.0.0.1:1/SubmitUrlbatch", "k", "shop.example");
        let out = c.submit("https://shop.example/p/1", IndexAction::Index).await;
        assert_eq!(out.result, OutcomeResult::TransientError);
        assert_eq!(out.http_status, None);
    }
}
