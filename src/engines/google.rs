// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Google Indexing API client.
//!
//! Authentication is the OAuth2 service-account flow: an RS256 JWT signed with the
//! shop's service-account key is exchanged for a bearer token, which is cached
//! until shortly before it expires.
//!
//! A single URL goes to `POST /v3/urlNotifications:publish`. Several URLs go out
//! as one `multipart/mixed` request to `POST /batch`, one embedded HTTP request per
//! part, and each part of the response carries its own status line:
//!
//! ```text
//! --batch_7c1e
//! Content-Type: application/http
//! Content-ID: <response-item2>
//!
//! HTTP/1.1 429 Too Many Requests
//! Content-Type: application/json; charset=UTF-8
//!
//! {"error": {"code": 429, "message": "Quota exceeded ..."}}
//! --batch_7c1e--
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{truncate_body, ApiError, ApiResponse, IndexingApi};
use crate::model::{Engine, IndexAction};

pub const INDEXING_SCOPE: &str = "https://www.googleapis.com/auth/indexing";
pub const GOOGLE_BATCH_LIMIT: usize = 100;
const PUBLISH_PATH: &str = "/v3/urlNotifications:publish";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Refresh this long before the token actually expires.
const TOKEN_SKEW: Duration = Duration::from_secs(60);

/// The fields of a service-account JSON key file we need.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl ServiceAccountKey {
    /// Parse and check a key file; the PEM must load as an RSA signing key.
    pub fn parse(json: &str) -> Result<Self, ApiError> {
        let invalid = |reason: String| ApiError::Credential { engine: Engine::Google, reason };
        let key: Self = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        if key.client_email.is_empty() {
            return Err(invalid("missing client_email".into()));
        }
        EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        Ok(key)
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    TOKEN_LIFETIME_SECS as u64
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Access tokens keyed by service-account email, shared across clients.
#[derive(Default)]
pub struct TokenCache {
    tokens: DashMap<String, CachedToken>,
}

impl TokenCache {
    fn get(&self, account: &str) -> Option<String> {
        self.tokens
            .get(account)
            .filter(|t| t.expires_at > Instant::now() + TOKEN_SKEW)
            .map(|t| t.token.clone())
    }

    fn put(&self, account: &str, token: String, ttl: Duration) {
        self.tokens.insert(
            account.to_string(),
            CachedToken { token, expires_at: Instant::now() + ttl },
        );
    }

    pub fn invalidate(&self, account: &str) {
        self.tokens.remove(account);
    }
}

/// Failure to obtain a token, expressed the way every URL will see it.
struct TokenFailure {
    status: Option<u16>,
    message: String,
}

pub struct GoogleClient {
    client: reqwest::Client,
    key: ServiceAccountKey,
    token_url: String,
    api_base: String,
    tokens: std::sync::Arc<TokenCache>,
}

impl GoogleClient {
    pub fn new(
        client: reqwest::Client,
        key: ServiceAccountKey,
        token_url: &str,
        api_base: &str,
        tokens: std::sync::Arc<TokenCache>,
    ) -> Self {
        Self {
            client,
            key,
            token_url: token_url.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn assertion(&self) -> Result<String, TokenFailure> {
        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: INDEXING_SCOPE,
            aud: &self.token_url,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();

        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| TokenFailure { status: Some(401), message: e.to_string() })?;
        encode(&header, &claims, &signing_key)
            .map_err(|e| TokenFailure { status: Some(401), message: e.to_string() })
    }

    async fn access_token(&self) -> Result<String, TokenFailure> {
        if let Some(token) = self.tokens.get(&self.key.client_email) {
            return Ok(token);
        }

        let assertion = self.assertion()?;
        let response = self
            .client
            .post(&self.token_url)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| TokenFailure { status: None, message: format!("token request failed: {}", e) })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // invalid_grant and friends come back as 400; treat any refusal as a permission problem
            let mapped = if status.is_client_error() && status.as_u16() != 429 { 401 } else { status.as_u16() };
            return Err(TokenFailure {
                status: Some(mapped),
                message: format!("token exchange rejected: {}", truncate_body(&body)),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenFailure { status: None, message: format!("bad token response: {}", e) })?;
        self.tokens.put(
            &self.key.client_email,
            token.access_token.clone(),
            Duration::from_secs(token.expires_in),
        );
        debug!(account = %self.key.client_email, "Fetched Google access token");
        Ok(token.access_token)
    }

    async fn publish_one(&self, token: &str, url: &str, action: IndexAction) -> ApiResponse {
        let body = serde_json::json!({ "url": url, "type": notification_type(action) });
        let sent = self
            .client
            .post(format!("{}{}", self.api_base, PUBLISH_PATH))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await;

        match sent {
            Ok(response) => {
                let status = response.status().as_u16();
                let text = response.text().await.unwrap_or_default();
                if status == 401 {
                    self.tokens.invalidate(&self.key.client_email);
                }
                let message = if (200..300).contains(&status) { String::new() } else { truncate_body(&text) };
                ApiResponse::from_status(url, Some(status), message)
            }
            Err(e) => ApiResponse::from_status(url, None, e.to_string()),
        }
    }

    async fn publish_batch(&self, token: &str, urls: &[String], action: IndexAction) -> Vec<ApiResponse> {
        let boundary = format!("batch_{}", uuid::Uuid::new_v4().simple());
        let body = build_batch_body(&boundary, urls, action);

        let sent = self
            .client
            .post(format!("{}/batch", self.api_base))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, format!("multipart/mixed; boundary={}", boundary))
            .body(body)
            .send()
            .await;

        let response = match sent {
            Ok(r) => r,
            Err(e) => {
                warn!(urls = urls.len(), error = %e, "Google batch request failed");
                return urls.iter().map(|u| ApiResponse::from_status(u, None, e.to_string())).collect();
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            if status.as_u16() == 401 {
                self.tokens.invalidate(&self.key.client_email);
            }
            let message = truncate_body(&text);
            return urls
                .iter()
                .map(|u| ApiResponse::from_status(u, Some(status.as_u16()), message.clone()))
                .collect();
        }

        let parts = match boundary_of(&content_type) {
            Some(b) => parse_batch_response(&b, &text),
            None => HashMap::new(),
        };

        urls.iter()
            .enumerate()
            .map(|(i, url)| match parts.get(&(i + 1)) {
                Some(part) => {
                    let message = if (200..300).contains(&part.status) { String::new() } else { truncate_body(&part.body) };
                    ApiResponse::from_status(url, Some(part.status), message)
                }
                None => ApiResponse::from_status(url, None, "missing part in batch response"),
            })
            .collect()
    }
}

fn notification_type(action: IndexAction) -> &'static str {
    match action {
        IndexAction::Delete => "URL_DELETED",
        _ => "URL_UPDATED",
    }
}

/// Build the `multipart/mixed` body; parts are numbered `item1..itemN`.
fn build_batch_body(boundary: &str, urls: &[String], action: IndexAction) -> String {
    let mut body = String::new();
    for (i, url) in urls.iter().enumerate() {
        let payload = serde_json::json!({ "url": url, "type": notification_type(action) }).to_string();
        body.push_str(&format!(
            "--{boundary}\r\n\
             Content-Type: application/http\r\n\
             Content-ID: <item{n}>\r\n\
             \r\n\
             POST {path}\r\n\
             Content-Type: application/json\r\n\
             accept: application/json\r\n\
             \r\n\
             {payload}\r\n",
            boundary = boundary,
            n = i + 1,
            path = PUBLISH_PATH,
            payload = payload,
        ));
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    body
}

fn boundary_of(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        name.eq_ignore_ascii_case("boundary")
            .then(|| value.trim_matches('"').to_string())
    })
}

#[derive(Debug, PartialEq, Eq)]
struct BatchPart {
    status: u16,
    body: String,
}

/// Map of part number (from `Content-ID: <response-itemN>`) to its embedded response.
fn parse_batch_response(boundary: &str, body: &str) -> HashMap<usize, BatchPart> {
    let delimiter = format!("--{}", boundary);
    let mut parts = HashMap::new();

    for raw in body.split(delimiter.as_str()) {
        let mut lines = raw.lines();
        let mut item = None;
        let mut status = None;

        for line in lines.by_ref() {
            let line = line.trim();
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-id") {
                    item = value
                        .trim()
                        .trim_matches(|c| c == '<' || c == '>')
                        .rsplit("item")
                        .next()
                        .and_then(|n| n.parse::<usize>().ok());
                }
            }
            if line.starts_with("HTTP/") {
                status = line.split_whitespace().nth(1).and_then(|s| s.parse::<u16>().ok());
                break;
            }
        }

        // Embedded response headers, then the body
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
        }
        let text: Vec<&str> = lines.collect();

        if let (Some(n), Some(code)) = (item, status) {
            parts.insert(n, BatchPart { status: code, body: text.join("\n").trim().to_string() });
        }
    }
    parts
}

#[async_trait]
impl IndexingApi for GoogleClient {
    fn engine(&self) -> Engine {
        Engine::Google
    }

    fn batch_limit(&self) -> usize {
        GOOGLE_BATCH_LIMIT
    }

    async fn submit_batch(&self, urls: &[String], action: IndexAction) -> Vec<ApiResponse> {
        if urls.is_empty() {
            return Vec::new();
        }
        let token = match self.access_token().await {
            Ok(token) => token,
            Err(failure) => {
                warn!(account = %self.key.client_email, status = ?failure.status, "Google token unavailable");
                return urls
                    .iter()
                    .map(|u| ApiResponse::from_status(u, failure.status, failure.message.clone()))
                    .collect();
            }
        };

        if urls.len() == 1 {
            return vec![self.publish_one(&token, &urls[0], action).await];
        }
        self.publish_batch(&token, urls, action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::OutcomeResult;
    use std::sync::Arc;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_PEM: &str = include_str!("../../tests/fixtures/test_service_account.pem");

    fn key_json() -> String {
        serde_json::json!({
            "type": "service_account",
            "client_email": "indexer@demo.iam.gserviceaccount.com",
            "private_key": TEST_PEM,
            "private_key_id": "k1",
        })
        .to_string()
    }

    async fn client(server: &MockServer) -> GoogleClient {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant-type%3Ajwt-bearer"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "tok-1", "expires_in": 3600})),
            )
            .mount(server)
            .await;

        GoogleClient::new(
            reqwest::Client::new(),
            ServiceAccountKey::parse(&key_json()).unwrap(),
            &format!("{}/token", server.uri()),
            &server.uri(),
            Arc::new(TokenCache::default()),
        )
    }

    #[test]
    fn test_key_parse_rejects_garbage() {
        assert!(ServiceAccountKey::parse("{}").is_err());
        let bad_pem = serde_json::json!({"client_email": "a@b", "private_key": "nope"}).to_string();
        assert!(ServiceAccountKey::parse(&bad_pem).is_err());
        assert!(ServiceAccountKey::parse(&key_json()).is_ok());
    }

    #[test]
    fn test_batch_body_layout() {
        let urls = vec!["https://s/a".to_string(), "https://s/b".to_string()];
        let body = build_batch_body("xyz", &urls, IndexAction::Delete);
        assert_eq!(body.matches("--xyz\r\n").count(), 2);
        assert!(body.contains("Content-ID: <item2>"));
        assert!(body.contains("POST /v3/urlNotifications:publish"));
        assert!(body.contains(r#""type":"URL_DELETED""#));
        assert!(body.ends_with("--xyz--\r\n"));
    }

    #[test]
    fn test_boundary_parsing() {
        assert_eq!(boundary_of("multipart/mixed; boundary=batch_abc").as_deref(), Some("batch_abc"));
        assert_eq!(boundary_of("multipart/mixed; Boundary=\"q\"").as_deref(), Some("q"));
        assert_eq!(boundary_of("application/json"), None);
    }

    #[test]
    fn test_parse_batch_response_parts() {
        let body = "--b\r\nContent-Type: application/http\r\nContent-ID: <response-item1>\r\n\r\n\
                    HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"ok\":true}\r\n\
                    --b\r\nContent-Type: application/http\r\nContent-ID: <response-item2>\r\n\r\n\
                    HTTP/1.1 403 Forbidden\r\nContent-Type: application/json\r\n\r\n{\"error\":\"denied\"}\r\n--b--\r\n";
        let parts = parse_batch_response("b", body);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[&1].status, 200);
        assert_eq!(parts[&2], BatchPart { status: 403, body: "{\"error\":\"denied\"}".into() });
    }

    #[tokio::test]
    async fn test_single_publish() {
        let server = MockServer::start().await;
        let google = client(&server).await;
        Mock::given(method("POST"))
            .and(path("/v3/urlNotifications:publish"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"urlNotificationMetadata": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let r = google.submit("https://s/a", IndexAction::Index).await;
        assert_eq!(r.result, OutcomeResult::Success);
    }

    #[tokio::test]
    async fn test_batch_maps_each_part() {
        let server = MockServer::start().await;
        let google = client(&server).await;
        let body = "--resp\r\nContent-Type: application/http\r\nContent-ID: <response-item1>\r\n\r\n\
                    HTTP/1.1 200 OK\r\n\r\n{}\r\n\
                    --resp\r\nContent-Type: application/http\r\nContent-ID: <response-item2>\r\n\r\n\
                    HTTP/1.1 429 Too Many Requests\r\n\r\n{\"error\":{\"code\":429}}\r\n\
                    --resp\r\nContent-Type: application/http\r\nContent-ID: <response-item3>\r\n\r\n\
                    HTTP/1.1 403 Forbidden\r\n\r\n{\"error\":{\"code\":403}}\r\n--resp--\r\n";
        Mock::given(method("POST"))
            .and(path("/batch"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "multipart/mixed; boundary=resp"),
            )
            .mount(&server)
            .await;

        let urls: Vec<String> = ["a", "b", "c", "d"].iter().map(|p| format!("https://s/{}", p)).collect();
        let out = google.submit_batch(&urls, IndexAction::Index).await;
        let results: Vec<_> = out.iter().map(|r| r.result).collect();
        assert_eq!(
            results,
            vec![
                OutcomeResult::Success,
                OutcomeResult::RateLimited,
                OutcomeResult::PermissionDenied,
                OutcomeResult::TransientError,
            ]
        );
    }

    #[tokio::test]
    async fn test_token_refusal_is_permission_denied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
            .mount(&server)
            .await;
        let google = GoogleClient::new(
            reqwest::Client::new(),
            ServiceAccountKey::parse(&key_json()).unwrap(),
            &format!("{}/token", server.uri()),
            &server.uri(),
            Arc::new(TokenCache::default()),
        );

        let out = google.submit_batch(&["https://s/a".to_string(), "https://s/b".to_string()], IndexAction::Index).await;
        assert!(out.iter().all(|r| r.result == OutcomeResult::PermissionDenied));
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "tok-2"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/urlNotifications:publish"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let google = GoogleClient::new(
            reqwest::Client::new(),
            ServiceAccountKey::parse(&key_json()).unwrap(),
            &format!("{}/token", server.uri()),
            &server.uri(),
            Arc::new(TokenCache::default()),
        );
        google.submit("https://s/a", IndexAction::Index).await;
        google.submit("https://s/b", IndexAction::Delete).await;
    }
}
