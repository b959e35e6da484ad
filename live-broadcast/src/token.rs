//! Token Service client.
//!
//! Every fetch is a fresh request to the issuer. Nothing here caches; the
//! controller holds at most one live [`Token`] at a time.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::TokenError;
use crate::session::{ChannelId, ParticipantId};

/// Short-lived credential scoped to one channel/participant pair.
///
/// Not `Clone`: joining or renewing consumes the token, so a token is applied
/// at most once.
pub struct Token {
    value: String,
    issued_at: DateTime<Utc>,
}

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Token {}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

#[async_trait]
pub trait TokenService: Send + Sync {
    async fn fetch_token(
        &self,
        channel: &ChannelId,
        participant: &ParticipantId,
        is_subscriber: bool,
    ) -> Result<Token, TokenError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RtcTokenResponse {
    rtc_token: Option<String>,
}

/// Token issuer reached over HTTP.
///
/// `GET {base}/rtc/{channel}/{role}/uid/{uid}` answering `{"rtcToken": "..."}`.
#[derive(Clone)]
pub struct HttpTokenService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTokenService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TokenError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn token_url(&self, channel: &ChannelId, participant: &ParticipantId, is_subscriber: bool) -> String {
        let role = if is_subscriber { "subscriber" } else { "publisher" };
        format!(
            "{}/rtc/{}/{}/uid/{}",
            self.base_url,
            urlencoding::encode(channel.as_str()),
            role,
            urlencoding::encode(participant.as_str()),
        )
    }
}

#[async_trait]
impl TokenService for HttpTokenService {
    async fn fetch_token(
        &self,
        channel: &ChannelId,
        participant: &ParticipantId,
        is_subscriber: bool,
    ) -> Result<Token, TokenError> {
        let url = self.token_url(channel, participant, is_subscriber);
        tracing::debug!("Requesting token for channel {} uid {}", channel, participant);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected(body));
        }
        if !status.is_success() {
            return Err(TokenError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let parsed: RtcTokenResponse =
            serde_json::from_str(&body).map_err(|e| TokenError::Malformed(e.to_string()))?;
        match parsed.rtc_token {
            Some(value) if !value.is_empty() => Ok(Token::new(value)),
            _ => Err(TokenError::Malformed("missing rtcToken".to_string())),
        }
    }
}

/// Hands out one fixed credential, for projects running without an app
/// certificate where the engine accepts a static or empty token.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenService {
    value: String,
}

impl StaticTokenService {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait]
impl TokenService for StaticTokenService {
    async fn fetch_token(
        &self,
        _channel: &ChannelId,
        _participant: &ParticipantId,
        _is_subscriber: bool,
    ) -> Result<Token, TokenError> {
        Ok(Token::new(self.value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn issuer(hits: Arc<AtomicU32>) -> Router {
        Router::new().route(
            "/rtc/:channel/:role/uid/:uid",
            get(move |Path((channel, role, uid)): Path<(String, String, String)>| {
                let hits = hits.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(serde_json::json!({
                        "rtcToken": format!("{}:{}:{}:{}", channel, role, uid, n)
                    }))
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_fetches_publisher_token() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = serve(issuer(hits.clone())).await;
        let service = HttpTokenService::new(base, Duration::from_secs(5)).unwrap();

        let token = service
            .fetch_token(&ChannelId::new("shop-42"), &ParticipantId::new("seller-1"), false)
            .await
            .unwrap();
        assert_eq!(token.value(), "shop-42:publisher:seller-1:1");
    }

    #[tokio::test]
    async fn test_subscriber_role_and_no_caching() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = serve(issuer(hits.clone())).await;
        let service = HttpTokenService::new(format!("{}/", base), Duration::from_secs(5)).unwrap();
        let channel = ChannelId::new("shop-42");
        let participant = ParticipantId::new("viewer-9");

        let first = service.fetch_token(&channel, &participant, true).await.unwrap();
        let second = service.fetch_token(&channel, &participant, true).await.unwrap();
        assert_eq!(first.value(), "shop-42:subscriber:viewer-9:1");
        assert_eq!(second.value(), "shop-42:subscriber:viewer-9:2");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_is_percent_encoded() {
        let hits = Arc::new(AtomicU32::new(0));
        let base = serve(issuer(hits)).await;
        let service = HttpTokenService::new(base, Duration::from_secs(5)).unwrap();

        let token = service
            .fetch_token(&ChannelId::new("shop 42"), &ParticipantId::new("u1"), false)
            .await
            .unwrap();
        assert_eq!(token.value(), "shop 42:publisher:u1:1");
    }

    #[tokio::test]
    async fn test_server_error_is_status() {
        let app = Router::new().route(
            "/rtc/:channel/:role/uid/:uid",
            get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        );
        let base = serve(app).await;
        let service = HttpTokenService::new(base, Duration::from_secs(5)).unwrap();

        let err = service
            .fetch_token(&ChannelId::new("c"), &ParticipantId::new("u"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Status { status: 503 }));
    }

    #[tokio::test]
    async fn test_forbidden_is_rejected() {
        let app = Router::new().route(
            "/rtc/:channel/:role/uid/:uid",
            get(|| async { (StatusCode::FORBIDDEN, "channel closed") }),
        );
        let base = serve(app).await;
        let service = HttpTokenService::new(base, Duration::from_secs(5)).unwrap();

        let err = service
            .fetch_token(&ChannelId::new("c"), &ParticipantId::new("u"), false)
            .await
            .unwrap_err();
        match err {
            TokenError::Rejected(body) => assert_eq!(body, "channel closed"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_token_is_malformed() {
        let app = Router::new().route(
            "/rtc/:channel/:role/uid/:uid",
            get(|| async { Json(serde_json::json!({ "rtcToken": "" })) }),
        );
        let base = serve(app).await;
        let service = HttpTokenService::new(base, Duration::from_secs(5)).unwrap();

        let err = service
            .fetch_token(&ChannelId::new("c"), &ParticipantId::new("u"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_unreachable_issuer_is_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let service = HttpTokenService::new(format!("http://{}", addr), Duration::from_secs(2)).unwrap();
        let err = service
            .fetch_token(&ChannelId::new("c"), &ParticipantId::new("u"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Http(_)));
    }

    #[tokio::test]
    async fn test_static_service_returns_fixed_value() {
        let service = StaticTokenService::new("fixed");
        let token = service
            .fetch_token(&ChannelId::new("c"), &ParticipantId::new("u"), false)
            .await
            .unwrap();
        assert_eq!(token.value(), "fixed");
    }

    #[test]
    fn test_debug_redacts_value() {
        let token = Token::new("secret-credential");
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains("secret-credential"));
        assert!(rendered.contains("<redacted>"));
    }
}
