//! HTTP client for the deck vault API
//!
//! Two endpoints are used: the paginated deck search listing and the deck
//! detail view with its cards inlined. Both answer either with the payload
//! or with an error envelope `{"code": .., "message": .., "detail": ..}`.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::domain::{DeckDetail, DeckId, ListingPage};
use crate::infrastructure::config::VaultConfig;

/// Envelope code the vault uses for rate limiting
pub const CODE_THROTTLED: i64 = 429;

/// Envelope code the vault uses for server faults, including pages past the end
pub const CODE_UNAVAILABLE: i64 = 0;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("request throttled: {message}")]
    Throttled {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("unrecognized response code {code}: {message}")]
    UnrecognizedCode { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("found no decks named '{0}'")]
    NotFound(String),
}

/// Source of deck listings and deck details
#[async_trait]
pub trait DeckSource: Send + Sync + 'static {
    /// Deck ids on one listing page, newest first
    async fn list_page(&self, page: u32) -> Result<Vec<DeckId>, VaultError>;

    async fn fetch_deck(&self, id: &DeckId) -> Result<DeckDetail, VaultError>;
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

impl ErrorEnvelope {
    fn text(&self) -> String {
        let message = self.message.as_deref().unwrap_or_default();
        match &self.detail {
            Some(serde_json::Value::String(detail)) => format!("{message}{detail}"),
            Some(serde_json::Value::Null) | None => message.to_string(),
            Some(other) => format!("{message}{other}"),
        }
    }

    fn into_error(self, retry_after: Option<Duration>) -> VaultError {
        let message = self.text();
        match self.code {
            CODE_THROTTLED => VaultError::Throttled { message, retry_after },
            CODE_UNAVAILABLE => VaultError::Unavailable(message),
            code => VaultError::UnrecognizedCode { code, message },
        }
    }
}

/// Turns a raw response into a payload or a typed failure.
///
/// The envelope wins over the HTTP status; the status only decides bodies
/// that carry no envelope.
pub fn decode_response<T: DeserializeOwned>(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &[u8],
) -> Result<T, VaultError> {
    let value: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => VaultError::Throttled {
                    message: status.to_string(),
                    retry_after,
                },
                s if s.is_server_error() => VaultError::Unavailable(format!("HTTP {s}")),
                _ => VaultError::Malformed(err),
            });
        }
    };

    if value.get("code").is_some() {
        let envelope: ErrorEnvelope = serde_json::from_value(value)?;
        return Err(envelope.into_error(retry_after));
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(VaultError::Throttled {
            message: value.to_string(),
            retry_after,
        });
    }
    if status.is_server_error() {
        return Err(VaultError::Unavailable(format!("HTTP {status}")));
    }

    Ok(serde_json::from_value(value)?)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Vault API client with optional client-side pacing
pub struct VaultClient {
    client: Client,
    decks_url: Url,
    page_size: u32,
    rate_limiter: Option<DefaultDirectRateLimiter>,
}

impl VaultClient {
    pub fn new(config: &VaultConfig) -> Result<Self, VaultError> {
        let mut headers = HeaderMap::new();
        if let Ok(agent) = HeaderValue::from_str(&config.user_agent) {
            headers.insert(USER_AGENT, agent);
        } else {
            warn!(user_agent = %config.user_agent, "Ignoring invalid user agent");
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .default_headers(headers)
            .gzip(true)
            .brotli(true)
            .build()?;

        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let decks_url = Url::parse(&base)?.join("api/decks/")?;
        if decks_url.cannot_be_a_base() {
            return Err(VaultError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }

        let rate_limiter = NonZeroU32::new(config.max_requests_per_second)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));

        Ok(Self {
            client,
            decks_url,
            page_size: config.page_size,
            rate_limiter,
        })
    }

    fn listing_url(&self, page: u32, search: &str) -> Url {
        let mut url = self.decks_url.clone();
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("page_size", &self.page_size.to_string())
            .append_pair("search", search)
            .append_pair("power_level", "0,11")
            .append_pair("chains", "0,24")
            .append_pair("ordering", "-date");
        url
    }

    fn detail_url(&self, id: &DeckId) -> Result<Url, VaultError> {
        let mut url = self.decks_url.clone();
        url.path_segments_mut()
            .map_err(|()| VaultError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .push(id.as_str())
            .push("");
        url.query_pairs_mut().append_pair("links", "cards,notes");
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, VaultError> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        debug!("Fetching {}", url);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.bytes().await?;
        decode_response(status, retry_after, &body)
    }

    /// First deck whose name matches the search text
    pub async fn find_deck_id(&self, name: &str) -> Result<DeckId, VaultError> {
        let page: ListingPage = self.get_json(self.listing_url(1, name)).await?;
        page.deck_ids()
            .into_iter()
            .next()
            .ok_or_else(|| VaultError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl DeckSource for VaultClient {
    async fn list_page(&self, page: u32) -> Result<Vec<DeckId>, VaultError> {
        let listing: ListingPage = self.get_json(self.listing_url(page, "")).await?;
        Ok(listing.deck_ids())
    }

    async fn fetch_deck(&self, id: &DeckId) -> Result<DeckDetail, VaultError> {
        let url = self.detail_url(id)?;
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> VaultClient {
        VaultClient::new(&VaultConfig {
            base_url: base_url.to_string(),
            ..VaultConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn builds_listing_and_detail_urls() {
        let client = client("http://vault.test");

        let listing = client.listing_url(3, "");
        assert_eq!(listing.path(), "/api/decks/");
        let query: Vec<(String, String)> = listing.query_pairs().into_owned().collect();
        assert!(query.contains(&("page".into(), "3".into())));
        assert!(query.contains(&("page_size".into(), "10".into())));
        assert!(query.contains(&("ordering".into(), "-date".into())));

        let detail = client.detail_url(&DeckId::new("abc-123")).unwrap();
        assert_eq!(detail.path(), "/api/decks/abc-123/");
        assert_eq!(detail.query(), Some("links=cards%2Cnotes"));
    }

    #[test]
    fn envelope_codes_map_to_failures() {
        let throttled = decode_response::<ListingPage>(
            StatusCode::OK,
            Some(Duration::from_secs(7)),
            br#"{"code": 429, "message": "Request was throttled. ", "detail": "Try later"}"#,
        );
        match throttled {
            Err(VaultError::Throttled { message, retry_after }) => {
                assert_eq!(message, "Request was throttled. Try later");
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            decode_response::<ListingPage>(StatusCode::OK, None, br#"{"code": 0, "message": "Internal Server Error"}"#),
            Err(VaultError::Unavailable(_))
        ));
        assert!(matches!(
            decode_response::<ListingPage>(StatusCode::OK, None, br#"{"code": 17, "message": "?"}"#),
            Err(VaultError::UnrecognizedCode { code: 17, .. })
        ));
    }

    #[test]
    fn non_json_bodies_follow_status() {
        assert!(matches!(
            decode_response::<ListingPage>(StatusCode::TOO_MANY_REQUESTS, None, b"slow down"),
            Err(VaultError::Throttled { .. })
        ));
        assert!(matches!(
            decode_response::<ListingPage>(StatusCode::BAD_GATEWAY, None, b"<html>"),
            Err(VaultError::Unavailable(_))
        ));
        assert!(matches!(
            decode_response::<ListingPage>(StatusCode::OK, None, b"<html>"),
            Err(VaultError::Malformed(_))
        ));
        assert!(matches!(
            decode_response::<ListingPage>(StatusCode::OK, None, br#"{"count": 1}"#),
            Err(VaultError::Malformed(_))
        ));
    }

    #[test]
    fn decodes_listing_payload() {
        let page: ListingPage =
            decode_response(StatusCode::OK, None, br#"{"count": 1, "data": [{"id": "d-1"}]}"#).unwrap();
        assert_eq!(page.deck_ids(), vec![DeckId::new("d-1")]);
    }
}
