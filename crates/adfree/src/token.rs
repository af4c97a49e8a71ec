use std::sync::Arc;

use tracing::debug;

use crate::config::{DEFAULT_CLIENT_ID, DEFAULT_GQL_HASH, GQL_URL, SessionState};
use crate::error::EngineError;
use crate::fetch::{FetchRequest, FetchResponse, Fetcher};

/// A signed playback authorization token issued for one (channel, profile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackToken {
    pub value: String,
    pub signature: String,
}

/// Requests signed playback tokens from the upstream authorization endpoint.
///
/// Performs no retry of its own; retry and fallback across profiles is the
/// negotiator's responsibility. The raw status/body is handed back so the
/// caller decides what a usable answer looks like.
pub struct TokenClient {
    fetcher: Arc<dyn Fetcher>,
}

impl TokenClient {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher }
    }

    pub async fn request_token(
        &self,
        session: &SessionState,
        channel: &str,
        profile: &str,
    ) -> Result<FetchResponse, EngineError> {
        let hash = session.gql_token_hash.as_deref().unwrap_or(DEFAULT_GQL_HASH);
        let body = serde_json::to_string(&serde_json::json!({
            "operationName": "PlaybackAccessToken",
            "extensions": {
                "persistedQuery": {
                    "version": 1,
                    "sha256Hash": hash,
                }
            },
            "variables": {
                "isLive": true,
                "login": channel,
                "isVod": false,
                "vodID": "",
                "playerType": profile,
                "isClip": false,
                "clipID": "",
                "platform": "web",
            },
        }))?;

        let mut request = FetchRequest::post(GQL_URL, body)
            .header(
                "Client-Id",
                session
                    .client_id
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
            )
            .header("Device-Id", session.device_id.clone());
        if let Some(value) = &session.authorization {
            request = request.header("Authorization", value.clone());
        }
        if let Some(value) = &session.client_integrity {
            request = request.header("Client-Integrity", value.clone());
        }
        if let Some(value) = &session.client_version {
            request = request.header("Client-Version", value.clone());
        }
        if let Some(value) = &session.client_session {
            request = request.header("Client-Session-Id", value.clone());
        }

        debug!(channel, profile, "requesting playback token");
        self.fetcher.fetch(request).await
    }
}

/// Pulls the token value/signature pair out of a raw token response body.
pub fn parse_playback_token(body: &str) -> Result<PlaybackToken, EngineError> {
    let parsed: serde_json::Value = serde_json::from_str(body)?;
    let token = parsed
        .get("data")
        .and_then(|d| d.get("streamPlaybackAccessToken"))
        .ok_or_else(|| EngineError::Token {
            reason: "missing streamPlaybackAccessToken".to_string(),
        })?;
    let value = token
        .get("value")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::Token {
            reason: "missing token value".to_string(),
        })?;
    let signature = token
        .get("signature")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::Token {
            reason: "missing token signature".to_string(),
        })?;
    Ok(PlaybackToken {
        value: value.to_string(),
        signature: signature.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockFetcher;

    #[test]
    fn test_parse_playback_token() {
        let body = r#"{"data":{"streamPlaybackAccessToken":{"value":"{\"channel\":\"c\"}","signature":"sig123"}}}"#;
        let token = parse_playback_token(body).unwrap();
        assert_eq!(token.signature, "sig123");
        assert!(token.value.contains("channel"));
    }

    #[test]
    fn test_parse_playback_token_missing_fields() {
        assert!(parse_playback_token(r#"{"data":{}}"#).is_err());
        assert!(parse_playback_token("not json").is_err());
    }

    #[tokio::test]
    async fn test_request_carries_session_headers_and_profile() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.route(GQL_URL, 200, "{}");
        let client = TokenClient::new(fetcher.clone());

        let session = SessionState {
            authorization: Some("OAuth abc".to_string()),
            client_integrity: Some("v4.xyz".to_string()),
            ..SessionState::default()
        };
        let response = client
            .request_token(&session, "somechannel", "embed")
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        let requests = fetcher.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        let body = request.body.as_deref().unwrap();
        assert!(body.contains("\"playerType\":\"embed\""));
        assert!(body.contains("\"login\":\"somechannel\""));
        assert!(body.contains(DEFAULT_GQL_HASH));
        let header = |k: &str| {
            request
                .headers
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(header("Client-Id"), Some(DEFAULT_CLIENT_ID));
        assert_eq!(header("Authorization"), Some("OAuth abc"));
        assert_eq!(header("Client-Integrity"), Some("v4.xyz"));
        assert_eq!(header("Device-Id"), Some(session.device_id.as_str()));
    }

    #[tokio::test]
    async fn test_hash_override_from_session() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.route(GQL_URL, 200, "{}");
        let client = TokenClient::new(fetcher.clone());

        let session = SessionState {
            gql_token_hash: Some("deadbeef".to_string()),
            ..SessionState::default()
        };
        client
            .request_token(&session, "c", "site")
            .await
            .unwrap();
        let requests = fetcher.requests();
        assert!(requests[0].body.as_deref().unwrap().contains("deadbeef"));
    }
}
