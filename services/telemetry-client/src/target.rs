//! Connection target resolution.
//!
//! A [`ConnectionTarget`] is rebuilt for every connection attempt from two
//! collaborator inputs: the base URL resolver and the token provider. The
//! base scheme is rewritten to its WebSocket equivalent, the fixed telemetry
//! path is appended, and the token travels both as the `token` query
//! parameter and as a Bearer header.

use std::path::PathBuf;

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, HeaderValue};
use tracing::warn;
use url::Url;

/// Local development server used when no usable base URL is configured.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Path of the telemetry stream endpoint on the server.
pub const TELEMETRY_WS_PATH: &str = "/ws/telemetry";

/// Supplies the credential for the next connection attempt.
pub trait TokenProvider: Send + Sync {
    fn current_token(&self) -> Option<String>;
}

/// Supplies the server base URL (scheme, host, port).
pub trait BaseTargetResolver: Send + Sync {
    fn resolve_base(&self) -> Option<String>;
}

/// A token fixed at construction time.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn current_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Raw token string on a single line, re-read on every attempt so that a
/// rotated token is picked up by the next connection.
#[derive(Debug, Clone)]
pub struct TokenFile(pub PathBuf);

impl TokenProvider for TokenFile {
    fn current_token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.0) {
            Ok(contents) => {
                let token = contents.trim();
                (!token.is_empty()).then(|| token.to_owned())
            }
            Err(e) => {
                warn!(path = %self.0.display(), error = %e, "could not read token file");
                None
            }
        }
    }
}

/// A base URL fixed at construction time.
#[derive(Debug, Clone, Default)]
pub struct StaticBase(pub Option<String>);

impl BaseTargetResolver for StaticBase {
    fn resolve_base(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("invalid request for {url}: {detail}")]
    InvalidRequest { url: String, detail: String },
    #[error("target resolution failed: {0}")]
    ResolverFailed(String),
}

/// Resolved endpoint for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    url: Url,
    token: String,
}

impl ConnectionTarget {
    pub fn resolve(
        base: &dyn BaseTargetResolver,
        tokens: &dyn TokenProvider,
        ws_path: &str,
    ) -> Result<Self, TargetError> {
        let token = tokens
            .current_token()
            .filter(|t| !t.trim().is_empty())
            .ok_or(TargetError::NotAuthenticated)?;

        let mut url = streaming_base(base.resolve_base().as_deref()).ok_or_else(|| {
            TargetError::InvalidRequest {
                url: DEFAULT_BASE_URL.to_owned(),
                detail: "default base URL rejected".to_owned(),
            }
        })?;
        let path = format!("{}{}", url.path().trim_end_matches('/'), ws_path);
        url.set_path(&path);
        url.set_fragment(None);
        url.query_pairs_mut().clear().append_pair("token", &token);

        Ok(Self { url, token })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The target URL with the query string removed, safe for logs.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        url.set_query(None);
        url.to_string()
    }

    /// Build the WebSocket upgrade request.
    ///
    /// `IntoClientRequest` fills in the upgrade headers; the Bearer header is
    /// added on top.
    pub fn into_request(self) -> Result<Request, TargetError> {
        let invalid = |detail: String| TargetError::InvalidRequest {
            url: self.redacted(),
            detail,
        };
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| invalid(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| invalid(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        Ok(request)
    }
}

/// Parse the base URL and rewrite its scheme to the streaming equivalent.
/// Anything unusable falls back to [`DEFAULT_BASE_URL`].
fn streaming_base(raw: Option<&str>) -> Option<Url> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| match rewrite_scheme(s) {
            Some(url) => Some(url),
            None => {
                warn!(base = s, default = DEFAULT_BASE_URL, "unusable base URL, using default");
                None
            }
        })
        .or_else(|| rewrite_scheme(DEFAULT_BASE_URL))
}

fn rewrite_scheme(raw: &str) -> Option<Url> {
    let mut url = Url::parse(raw).ok()?;
    url.host_str()?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(base: Option<&str>, token: Option<&str>) -> Result<ConnectionTarget, TargetError> {
        ConnectionTarget::resolve(
            &StaticBase(base.map(str::to_owned)),
            &StaticToken(token.map(str::to_owned)),
            TELEMETRY_WS_PATH,
        )
    }

    #[test]
    fn http_base_becomes_ws_with_path_and_token() {
        let target = resolve(Some("http://drone-gw:8000"), Some("abc")).unwrap();
        assert_eq!(
            target.url().as_str(),
            "ws://drone-gw:8000/ws/telemetry?token=abc"
        );
    }

    #[test]
    fn https_base_becomes_wss() {
        let target = resolve(Some("https://example.com"), Some("t")).unwrap();
        assert_eq!(target.url().scheme(), "wss");
        assert_eq!(target.url().path(), "/ws/telemetry");
    }

    #[test]
    fn base_path_prefix_is_kept() {
        let target = resolve(Some("http://host:9000/api/"), Some("t")).unwrap();
        assert_eq!(target.url().path(), "/api/ws/telemetry");
    }

    #[test]
    fn missing_or_garbage_base_uses_local_default() {
        for base in [None, Some(""), Some("not a url"), Some("ftp://files.example.com")] {
            let target = resolve(base, Some("t")).unwrap();
            assert_eq!(
                target.url().as_str(),
                "ws://localhost:8000/ws/telemetry?token=t",
                "base = {base:?}"
            );
        }
    }

    #[test]
    fn missing_or_blank_token_is_not_authenticated() {
        assert_eq!(resolve(None, None), Err(TargetError::NotAuthenticated));
        assert_eq!(resolve(None, Some("  ")), Err(TargetError::NotAuthenticated));
    }

    #[test]
    fn token_is_query_encoded_and_redacted_for_logs() {
        let target = resolve(None, Some("a b&c")).unwrap();
        assert_eq!(target.url().query(), Some("token=a+b%26c"));
        assert_eq!(target.redacted(), "ws://localhost:8000/ws/telemetry");
    }

    #[test]
    fn request_carries_bearer_and_upgrade_headers() {
        let request = resolve(None, Some("secret")).unwrap().into_request().unwrap();
        assert_eq!(
            request.headers().get("authorization").unwrap().to_str().unwrap(),
            "Bearer secret"
        );
        assert!(request.headers().get("sec-websocket-key").is_some());
    }

    #[test]
    fn token_file_is_trimmed_and_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        let provider = TokenFile(path.clone());
        assert_eq!(provider.current_token(), None);

        std::fs::write(&path, "first\n").unwrap();
        assert_eq!(provider.current_token().as_deref(), Some("first"));

        std::fs::write(&path, "second").unwrap();
        assert_eq!(provider.current_token().as_deref(), Some("second"));

        std::fs::write(&path, "\n").unwrap();
        assert_eq!(provider.current_token(), None);
    }
}
