//! Validated base URL for one ComfyUI instance.
//!
//! HTTP endpoints are built by appending to the base path; the WebSocket
//! URL mirrors the HTTP scheme (`http` -> `ws`, `https` -> `wss`) so a
//! TLS-terminated instance keeps a secure event stream.

use url::Url;

use crate::error::{ClientError, ErrorKind};

/// A validated `http`/`https` base URL with any trailing slash removed.
#[derive(Debug, Clone)]
pub struct BaseUrl {
    url: Url,
}

impl BaseUrl {
    /// Parse and validate a base URL string.
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let trimmed = raw.trim().trim_end_matches('/');
        let url = Url::parse(trimmed).map_err(|e| {
            ClientError::new(ErrorKind::InvalidConfiguration, "invalid base url")
                .with_context("base_url", raw)
                .with_context("detail", e.to_string())
        })?;

        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(
                ClientError::new(ErrorKind::InvalidConfiguration, "invalid base url")
                    .with_context("base_url", raw),
            );
        }

        Ok(Self { url })
    }

    /// Build an HTTP endpoint URL under the base path.
    pub fn http_endpoint(&self, endpoint: &str) -> Url {
        let mut url = self.url.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{prefix}/{endpoint}"));
        url.set_query(None);
        url
    }

    /// Build the event-stream URL for a client id.
    ///
    /// Scheme mirrors the HTTP scheme; the client id is percent-encoded
    /// into the `clientId` query parameter.
    pub fn ws_url(&self, client_id: &str) -> Url {
        let mut url = self.http_endpoint("ws");
        let scheme = if self.url.scheme() == "https" { "wss" } else { "ws" };
        // set_scheme only rejects invalid transitions; ws/wss are fine here.
        let _ = url.set_scheme(scheme);
        url.query_pairs_mut().append_pair("clientId", client_id);
        url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}
