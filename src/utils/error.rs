/* MITM Gateway (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors raised while relaying one exchange.
///
/// The enum is `Clone` so a single failed upstream connect can be handed to every
/// request that was waiting on it. Call sites branch on the variant, never on the
/// rendered message.
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("{authority} does not speak HTTP/2; HTTP/1.1 required")]
    DowngradeRequired { authority: String },

    #[error("{host}:{port} is this gateway")]
    IsSelf { host: String, port: u16 },

    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("upstream proxy refused CONNECT to {target}: {status_line}")]
    TunnelRejected { target: String, status_line: String },

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("hook `{hook}` failed: {reason}")]
    HookFailed { hook: String, reason: String },

    #[error("client went away")]
    ClientGone,

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error(transparent)]
    Other(Arc<anyhow::Error>),
}

impl ProxyError {
    /// Status code reported to the client when this error ends an exchange before
    /// the response head went out.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::DowngradeRequired { .. } => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            ProxyError::IsSelf { .. } => StatusCode::OK,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::HookFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Short plain-text body paired with [`ProxyError::status_code`].
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::DowngradeRequired { .. } => "HTTP/1.1 required".to_string(),
            ProxyError::IsSelf { .. } => "mitm-gateway: this is the local server".to_string(),
            ProxyError::BadRequest(reason) => format!("bad request: {reason}"),
            ProxyError::HookFailed { hook, .. } => format!("hook {hook} failed"),
            ProxyError::Timeout(_) => "upstream timed out".to_string(),
            other => format!("bad gateway: {other}"),
        }
    }

    pub fn is_downgrade(&self) -> bool {
        matches!(self, ProxyError::DowngradeRequired { .. })
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(Arc::new(err))
    }
}

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Other(Arc::new(err))
    }
}

impl From<h2::Error> for ProxyError {
    fn from(err: h2::Error) -> Self {
        if err.is_io() {
            if let Some(io) = err.get_io() {
                return ProxyError::Io(Arc::new(std::io::Error::new(io.kind(), io.to_string())));
            }
        }
        ProxyError::Protocol(err.to_string())
    }
}

impl From<http::Error> for ProxyError {
    fn from(err: http::Error) -> Self {
        ProxyError::Protocol(err.to_string())
    }
}

impl From<rcgen::Error> for ProxyError {
    fn from(err: rcgen::Error) -> Self {
        ProxyError::Certificate(err.to_string())
    }
}
