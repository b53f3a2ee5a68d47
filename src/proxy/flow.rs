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

use std::{fmt, net::SocketAddr};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use uuid::Uuid;

use crate::utils::{ProxyError, ProxyResult};

/// Exchange tracks everything known about one request/response pair while it is
/// relayed. Each HTTP/1.1 request or HTTP/2 stream gets its own Exchange; it is owned
/// by a single task and dropped once hooks have run and the client stream ends.
#[derive(Debug)]
pub struct Exchange {
    /// UUID v7, so log lines sort by creation time.
    pub id: Uuid,
    pub request: RequestParts,
    pub target: Option<Target>,
    pub response: Option<ResponseParts>,
    pub metadata: ExchangeMetadata,
}

impl Exchange {
    pub fn new(request: RequestParts) -> Self {
        Self {
            id: Uuid::now_v7(),
            request,
            target: None,
            response: None,
            metadata: ExchangeMetadata::default(),
        }
    }
}

/// Request head as received from the client.
#[derive(Debug, Clone)]
pub struct RequestParts {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestParts {
    /// Path plus query, `/` when the URI carries none.
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

impl Default for RequestParts {
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::from_static("/"),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }
}

/// Response head: status, reason phrase, version, and headers.
#[derive(Debug, Clone, Default)]
pub struct ResponseParts {
    pub status: StatusCode,
    /// Reason phrase from an HTTP/1.x status line; HTTP/2 has none.
    pub reason: Option<String>,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseParts {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers,
        }
    }

    /// Reason phrase to report, falling back to the canonical one.
    pub fn status_message(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }
}

/// Growable byte buffer for copies of bodies handed to hooks.
///
/// The buffer stops accepting bytes once `limit` is crossed and remembers that it
/// overflowed; the relay keeps streaming regardless.
#[derive(Debug)]
pub struct BodyBuffer {
    data: BytesMut,
    limit: usize,
    overflowed: bool,
}

impl BodyBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            limit,
            overflowed: false,
        }
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.data.len() + chunk.len() > self.limit {
            self.overflowed = true;
            self.data = BytesMut::new();
            return;
        }
        self.data.extend_from_slice(chunk);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// The complete body, or `None` if it outgrew the limit.
    pub fn freeze(self) -> Option<Bytes> {
        if self.overflowed {
            None
        } else {
            Some(self.data.freeze())
        }
    }
}

/// Telemetry-facing summary of what happened to an exchange.
#[derive(Debug, Default)]
pub struct ExchangeMetadata {
    pub peer: Option<SocketAddr>,
    pub tls_sni: Option<String>,
    pub client_protocol: Option<&'static str>,
    pub upstream_protocol: Option<&'static str>,
    pub matched_hooks: usize,
    pub intercepted: bool,
    pub faked: bool,
    pub control: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where an exchange is relayed to: scheme, host, and port.
///
/// IPv6 hosts are stored without brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        Self { scheme, host, port }
    }

    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self::new(Scheme::Https, host, port)
    }

    /// Parses `scheme://host[:port]` or a bare `host[:port]` (assumed https).
    pub fn parse(authority_url: &str) -> ProxyResult<Self> {
        let uri: Uri = if authority_url.contains("://") {
            authority_url.parse::<Uri>()
        } else {
            format!("https://{authority_url}").parse::<Uri>()
        }
        .map_err(|err| ProxyError::BadRequest(format!("invalid authority {authority_url}: {err}")))?;

        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") | None => Scheme::Https,
            Some(other) => {
                return Err(ProxyError::BadRequest(format!("unsupported scheme {other}")))
            }
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::BadRequest(format!("authority lacks a host: {authority_url}")))?;
        let port = uri.port_u16().unwrap_or(scheme.default_port());
        Ok(Self::new(scheme, host, port))
    }

    /// Host as it appears inside a URL authority (IPv6 bracketed).
    pub fn uri_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// `host[:port]` omitting the scheme's default port, as sent in `Host`/`:authority`.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.uri_host()
        } else {
            format!("{}:{}", self.uri_host(), self.port)
        }
    }

    /// `scheme://host:port`, the key for the session pool and protocol memo.
    pub fn pool_key(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.uri_host(), self.port)
    }

    /// Absolute URL for a path-and-query on this target.
    pub fn url(&self, path_and_query: &str) -> ProxyResult<Uri> {
        let path = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{path_and_query}")
        };
        Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(self.authority())
            .path_and_query(path)
            .build()
            .map_err(|err| ProxyError::BadRequest(format!("cannot build URL: {err}")))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pool_key())
    }
}
