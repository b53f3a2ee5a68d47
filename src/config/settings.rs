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

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Configuration loaders and structures for the gateway.
///
/// These types mirror `gateway.example.toml`, apply defaults, and resolve any
/// operator-supplied relative paths against the config file's directory.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// The four logical listen endpoints.
    #[serde(default)]
    pub listeners: ListenersConfig,
    /// CA material and leaf cache sizing.
    pub tls: TlsConfig,
    /// Outbound connection behavior (upstream proxy, trust, timeouts, pooling).
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Reserved control-interface hostname.
    #[serde(default)]
    pub control: ControlConfig,
    /// Hook buffering limits and config-driven rules.
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Telemetry configuration (stdout vs structured log output).
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl GatewayConfig {
    /// Reads the config file, deserializes TOML, and resolves relative paths.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&raw, path.parent())
            .with_context(|| format!("invalid gateway config: {}", path.display()))
    }

    /// Parses an in-memory TOML document; relative paths resolve against `base_dir`.
    pub fn from_toml_str(raw: &str, base_dir: Option<&Path>) -> Result<Self> {
        let mut cfg: GatewayConfig = toml::from_str(raw)?;

        Self::absolutize(base_dir, &mut cfg.tls.ca_cert_path);
        Self::absolutize(base_dir, &mut cfg.tls.ca_key_path);
        if let Some(path) = cfg.upstream.ca_cert_path.as_mut() {
            Self::absolutize(base_dir, path);
        }

        Ok(cfg)
    }

    /// Helper that resolves relative paths against the config file's location.
    fn absolutize(base_dir: Option<&Path>, target: &mut PathBuf) {
        if target.is_relative() {
            if let Some(dir) = base_dir {
                *target = dir.join(&*target);
            }
        }
    }
}

/// A `{host, port}` listen endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolves the endpoint to a socket address; `localhost` maps to 127.0.0.1.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = if self.host.eq_ignore_ascii_case("localhost") {
            IpAddr::from([127, 0, 0, 1])
        } else {
            self.host
                .parse()
                .with_context(|| format!("listen host must be an IP literal: {}", self.host))?
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenersConfig {
    /// Primary TLS listener negotiating h2 with http/1.1 fallback.
    #[serde(default = "default_mitm_endpoint")]
    pub mitm: Endpoint,
    /// Secondary TLS listener that only offers http/1.1.
    #[serde(default = "default_mitm_http1_endpoint")]
    pub mitm_http1: Endpoint,
    /// Control-interface HTTP server (hosted elsewhere; requests are forwarded to it).
    #[serde(default = "default_control_endpoint")]
    pub control: Endpoint,
    /// Forward HTTP proxy frontend (hosted elsewhere; only used by the self-connection guard).
    #[serde(default = "default_http_proxy_endpoint")]
    pub http_proxy: Endpoint,
}

impl Default for ListenersConfig {
    fn default() -> Self {
        Self {
            mitm: default_mitm_endpoint(),
            mitm_http1: default_mitm_http1_endpoint(),
            control: default_control_endpoint(),
            http_proxy: default_http_proxy_endpoint(),
        }
    }
}

fn default_mitm_endpoint() -> Endpoint {
    Endpoint::new("127.0.0.1", 8443)
}

fn default_mitm_http1_endpoint() -> Endpoint {
    Endpoint::new("127.0.0.1", 8444)
}

fn default_control_endpoint() -> Endpoint {
    Endpoint::new("127.0.0.1", 8080)
}

fn default_http_proxy_endpoint() -> Endpoint {
    Endpoint::new("127.0.0.1", 8888)
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Path to the CA certificate clients must trust for interception.
    pub ca_cert_path: PathBuf,
    /// Path to the CA private key used for leaf issuance.
    pub ca_key_path: PathBuf,
    /// Upper bound on cached leaf certificates (oldest-inserted evicted first).
    #[serde(default = "default_leaf_cache_capacity")]
    pub leaf_cache_capacity: usize,
}

fn default_leaf_cache_capacity() -> usize {
    1024
}

/// Upstream proxy the gateway tunnels through with HTTP CONNECT.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Optional upstream HTTP proxy; when set every outbound socket is a CONNECT tunnel.
    #[serde(default)]
    pub proxy: Option<UpstreamProxy>,
    /// Extra CA (PEM) trusted for upstream TLS, e.g. when the upstream proxy intercepts too.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// Validate upstream certificates against webpki roots plus `ca_cert_path`.
    #[serde(default = "default_true")]
    pub verify_certificates: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Deadline for upstream response headers; unset means no deadline.
    #[serde(default)]
    pub exchange_timeout_secs: Option<u64>,
    /// Pooled HTTP/2 sessions unused for this long are dropped.
    #[serde(default = "default_session_idle_timeout_secs")]
    pub session_idle_timeout_secs: u64,
    /// How long an HTTP/2-support verdict stays valid.
    #[serde(default = "default_memo_ttl_secs")]
    pub memo_ttl_secs: u64,
    #[serde(default = "default_memo_capacity")]
    pub memo_capacity: usize,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn exchange_timeout(&self) -> Option<Duration> {
        self.exchange_timeout_secs.map(Duration::from_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn memo_ttl(&self) -> Duration {
        Duration::from_secs(self.memo_ttl_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            ca_cert_path: None,
            verify_certificates: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            exchange_timeout_secs: None,
            session_idle_timeout_secs: default_session_idle_timeout_secs(),
            memo_ttl_secs: default_memo_ttl_secs(),
            memo_capacity: default_memo_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_session_idle_timeout_secs() -> u64 {
    300
}

fn default_memo_ttl_secs() -> u64 {
    60 * 60
}

fn default_memo_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Requests addressed to this hostname are forwarded to the control listener unmodified.
    #[serde(default = "default_control_hostname")]
    pub hostname: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            hostname: default_control_hostname(),
        }
    }
}

fn default_control_hostname() -> String {
    "gateway.local".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HooksConfig {
    /// Bodies larger than this are still relayed but handed to hooks as `None`.
    #[serde(default = "default_max_buffered_body_bytes")]
    pub max_buffered_body_bytes: usize,
    /// Built-in rule hooks, registered in file order.
    #[serde(default)]
    pub rules: Vec<HookRuleConfig>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            max_buffered_body_bytes: default_max_buffered_body_bytes(),
            rules: Vec::new(),
        }
    }
}

fn default_max_buffered_body_bytes() -> usize {
    32 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct HookRuleConfig {
    pub name: String,
    /// Matches when the full request URL (`https://host:port/path?query`) starts with this.
    pub url_prefix: String,
    /// Upper-case method names; empty matches any method.
    #[serde(default)]
    pub methods: Vec<String>,
    pub action: RuleAction,
    /// Status for `fake` rules.
    #[serde(default = "default_rule_status")]
    pub status: u16,
    /// Body for `fake` rules.
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_rule_status() -> u16 {
    200
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Answer locally without contacting the upstream.
    Fake,
    /// Relay normally and log the decoded response body.
    Capture,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Telemetry output: human-friendly stdout or structured JSON.
    #[serde(default)]
    pub mode: TelemetryMode,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Print structured, readable logs to stdout.
    #[default]
    Stdout,
    /// Emit JSON objects for ingestion systems.
    Json,
}
