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

//! `LocalServer`: binds the two MITM listeners and runs their accept loops.

use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::{
    config::{Endpoint, GatewayConfig},
    proxy::{
        client::{SelfAddresses, UpstreamConnector},
        connection::{handle_connection, ListenerContext, ListenerKind},
        exchange::{ControlRoute, RelayContext},
        flow::Target,
        hooks::HookRegistry,
        oneshot::Http2RequestClient,
        pool::{H2SessionPool, ProtocolMemo},
    },
    telemetry::TelemetrySink,
    tls::{
        cert::CertificateStore,
        resolver::{build_http1_server_config, build_server_config},
    },
    utils::{ProxyError, ProxyResult},
};

/// How many consecutive ports are tried when the configured one is taken.
const PORT_PROBE_SPAN: u16 = 64;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// The MITM server: an h2+http/1.1 listener and an http/1.1-only listener sharing
/// one certificate store, hook registry, and upstream session pool.
pub struct LocalServer {
    primary: TcpListener,
    http1: TcpListener,
    primary_addr: SocketAddr,
    http1_addr: SocketAddr,
    ctx: Arc<ListenerContext>,
    certs: Arc<CertificateStore>,
}

impl LocalServer {
    pub async fn bind(
        cfg: &GatewayConfig,
        certs: Arc<CertificateStore>,
        hooks: HookRegistry,
        telemetry: TelemetrySink,
    ) -> Result<Self> {
        let primary = bind_listener(&cfg.listeners.mitm, None).await?;
        let primary_addr = primary.local_addr()?;
        let http1 = bind_listener(&cfg.listeners.mitm_http1, Some(primary_addr.port())).await?;
        let http1_addr = http1.local_addr()?;

        let mut own_addrs = vec![primary_addr, http1_addr];
        // The forward proxy frontend runs elsewhere but still counts as this gateway.
        if let Ok(addr) = cfg.listeners.http_proxy.socket_addr() {
            own_addrs.push(addr);
        }
        let connector = UpstreamConnector::new(&cfg.upstream, SelfAddresses::new(&own_addrs))?;
        let memo = Arc::new(ProtocolMemo::new(
            cfg.upstream.memo_capacity,
            cfg.upstream.memo_ttl(),
        ));
        let pool = H2SessionPool::new(connector.clone(), memo, cfg.upstream.session_idle_timeout());

        let control = ControlRoute {
            hostname: cfg.control.hostname.to_ascii_lowercase(),
            addr: cfg
                .listeners
                .control
                .socket_addr()
                .context("invalid control listener address")?,
        };

        let relay = Arc::new(RelayContext {
            hooks,
            pool,
            connector,
            telemetry,
            control,
            exchange_timeout: cfg.upstream.exchange_timeout(),
            max_buffered_body: cfg.hooks.max_buffered_body_bytes,
        });

        let ctx = Arc::new(ListenerContext {
            relay,
            certs: certs.clone(),
            h2_config: Arc::new(build_server_config(certs.clone())),
            h1_config: Arc::new(build_http1_server_config(certs.clone())),
            handshake_timeout: cfg.upstream.handshake_timeout(),
        });

        tracing::info!(primary = %primary_addr, http1 = %http1_addr, "MITM listeners bound");
        Ok(Self {
            primary,
            http1,
            primary_addr,
            http1_addr,
            ctx,
            certs,
        })
    }

    /// Address of the h2+http/1.1 listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.primary_addr
    }

    /// Address of the http/1.1-only listener.
    pub fn http1_addr(&self) -> SocketAddr {
        self.http1_addr
    }

    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            primary: self.primary_addr,
            http1: self.http1_addr,
            pool: self.ctx.relay.pool.clone(),
            ca_cert_pem: self.certs.ca_cert_pem().to_string(),
        }
    }

    /// Runs both accept loops until the process exits.
    pub async fn run(self) -> Result<()> {
        let primary = accept_loop(self.primary, ListenerKind::Primary, self.ctx.clone());
        let http1 = accept_loop(self.http1, ListenerKind::Http1Only, self.ctx);
        tokio::join!(primary, http1);
        Ok(())
    }
}

/// Binds `endpoint`, walking upward from its port while ports are taken.
async fn bind_listener(endpoint: &Endpoint, skip: Option<u16>) -> Result<TcpListener> {
    let base = endpoint
        .socket_addr()
        .with_context(|| format!("invalid listen address {}:{}", endpoint.host, endpoint.port))?;
    if base.port() == 0 {
        return TcpListener::bind(base)
            .await
            .with_context(|| format!("failed to bind {base}"));
    }

    let mut last_err = None;
    for offset in 0..PORT_PROBE_SPAN {
        let Some(port) = base.port().checked_add(offset) else {
            break;
        };
        if Some(port) == skip {
            continue;
        }
        let addr = SocketAddr::new(base.ip(), port);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if offset > 0 {
                    tracing::info!(configured = %base, bound = %addr, "configured port busy, using next free port");
                }
                return Ok(listener);
            }
            Err(err) if err.kind() == ErrorKind::AddrInUse => last_err = Some(err),
            Err(err) => return Err(err).with_context(|| format!("failed to bind {addr}")),
        }
    }

    Err(anyhow::anyhow!(
        "no free port in {}..+{PORT_PROBE_SPAN} for {}: {}",
        base.port(),
        base.ip(),
        last_err.map(|err| err.to_string()).unwrap_or_default()
    ))
}

async fn accept_loop(listener: TcpListener, kind: ListenerKind, ctx: Arc<ListenerContext>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(?kind, "accept failed: {err}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let _ = socket.set_nodelay(true);
        tracing::trace!(%peer, ?kind, "accepted client");

        let ctx = ctx.clone();
        tokio::spawn(async move {
            match handle_connection(socket, peer, kind, ctx).await {
                Ok(()) => {}
                Err(err @ (ProxyError::TlsHandshake(_) | ProxyError::Timeout(_) | ProxyError::Io(_))) => {
                    tracing::debug!(%peer, "client connection ended: {err}");
                }
                Err(err) => tracing::warn!(%peer, "client connection failed: {err}"),
            }
        });
    }
}

/// Cheap handle other subsystems use to reach a running gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    primary: SocketAddr,
    http1: SocketAddr,
    pool: Arc<H2SessionPool>,
    ca_cert_pem: String,
}

impl GatewayHandle {
    pub fn primary_addr(&self) -> SocketAddr {
        self.primary
    }

    pub fn http1_addr(&self) -> SocketAddr {
        self.http1
    }

    pub fn pool(&self) -> &Arc<H2SessionPool> {
        &self.pool
    }

    /// Listener a forward proxy should tunnel `authority` to: the HTTP/1-only one
    /// for authorities known to lack HTTP/2, the primary one otherwise.
    pub fn listener_for(&self, authority: &str) -> ProxyResult<SocketAddr> {
        let target = Target::parse(authority)?;
        let addr = if self.pool.memo().is_http1_only(&target.pool_key()) {
            self.http1
        } else {
            self.primary
        };
        Ok(loopback_for(addr))
    }

    /// Probes `authority` for HTTP/2 support without verifying its certificate.
    pub async fn probe_http2(&self, authority: &str) -> ProxyResult<bool> {
        let target = Target::parse(authority)?;
        self.pool.probe(&target).await
    }

    /// Client for one-shot requests relayed through this gateway.
    pub fn http2_client(&self) -> ProxyResult<Http2RequestClient> {
        Http2RequestClient::new(loopback_for(self.primary), &self.ca_cert_pem)
    }
}

/// Wildcard listen addresses are dialled on loopback.
fn loopback_for(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
        _ => addr,
    }
}
