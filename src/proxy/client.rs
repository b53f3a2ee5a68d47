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

//! Upstream Connection Layer: TCP dialing, upstream-proxy CONNECT tunnels, client TLS
//! with explicit ALPN/SNI, and the guard that keeps the gateway from dialing itself.

use std::{
    fs,
    io::BufReader as StdBufReader,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{lookup_host, TcpStream},
    time::timeout,
};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::{
    config::{UpstreamConfig, UpstreamProxy},
    proxy::flow::{Scheme, Target},
    tls::resolver::{ALPN_H2, ALPN_HTTP11},
    utils::{ProxyError, ProxyResult},
};

pub type UpstreamTlsStream = TlsStream<TcpStream>;

/// Any bidirectional byte stream an HTTP/1.1 upstream exchange can run over.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpstreamIo for T {}

pub type BoxedIo = Box<dyn UpstreamIo>;

const MAX_TUNNEL_RESPONSE: usize = 16 * 1024;

/// ALPN protocols offered on an upstream handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnOffer {
    Http1,
    /// h2 first, then http/1.1; used for capability probes.
    Any,
}

impl AlpnOffer {
    fn protocols(self) -> Vec<Vec<u8>> {
        match self {
            AlpnOffer::Http1 => vec![ALPN_HTTP11.to_vec()],
            AlpnOffer::Any => vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()],
        }
    }
}

/// The gateway's own listen addresses, used to refuse connections back to itself.
#[derive(Debug, Clone, Default)]
pub struct SelfAddresses {
    ips: Vec<IpAddr>,
    ports: Vec<u16>,
}

impl SelfAddresses {
    pub fn new(listen: &[SocketAddr]) -> Self {
        Self {
            ips: listen.iter().map(SocketAddr::ip).collect(),
            ports: listen.iter().map(SocketAddr::port).collect(),
        }
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        if !self.ports.contains(&addr.port()) {
            return false;
        }
        let ip = addr.ip();
        ip.is_loopback() || ip.is_unspecified() || self.ips.contains(&ip)
    }
}

/// Dials real servers on behalf of relayed exchanges. Cheap to clone.
#[derive(Clone)]
pub struct UpstreamConnector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    proxy: Option<UpstreamProxy>,
    /// `None` when certificate verification is disabled.
    roots: Option<Arc<RootCertStore>>,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    self_addrs: SelfAddresses,
}

impl UpstreamConnector {
    pub fn new(cfg: &UpstreamConfig, self_addrs: SelfAddresses) -> anyhow::Result<Self> {
        let roots = if cfg.verify_certificates {
            Some(Arc::new(load_roots(cfg)?))
        } else {
            tracing::warn!("upstream certificate verification is disabled");
            None
        };
        Ok(Self {
            inner: Arc::new(ConnectorInner {
                proxy: cfg.proxy.clone(),
                roots,
                connect_timeout: cfg.connect_timeout(),
                handshake_timeout: cfg.handshake_timeout(),
                self_addrs,
            }),
        })
    }

    /// Trust anchors for upstream verification; `None` means verification is off.
    pub fn trust_store(&self) -> Option<Arc<RootCertStore>> {
        self.inner.roots.clone()
    }

    /// Resolves `host` and connects to the first address that answers.
    pub async fn direct_connect(&self, host: &str, port: u16) -> ProxyResult<TcpStream> {
        let label = format!("{host}:{port}");
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|err| ProxyError::Connect {
                target: label.clone(),
                reason: format!("DNS resolution failed: {err}"),
            })?
            .collect();

        if let Some(addr) = addrs.iter().find(|addr| self.inner.self_addrs.contains(addr)) {
            tracing::debug!(%label, %addr, "refusing to connect to the gateway itself");
            return Err(ProxyError::IsSelf {
                host: host.to_string(),
                port,
            });
        }

        let mut last_err = None;
        for addr in addrs {
            match timeout(self.inner.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::trace!(%label, %addr, "upstream TCP connected");
                    return Ok(stream);
                }
                Ok(Err(err)) => {
                    tracing::debug!(%label, %addr, error = %err, "upstream TCP connect failed");
                    last_err = Some(err.to_string());
                }
                Err(_) => {
                    tracing::debug!(%label, %addr, "upstream TCP connect timed out");
                    last_err = Some(format!("timed out after {:?}", self.inner.connect_timeout));
                }
            }
        }

        Err(ProxyError::Connect {
            target: label,
            reason: last_err.unwrap_or_else(|| "DNS returned no addresses".into()),
        })
    }

    /// Opens a tunnel to `host:port` through an HTTP proxy with `CONNECT`.
    pub async fn http_tunnel(
        &self,
        host: &str,
        port: u16,
        proxy: &UpstreamProxy,
    ) -> ProxyResult<TcpStream> {
        // Authority-form always carries the port, even 443.
        let authority = format!("{}:{port}", Target::https(host, port).uri_host());
        let mut stream = self.direct_connect(&proxy.host, proxy.port).await?;

        let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;

        // Byte-at-a-time so nothing past the proxy's response head is consumed.
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_TUNNEL_RESPONSE {
                return Err(ProxyError::Protocol("oversized CONNECT response".into()));
            }
            let read = timeout(self.inner.handshake_timeout, stream.read(&mut byte))
                .await
                .map_err(|_| ProxyError::Timeout(format!("CONNECT {authority}")))??;
            if read == 0 {
                return Err(ProxyError::TunnelRejected {
                    target: authority,
                    status_line: "proxy closed the connection".into(),
                });
            }
            head.push(byte[0]);
        }

        let status_line = String::from_utf8_lossy(&head)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();
        if !(status_line.starts_with("HTTP/1.1 200") || status_line.starts_with("HTTP/1.0 200")) {
            return Err(ProxyError::TunnelRejected {
                target: authority,
                status_line,
            });
        }
        tracing::trace!(%authority, proxy = %proxy.host, "CONNECT tunnel established");
        Ok(stream)
    }

    /// TCP path to `target`, tunnelled when an upstream proxy is configured.
    pub async fn connect_raw(&self, target: &Target) -> ProxyResult<TcpStream> {
        match &self.inner.proxy {
            Some(proxy) => {
                self.guard_literal(target)?;
                self.http_tunnel(&target.host, target.port, proxy).await
            }
            None => self.direct_connect(&target.host, target.port).await,
        }
    }

    /// The proxy resolves names itself; only literal addresses can be checked here.
    fn guard_literal(&self, target: &Target) -> ProxyResult<()> {
        let ip = if target.host == "localhost" {
            Some(IpAddr::from([127, 0, 0, 1]))
        } else {
            target.host.parse::<IpAddr>().ok()
        };
        match ip {
            Some(ip) if self.inner.self_addrs.contains(&SocketAddr::new(ip, target.port)) => {
                Err(ProxyError::IsSelf {
                    host: target.host.clone(),
                    port: target.port,
                })
            }
            _ => Ok(()),
        }
    }

    /// Runs a client TLS handshake over `raw`.
    ///
    /// `trusted = None` disables certificate validation. `sni` overrides the name sent
    /// and verified; IP literals are never sent as SNI.
    pub async fn create_tls_socket(
        &self,
        raw: TcpStream,
        trusted: Option<Arc<RootCertStore>>,
        target: &Target,
        alpn: AlpnOffer,
        sni: Option<&str>,
    ) -> ProxyResult<UpstreamTlsStream> {
        let name = sni.unwrap_or(&target.host);
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|err| ProxyError::TlsHandshake(format!("invalid server name {name:?}: {err}")))?;

        let mut config = match trusted {
            Some(roots) => ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
            None => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth(),
        };
        config.alpn_protocols = alpn.protocols();
        if matches!(server_name, ServerName::IpAddress(_)) {
            config.enable_sni = false;
        }

        let connector = TlsConnector::from(Arc::new(config));
        let stream = timeout(self.inner.handshake_timeout, connector.connect(server_name, raw))
            .await
            .map_err(|_| ProxyError::Timeout(format!("TLS handshake with {}", target.authority())))?
            .map_err(|err| {
                ProxyError::TlsHandshake(format!("{}: {err}", target.authority()))
            })?;

        tracing::trace!(
            authority = %target.authority(),
            alpn = ?negotiated_alpn(&stream),
            "upstream TLS established"
        );
        Ok(stream)
    }

    /// Verified TLS connection to `target` offering `alpn`.
    pub async fn connect_tls(&self, target: &Target, alpn: AlpnOffer) -> ProxyResult<UpstreamTlsStream> {
        let raw = self.connect_raw(target).await?;
        self.create_tls_socket(raw, self.trust_store(), target, alpn, None)
            .await
    }

    /// Fresh socket for one HTTP/1.1 exchange: TLS for https targets, plain otherwise.
    pub async fn connect_http1(&self, target: &Target) -> ProxyResult<BoxedIo> {
        match target.scheme {
            Scheme::Https => Ok(Box::new(self.connect_tls(target, AlpnOffer::Http1).await?)),
            Scheme::Http => Ok(Box::new(self.connect_raw(target).await?)),
        }
    }

    /// Unverified handshake offering h2 and http/1.1; true when the server picks h2.
    pub async fn probe_h2(&self, target: &Target) -> ProxyResult<bool> {
        let raw = self.connect_raw(target).await?;
        let stream = self
            .create_tls_socket(raw, None, target, AlpnOffer::Any, None)
            .await?;
        Ok(negotiated_alpn(&stream).as_deref() == Some(ALPN_H2))
    }

    /// Plain TCP to a local service, bypassing the upstream proxy and self guard.
    pub async fn connect_local(&self, addr: SocketAddr) -> ProxyResult<TcpStream> {
        timeout(self.inner.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProxyError::Timeout(format!("connect to {addr}")))?
            .map_err(|err| ProxyError::Connect {
                target: addr.to_string(),
                reason: err.to_string(),
            })
    }
}

pub fn negotiated_alpn(stream: &UpstreamTlsStream) -> Option<Vec<u8>> {
    stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec)
}

fn load_roots(cfg: &UpstreamConfig) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &cfg.ca_cert_path {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open upstream CA {}", path.display()))?;
        let mut reader = StdBufReader::new(file);
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.with_context(|| format!("invalid PEM in {}", path.display()))?;
            roots
                .add(cert)
                .with_context(|| format!("unusable CA certificate in {}", path.display()))?;
            added += 1;
        }
        anyhow::ensure!(added > 0, "no certificates found in {}", path.display());
        tracing::info!(path = %path.display(), added, "trusting extra upstream CA");
    }

    Ok(roots)
}

/// Accepts any server certificate; only for probes and explicitly unverified setups.
#[derive(Debug)]
struct NoVerifier;

static SUPPORTED_SIG_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::RSA_PKCS1_SHA256,
    SignatureScheme::RSA_PKCS1_SHA384,
    SignatureScheme::RSA_PKCS1_SHA512,
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ECDSA_NISTP521_SHA512,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PSS_SHA512,
    SignatureScheme::ED25519,
];

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        SUPPORTED_SIG_SCHEMES.to_vec()
    }
}
