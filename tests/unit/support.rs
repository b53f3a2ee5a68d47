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

//! Fixtures shared by the integration tests: local TLS upstreams, a connection
//! sink, and a gateway bound to ephemeral ports.

#![allow(dead_code)]

use std::{
    io::Write,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use http::{HeaderMap, Method, Response};
use mitm_gateway::{
    config::GatewayConfig,
    proxy::{hooks::Hook, GatewayHandle, HookRegistry, LocalServer},
    telemetry::TelemetrySink,
    tls::{
        build_http1_server_config, build_server_config, CertificateAuthority, CertificateStore,
        KeySource,
    },
    utils::ProxyResult,
};
use rcgen::KeyPair;
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{client::TlsStream, TlsAcceptor, TlsConnector};

/// ECDSA keys keep certificate minting cheap in tests.
#[derive(Debug, Default)]
pub struct FastKeys;

impl KeySource for FastKeys {
    fn generate(&self) -> ProxyResult<KeyPair> {
        Ok(KeyPair::generate()?)
    }
}

pub fn fast_store() -> Arc<CertificateStore> {
    let authority = CertificateAuthority::generate(&FastKeys).expect("ca");
    Arc::new(CertificateStore::with_key_source(authority, 64, Arc::new(FastKeys)))
}

/// A TLS test server answering every request with `"{label} {method} {path} {body_len}"`.
///
/// Paths ending in `/gzip` are answered gzip-compressed.
pub struct Upstream {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("https://localhost:{}{path}", self.addr.port())
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Spawns an upstream offering h2 and http/1.1 (`h2 = true`) or http/1.1 only.
pub async fn spawn_upstream(certs: Arc<CertificateStore>, h2: bool) -> Upstream {
    let config = if h2 {
        build_server_config(certs)
    } else {
        build_http1_server_config(certs)
    };
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));

    let (conn_count, req_count) = (connections.clone(), requests.clone());
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            conn_count.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            let requests = req_count.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(socket).await else {
                    return;
                };
                if tls.get_ref().1.alpn_protocol() == Some(b"h2") {
                    serve_h2(tls, requests).await;
                } else {
                    serve_h1_once(tls, "upstream", requests).await;
                }
            });
        }
    });

    Upstream {
        addr,
        connections,
        requests,
    }
}

/// Plain-TCP HTTP/1.1 server standing in for the control interface.
pub async fn spawn_control() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind control");
    let addr = listener.local_addr().expect("addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));

    let (conn_count, req_count) = (connections.clone(), requests.clone());
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            conn_count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_h1_once(socket, "control", req_count.clone()));
        }
    });

    Upstream {
        addr,
        connections,
        requests,
    }
}

/// Listener that only counts connections and bytes; it never answers.
pub async fn spawn_sink() -> (SocketAddr, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind sink");
    let addr = listener.local_addr().expect("addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let bytes = Arc::new(AtomicUsize::new(0));

    let (conn_count, byte_count) = (connections.clone(), bytes.clone());
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            conn_count.fetch_add(1, Ordering::SeqCst);
            let byte_count = byte_count.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    byte_count.fetch_add(n, Ordering::SeqCst);
                }
            });
        }
    });

    (addr, connections, bytes)
}

fn reply(label: &str, method: &str, path: &str, body_len: usize) -> (Vec<(&'static str, String)>, Bytes) {
    let text = format!("{label} {method} {path} {body_len}");
    let mut headers = vec![("content-type", "text/plain; charset=utf-8".to_string())];
    if path.ends_with("/gzip") {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).expect("gzip");
        headers.push(("content-encoding", "gzip".to_string()));
        (headers, Bytes::from(encoder.finish().expect("gzip")))
    } else {
        (headers, Bytes::from(text))
    }
}

async fn serve_h2<T>(io: T, requests: Arc<AtomicUsize>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let Ok(mut connection) = h2::server::handshake(io).await else {
        return;
    };
    while let Some(Ok((request, mut respond))) = connection.accept().await {
        let requests = requests.clone();
        tokio::spawn(async move {
            let (parts, mut body) = request.into_parts();
            let mut len = 0;
            while let Some(Ok(chunk)) = body.data().await {
                len += chunk.len();
                let _ = body.flow_control().release_capacity(chunk.len());
            }
            requests.fetch_add(1, Ordering::SeqCst);

            let (headers, payload) = reply("upstream", parts.method.as_str(), parts.uri.path(), len);
            let mut builder = Response::builder().status(200);
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            builder = builder.header("content-length", payload.len());
            let response = builder.body(()).expect("response");
            if let Ok(mut stream) = respond.send_response(response, false) {
                let _ = stream.send_data(payload, true);
            }
        });
    }
}

/// Serves a single HTTP/1.1 request, then closes.
async fn serve_h1_once<T>(io: T, label: &'static str, requests: Arc<AtomicUsize>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(io);
    let mut line = String::new();
    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
        return;
    }
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut content_length = 0usize;
    let mut chunked = false;
    loop {
        line.clear();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().unwrap_or(0);
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.eq_ignore_ascii_case("chunked");
            }
        }
    }

    let body_len = if chunked {
        read_chunked(&mut reader).await
    } else {
        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        content_length
    };
    requests.fetch_add(1, Ordering::SeqCst);

    let (headers, payload) = reply(label, &method, &path, body_len);
    let mut head = String::from("HTTP/1.1 200 OK\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("content-length: {}\r\nconnection: close\r\n\r\n", payload.len()));

    let mut io = reader.into_inner();
    let _ = io.write_all(head.as_bytes()).await;
    let _ = io.write_all(&payload).await;
    let _ = io.shutdown().await;
}

async fn read_chunked<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> usize {
    let mut total = 0;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return total;
        }
        let size = usize::from_str_radix(line.trim().split(';').next().unwrap_or("0"), 16).unwrap_or(0);
        if size == 0 {
            line.clear();
            let _ = reader.read_line(&mut line).await;
            return total;
        }
        let mut chunk = vec![0u8; size + 2];
        if reader.read_exact(&mut chunk).await.is_err() {
            return total;
        }
        total += size;
    }
}

/// A gateway bound to ephemeral ports, trusting `upstream_ca` for upstream TLS.
pub struct Gateway {
    pub handle: GatewayHandle,
    pub certs: Arc<CertificateStore>,
    pub config: GatewayConfig,
    _dir: TempDir,
}

pub struct GatewayOptions<'a> {
    pub upstream_ca: &'a CertificateStore,
    pub control_port: u16,
    pub rules_toml: &'a str,
    pub hooks: Vec<Arc<dyn Hook>>,
}

pub async fn spawn_gateway(options: GatewayOptions<'_>) -> Gateway {
    spawn_gateway_with_certs(options, fast_store()).await
}

/// Like [`spawn_gateway`], with the caller's certificate store for the listeners.
pub async fn spawn_gateway_with_certs(
    options: GatewayOptions<'_>,
    certs: Arc<CertificateStore>,
) -> Gateway {
    let dir = tempfile::tempdir().expect("tempdir");
    let upstream_ca_path = dir.path().join("upstream-ca.pem");
    std::fs::write(&upstream_ca_path, options.upstream_ca.ca_cert_pem()).expect("write upstream ca");

    let raw = format!(
        r#"
        [listeners]
        mitm = {{ host = "127.0.0.1", port = 0 }}
        mitm_http1 = {{ host = "127.0.0.1", port = 0 }}
        control = {{ host = "127.0.0.1", port = {control_port} }}

        [tls]
        ca_cert_path = "gateway-ca.pem"
        ca_key_path = "gateway-ca.key"

        [upstream]
        ca_cert_path = "upstream-ca.pem"
        connect_timeout_secs = 5
        handshake_timeout_secs = 5

        [control]
        hostname = "gateway.local"

        {rules}
        "#,
        control_port = options.control_port,
        rules = options.rules_toml,
    );
    let config = GatewayConfig::from_toml_str(&raw, Some(dir.path())).expect("config");

    let hooks = HookRegistry::from_config(&config.hooks, options.hooks).expect("hooks");
    let telemetry = TelemetrySink::new(config.telemetry.clone());
    let server = LocalServer::bind(&config, certs.clone(), hooks, telemetry)
        .await
        .expect("bind gateway");
    let handle = server.handle();
    tokio::spawn(server.run());

    Gateway {
        handle,
        certs,
        config,
        _dir: dir,
    }
}

/// Client TLS config trusting only `certs`' CA.
pub fn client_tls(certs: &CertificateStore, alpn: &[&[u8]]) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots
        .add(certs.authority().cert_der().clone())
        .expect("trust ca");
    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
    Arc::new(config)
}

pub async fn connect_tls(
    addr: SocketAddr,
    sni: &str,
    config: Arc<ClientConfig>,
) -> TlsStream<TcpStream> {
    let tcp = TcpStream::connect(addr).await.expect("connect");
    TlsConnector::from(config)
        .connect(ServerName::try_from(sni.to_string()).expect("sni"), tcp)
        .await
        .expect("tls handshake")
}

/// Minimal keep-alive HTTP/1.1 client over a TLS connection.
pub struct H1Client {
    io: BufReader<TlsStream<TcpStream>>,
}

pub struct H1Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl H1Response {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl H1Client {
    pub fn new(io: TlsStream<TcpStream>) -> Self {
        Self {
            io: BufReader::new(io),
        }
    }

    pub fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        self.io.get_ref().get_ref().1.alpn_protocol().map(<[u8]>::to_vec)
    }

    pub async fn send(&mut self, method: Method, host: &str, path: &str, body: &[u8]) -> H1Response {
        let head = format!(
            "{method} {path} HTTP/1.1\r\nhost: {host}\r\ncontent-length: {}\r\n\r\n",
            body.len()
        );
        let stream = self.io.get_mut();
        stream.write_all(head.as_bytes()).await.expect("write head");
        stream.write_all(body).await.expect("write body");
        stream.flush().await.expect("flush");
        self.read_response().await
    }

    async fn read_response(&mut self) -> H1Response {
        let mut line = String::new();
        self.io.read_line(&mut line).await.expect("status line");
        let status = line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status code");

        let mut headers = HeaderMap::new();
        loop {
            line.clear();
            self.io.read_line(&mut line).await.expect("header line");
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            let (name, value) = trimmed.split_once(':').expect("header");
            headers.append(
                http::header::HeaderName::from_bytes(name.trim().as_bytes()).expect("name"),
                value.trim().parse().expect("value"),
            );
        }

        let body = if let Some(len) = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
        {
            let mut body = vec![0u8; len];
            self.io.read_exact(&mut body).await.expect("body");
            body
        } else if headers
            .get(http::header::TRANSFER_ENCODING)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"chunked"))
        {
            read_chunked_body(&mut self.io).await
        } else {
            let mut body = Vec::new();
            let _ = self.io.read_to_end(&mut body).await;
            body
        };

        H1Response {
            status,
            headers,
            body,
        }
    }
}

async fn read_chunked_body<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut body = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        reader.read_line(&mut line).await.expect("chunk size");
        let size = usize::from_str_radix(line.trim(), 16).expect("hex size");
        if size == 0 {
            line.clear();
            reader.read_line(&mut line).await.expect("final crlf");
            return body;
        }
        let mut chunk = vec![0u8; size + 2];
        reader.read_exact(&mut chunk).await.expect("chunk");
        body.extend_from_slice(&chunk[..size]);
    }
}
