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

//! Per-connection handling for the MITM listeners: TLS termination with on-demand
//! certificates, the ALPN decision, and the HTTP/1.1 and HTTP/2 session drivers that
//! feed requests into [`relay_exchange`].

use std::{future::poll_fn, net::SocketAddr, sync::Arc, task::Poll, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use h2::{
    server::{self as h2_server, SendResponse},
    Reason, SendStream,
};
use http::{header, HeaderValue, Method, Response, StatusCode, Version};
use rustls::{server::Acceptor, ServerConfig};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::mpsc,
    task::JoinSet,
    time::timeout,
};
use tokio_rustls::{server::TlsStream, LazyConfigAcceptor};

use crate::{
    proxy::{
        exchange::{
            relay_exchange, send_h2_data, BodyHint, BodySource, ClientProtocol, ConnectionInfo,
            H2Body, RelayContext, Responder,
        },
        flow::{RequestParts, ResponseParts, Target},
        http1::{self, BodyReader, BodyWriter},
    },
    tls::{
        cert::{normalize_sni, CertificateStore, FALLBACK_SNI},
        resolver::{ALPN_H2, ALPN_HTTP11},
    },
    utils::{ProxyError, ProxyResult},
};

type ClientTlsStream = TlsStream<TcpStream>;

/// First byte of every TLS record carrying a handshake message.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Which MITM listener accepted a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// Offers h2 and http/1.1.
    Primary,
    /// Only ever negotiates http/1.1.
    Http1Only,
}

/// Shared by every connection accepted on either listener.
pub struct ListenerContext {
    pub relay: Arc<RelayContext>,
    pub certs: Arc<CertificateStore>,
    pub h2_config: Arc<ServerConfig>,
    pub h1_config: Arc<ServerConfig>,
    pub handshake_timeout: Duration,
}

/// Drives one accepted socket from the first byte to close.
pub async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    kind: ListenerKind,
    ctx: Arc<ListenerContext>,
) -> ProxyResult<()> {
    let mut first = [0u8; 1];
    if socket.peek(&mut first).await? == 0 {
        return Ok(());
    }
    if first[0] != TLS_HANDSHAKE_RECORD {
        tracing::debug!(%peer, "non-TLS client on MITM listener");
        return reject_plaintext(socket).await;
    }

    let (stream, sni) = accept_tls(socket, kind, &ctx).await?;
    let negotiated_h2 = stream.get_ref().1.alpn_protocol() == Some(ALPN_H2);
    tracing::debug!(%peer, sni = ?sni, h2 = negotiated_h2, ?kind, "client TLS established");

    let info = ConnectionInfo {
        peer,
        sni,
        protocol: if negotiated_h2 {
            ClientProtocol::Http2
        } else {
            ClientProtocol::Http1
        },
    };

    if negotiated_h2 {
        serve_http2(stream, info, ctx.relay.clone()).await
    } else {
        serve_http1(stream, info, &ctx.relay).await
    }
}

async fn reject_plaintext(mut socket: TcpStream) -> ProxyResult<()> {
    let body = "this port only accepts TLS\n";
    let response = format!(
        "HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await?;
    Ok(())
}

/// Reads the ClientHello first so the primary listener can steer memoised
/// HTTP/1-only authorities straight to http/1.1.
async fn accept_tls(
    socket: TcpStream,
    kind: ListenerKind,
    ctx: &ListenerContext,
) -> ProxyResult<(ClientTlsStream, Option<String>)> {
    let limit = ctx.handshake_timeout;
    let start = timeout(limit, LazyConfigAcceptor::new(Acceptor::default(), socket))
        .await
        .map_err(|_| ProxyError::Timeout("client TLS handshake".into()))?
        .map_err(|err| ProxyError::TlsHandshake(err.to_string()))?;

    let hello = start.client_hello();
    let sni = hello.server_name().map(normalize_sni);
    let offers_http1 = hello
        .alpn()
        .map(|mut protocols| protocols.any(|proto| proto == ALPN_HTTP11))
        .unwrap_or(true);

    let config = match (kind, sni.as_deref()) {
        (ListenerKind::Http1Only, _) => ctx.h1_config.clone(),
        (ListenerKind::Primary, Some(host))
            if offers_http1
                && ctx
                    .relay
                    .pool
                    .memo()
                    .is_http1_only(&Target::https(host, 443).pool_key()) =>
        {
            tracing::debug!(sni = host, "steering client to http/1.1 for memoised authority");
            ctx.h1_config.clone()
        }
        (ListenerKind::Primary, _) => ctx.h2_config.clone(),
    };

    let leaf_name = sni.clone().unwrap_or_else(|| FALLBACK_SNI.to_string());
    prepare_leaf(&ctx.certs, leaf_name).await?;

    let stream = timeout(limit, start.into_stream(config))
        .await
        .map_err(|_| ProxyError::Timeout("client TLS handshake".into()))?
        .map_err(|err| ProxyError::TlsHandshake(err.to_string()))?;
    Ok((stream, sni))
}

/// Mints a missing leaf on the blocking pool so the resolver inside the handshake
/// only ever hits the cache. RSA key generation would otherwise stall the worker.
async fn prepare_leaf(certs: &Arc<CertificateStore>, hostname: String) -> ProxyResult<()> {
    if certs.is_cached(&hostname) {
        return Ok(());
    }
    let certs = certs.clone();
    tokio::task::spawn_blocking(move || certs.get_cert_and_key(&hostname).map(drop))
        .await
        .map_err(|err| ProxyError::Certificate(format!("leaf issuance task failed: {err}")))?
}

/// Keep-alive loop: one exchange per request until either side wants to close.
async fn serve_http1(
    stream: ClientTlsStream,
    info: ConnectionInfo,
    relay: &RelayContext,
) -> ProxyResult<()> {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let head = match http1::read_request_head(&mut reader).await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(ProxyError::Io(err)) => {
                tracing::debug!(peer = %info.peer, "client read failed: {err}");
                break;
            }
            Err(err) => {
                tracing::debug!(peer = %info.peer, "malformed request: {err}");
                write_bad_request(&mut write_half, &err).await;
                break;
            }
        };

        let framing = match http1::request_body_framing(&head.headers) {
            Ok(framing) => framing,
            Err(err) => {
                write_bad_request(&mut write_half, &err).await;
                break;
            }
        };
        let client_close = http1::wants_close(head.version, &head.headers);

        let mut body = H1RequestBody {
            reader: &mut reader,
            body: BodyReader::new(framing),
            hint: BodyHint::from_framing(framing),
        };
        let mut responder = H1Responder::new(&mut write_half, &head, client_close);
        let outcome = relay_exchange(relay, &info, head, &mut body, &mut responder).await;

        if !outcome.completed || !responder.keep_alive || !body.body.is_done() {
            break;
        }
    }

    let _ = write_half.shutdown().await;
    Ok(())
}

async fn write_bad_request<W>(writer: &mut W, err: &ProxyError)
where
    W: AsyncWrite + Unpin,
{
    let body = format!("bad request: {err}\n");
    let mut head = ResponseParts::new(StatusCode::BAD_REQUEST, Default::default());
    head.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    head.headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    head.headers
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    if http1::write_response_head(writer, &head).await.is_ok() {
        let _ = writer.write_all(body.as_bytes()).await;
        let _ = writer.flush().await;
    }
}

struct H1RequestBody<'a, R> {
    reader: &'a mut BufReader<R>,
    body: BodyReader,
    hint: BodyHint,
}

#[async_trait]
impl<R> BodySource for H1RequestBody<'_, R>
where
    R: AsyncRead + Send + Unpin,
{
    async fn next_chunk(&mut self) -> ProxyResult<Option<Bytes>> {
        self.body.next_chunk(&mut *self.reader).await
    }

    fn hint(&self) -> BodyHint {
        self.hint
    }
}

struct H1Responder<'a, W> {
    writer: &'a mut W,
    version: Version,
    method: Method,
    keep_alive: bool,
    head_sent: bool,
    body: BodyWriter,
}

impl<'a, W> H1Responder<'a, W> {
    fn new(writer: &'a mut W, request: &RequestParts, client_close: bool) -> Self {
        Self {
            writer,
            version: request.version,
            method: request.method.clone(),
            keep_alive: !client_close,
            head_sent: false,
            body: BodyWriter::Raw,
        }
    }
}

#[async_trait]
impl<W> Responder for H1Responder<'_, W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn send_head(&mut self, head: &ResponseParts, hint: BodyHint) -> ProxyResult<()> {
        let mut parts = head.clone();
        parts.version = if self.version == Version::HTTP_10 {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        };

        match hint {
            BodyHint::Empty => {
                let bodiless =
                    self.method == Method::HEAD || !http1::status_allows_body(parts.status);
                if !bodiless && !parts.headers.contains_key(header::CONTENT_LENGTH) {
                    parts
                        .headers
                        .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                }
                self.body = BodyWriter::Raw;
            }
            BodyHint::Length(len) => {
                parts
                    .headers
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                self.body = BodyWriter::Raw;
            }
            BodyHint::Unknown if parts.version == Version::HTTP_11 => {
                parts.headers.remove(header::CONTENT_LENGTH);
                parts
                    .headers
                    .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                self.body = BodyWriter::Chunked;
            }
            BodyHint::Unknown => {
                parts.headers.remove(header::CONTENT_LENGTH);
                self.keep_alive = false;
                self.body = BodyWriter::Raw;
            }
        }

        if !self.keep_alive {
            parts
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        } else if parts.version == Version::HTTP_10 {
            parts
                .headers
                .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        self.head_sent = true;
        http1::write_response_head(&mut *self.writer, &parts).await
    }

    async fn send_data(&mut self, data: Bytes) -> ProxyResult<()> {
        self.body.write(&mut *self.writer, &data).await
    }

    async fn finish(&mut self) -> ProxyResult<()> {
        self.body.finish(&mut *self.writer).await
    }

    fn head_sent(&self) -> bool {
        self.head_sent
    }

    async fn abort(&mut self) {
        self.keep_alive = false;
        let _ = self.writer.shutdown().await;
    }
}

/// HTTP/2 session: each stream becomes its own task. A downgrade signal from any
/// stream stops relaying new streams, and once the in-flight ones finish the
/// session ends with GOAWAY `HTTP_1_1_REQUIRED`.
async fn serve_http2(
    stream: ClientTlsStream,
    info: ConnectionInfo,
    relay: Arc<RelayContext>,
) -> ProxyResult<()> {
    let mut connection = h2_server::handshake(stream).await?;
    let (downgrade_tx, mut downgrade_rx) = mpsc::channel::<()>(1);
    let info = Arc::new(info);
    // Dropping the set on close aborts relays whose client is gone.
    let mut relays = JoinSet::new();
    let mut draining = false;
    let mut going_away = false;

    loop {
        tokio::select! {
            next = connection.accept() => match next {
                None => break,
                Some(Err(err)) => {
                    tracing::debug!(peer = %info.peer, "HTTP/2 session ended: {err}");
                    break;
                }
                Some(Ok((_, respond))) if draining => refuse_stream(respond),
                Some(Ok((request, respond))) => {
                    let relay = relay.clone();
                    let info = info.clone();
                    let downgrade = downgrade_tx.clone();
                    relays.spawn(async move {
                        let (parts, recv) = request.into_parts();
                        let head = RequestParts {
                            method: parts.method,
                            uri: parts.uri,
                            version: Version::HTTP_2,
                            headers: parts.headers,
                        };
                        let mut body = H2Body::new(recv, &head.headers, None);
                        let mut responder = H2Responder::new(respond, downgrade);
                        relay_exchange(&relay, &info, head, &mut body, &mut responder).await;
                    });
                }
            },
            Some(()) = downgrade_rx.recv(), if !draining => {
                tracing::debug!(peer = %info.peer, in_flight = relays.len(), "draining HTTP/2 session before GOAWAY");
                draining = true;
            }
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }

        if draining && !going_away && relays.is_empty() {
            // GOAWAY with an error code clears queued frames, so flush the 505s first.
            poll_fn(|cx| {
                while let Poll::Ready(Some(Ok((_, respond)))) = connection.poll_accept(cx) {
                    refuse_stream(respond);
                }
                Poll::Ready(())
            })
            .await;
            tracing::info!(peer = %info.peer, sni = ?info.sni, "sending GOAWAY HTTP_1_1_REQUIRED");
            connection.abrupt_shutdown(Reason::HTTP_1_1_REQUIRED);
            going_away = true;
        }
    }

    Ok(())
}

/// Streams opened after a downgrade are answered 505 without being relayed.
fn refuse_stream(mut respond: SendResponse<Bytes>) {
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::HTTP_VERSION_NOT_SUPPORTED;
    let _ = respond.send_response(response, true);
}

struct H2Responder {
    respond: SendResponse<Bytes>,
    stream: Option<SendStream<Bytes>>,
    head_sent: bool,
    downgrade: mpsc::Sender<()>,
}

impl H2Responder {
    fn new(respond: SendResponse<Bytes>, downgrade: mpsc::Sender<()>) -> Self {
        Self {
            respond,
            stream: None,
            head_sent: false,
            downgrade,
        }
    }
}

#[async_trait]
impl Responder for H2Responder {
    async fn send_head(&mut self, head: &ResponseParts, hint: BodyHint) -> ProxyResult<()> {
        let mut response = Response::builder().status(head.status).body(())?;
        *response.headers_mut() = head.headers.clone();
        response.headers_mut().remove(header::CONNECTION);
        response.headers_mut().remove(header::TRANSFER_ENCODING);

        let end_of_stream = hint == BodyHint::Empty;
        self.head_sent = true;
        let stream = self
            .respond
            .send_response(response, end_of_stream)
            .map_err(|_| ProxyError::ClientGone)?;
        if !end_of_stream {
            self.stream = Some(stream);
        }
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> ProxyResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ProxyError::Protocol("response body after end of stream".into()))?;
        send_h2_data(stream, data)
            .await
            .map_err(|_| ProxyError::ClientGone)
    }

    async fn finish(&mut self) -> ProxyResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream
                .send_data(Bytes::new(), true)
                .map_err(|_| ProxyError::ClientGone)?;
        }
        Ok(())
    }

    fn head_sent(&self) -> bool {
        self.head_sent
    }

    async fn abort(&mut self) {
        match self.stream.as_mut() {
            Some(stream) => stream.send_reset(Reason::INTERNAL_ERROR),
            None => self.respond.send_reset(Reason::INTERNAL_ERROR),
        }
    }

    fn request_downgrade(&mut self) {
        let _ = self.downgrade.try_send(());
    }

    async fn closed(&mut self) {
        let _ = poll_fn(|cx| self.respond.poll_reset(cx)).await;
    }
}
