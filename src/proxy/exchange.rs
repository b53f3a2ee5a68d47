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

//! The per-request relay algorithm shared by the HTTP/1.1 and HTTP/2 client paths.
//!
//! A connection driver hands [`relay_exchange`] the request head, a [`BodySource`] for
//! the request body and a [`Responder`] for its side of the wire. Everything after that
//! (target resolution, control redirect, hook dispatch, upstream selection, streaming,
//! buffering for hooks, and error responses) happens here, once, for both protocols.

use std::{future::poll_fn, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use h2::{Reason, RecvStream, SendStream};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncWriteExt, BufReader};

use crate::{
    proxy::{
        body::decode_body,
        client::{BoxedIo, UpstreamConnector},
        flow::{BodyBuffer, Exchange, RequestParts, ResponseParts, Scheme, Target},
        hooks::{Dispatch, FakeResponse, HookRegistry, HookRequest, HookResponse, MatchedSet},
        http1::{self, BodyFraming, BodyReader, BodyWriter},
        pool::{H2SessionPool, StreamLease},
    },
    telemetry::TelemetrySink,
    utils::{ProxyError, ProxyResult},
};

/// Where requests for the reserved control hostname are sent.
#[derive(Debug, Clone)]
pub struct ControlRoute {
    pub hostname: String,
    pub addr: SocketAddr,
}

/// State shared by every connection on a gateway.
pub struct RelayContext {
    pub hooks: HookRegistry,
    pub pool: Arc<H2SessionPool>,
    pub connector: UpstreamConnector,
    pub telemetry: TelemetrySink,
    pub control: ControlRoute,
    pub exchange_timeout: Option<Duration>,
    pub max_buffered_body: usize,
}

/// Client-side facts about the connection an exchange arrived on.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub sni: Option<String>,
    pub protocol: ClientProtocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProtocol {
    Http1,
    Http2,
}

impl ClientProtocol {
    pub fn label(self) -> &'static str {
        match self {
            ClientProtocol::Http1 => "http/1.1",
            ClientProtocol::Http2 => "h2",
        }
    }
}

/// What is known up front about a body's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyHint {
    Empty,
    Length(u64),
    Unknown,
}

impl BodyHint {
    fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(|len| if len == 0 { BodyHint::Empty } else { BodyHint::Length(len) })
            .unwrap_or(BodyHint::Unknown)
    }

    pub fn from_framing(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::None | BodyFraming::Length(0) => BodyHint::Empty,
            BodyFraming::Length(len) => BodyHint::Length(len),
            BodyFraming::Chunked | BodyFraming::UntilClose => BodyHint::Unknown,
        }
    }
}

/// Pull-based body stream.
#[async_trait]
pub trait BodySource: Send {
    /// Next chunk, `None` once the body is complete.
    async fn next_chunk(&mut self) -> ProxyResult<Option<Bytes>>;

    fn hint(&self) -> BodyHint;
}

/// The client-facing half of one exchange.
#[async_trait]
pub trait Responder: Send {
    async fn send_head(&mut self, head: &ResponseParts, hint: BodyHint) -> ProxyResult<()>;

    async fn send_data(&mut self, data: Bytes) -> ProxyResult<()>;

    async fn finish(&mut self) -> ProxyResult<()>;

    fn head_sent(&self) -> bool;

    /// Ends the stream abruptly after a failure mid-response.
    async fn abort(&mut self);

    /// Asks the client connection to fall back to HTTP/1.1 (HTTP/2 GOAWAY).
    fn request_downgrade(&mut self) {}

    /// Resolves once the client abandoned the exchange.
    async fn closed(&mut self) {
        std::future::pending::<()>().await
    }
}

/// Body of an HTTP/2 stream, client request or upstream response alike.
pub struct H2Body {
    recv: RecvStream,
    hint: BodyHint,
    _lease: Option<StreamLease>,
}

impl H2Body {
    pub fn new(recv: RecvStream, headers: &HeaderMap, lease: Option<StreamLease>) -> Self {
        let hint = if recv.is_end_stream() {
            BodyHint::Empty
        } else {
            BodyHint::from_headers(headers)
        };
        Self {
            recv,
            hint,
            _lease: lease,
        }
    }
}

#[async_trait]
impl BodySource for H2Body {
    async fn next_chunk(&mut self) -> ProxyResult<Option<Bytes>> {
        match self.recv.data().await {
            None => Ok(None),
            Some(Ok(chunk)) => {
                let _ = self.recv.flow_control().release_capacity(chunk.len());
                Ok(Some(chunk))
            }
            Some(Err(err)) => Err(err.into()),
        }
    }

    fn hint(&self) -> BodyHint {
        self.hint
    }
}

/// Writes `data` to an HTTP/2 stream, waiting for flow-control capacity.
pub async fn send_h2_data(stream: &mut SendStream<Bytes>, mut data: Bytes) -> Result<(), h2::Error> {
    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let capacity = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(capacity) => capacity?,
            None => return Err(h2::Error::from(Reason::CANCEL)),
        };
        if capacity == 0 {
            continue;
        }
        let chunk = data.split_to(capacity.min(data.len()));
        stream.send_data(chunk, false)?;
    }
    Ok(())
}

/// Result reported back to the connection driver.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeOutcome {
    /// False when the exchange failed; HTTP/1.1 drivers close the connection then.
    pub completed: bool,
}

/// Relays one exchange end to end. Never fails: every error is answered on `responder`
/// or, once the response head is out, ends the client stream.
pub async fn relay_exchange(
    ctx: &RelayContext,
    conn: &ConnectionInfo,
    head: RequestParts,
    body: &mut dyn BodySource,
    responder: &mut dyn Responder,
) -> ExchangeOutcome {
    let mut exchange = Exchange::new(head);
    exchange.metadata.peer = Some(conn.peer);
    exchange.metadata.tls_sni = conn.sni.clone();
    exchange.metadata.client_protocol = Some(conn.protocol.label());

    let result = run_exchange(ctx, conn, &mut exchange, body, responder).await;
    let completed = match result {
        Ok(()) => true,
        Err(err) => {
            fail_exchange(&mut exchange, err, responder).await;
            false
        }
    };

    ctx.telemetry.record_exchange(&exchange);
    ExchangeOutcome { completed }
}

async fn fail_exchange(exchange: &mut Exchange, err: ProxyError, responder: &mut dyn Responder) {
    let target = exchange
        .target
        .as_ref()
        .map(Target::pool_key)
        .unwrap_or_default();
    match &err {
        ProxyError::ClientGone => {
            tracing::debug!(exchange = %exchange.id, %target, "client abandoned exchange")
        }
        ProxyError::IsSelf { .. } => {
            tracing::debug!(exchange = %exchange.id, %target, "request addressed to the gateway itself")
        }
        ProxyError::DowngradeRequired { .. } => {
            tracing::info!(exchange = %exchange.id, %target, "upstream requires HTTP/1.1")
        }
        _ => tracing::warn!(exchange = %exchange.id, %target, "exchange failed: {err}"),
    }

    if !matches!(err, ProxyError::IsSelf { .. }) {
        exchange.metadata.error = Some(err.to_string());
    }
    if responder.head_sent() {
        responder.abort().await;
    } else if !matches!(err, ProxyError::ClientGone) {
        let response = plain_response(err.status_code(), &err.client_message());
        exchange.response = Some(response.parts.clone());
        if let Err(write_err) = write_fixed(responder, &response, &exchange.request.method).await {
            tracing::debug!(exchange = %exchange.id, "could not deliver error response: {write_err}");
        }
    }
    // After the 505 is queued, so it reaches the client ahead of the GOAWAY.
    if err.is_downgrade() {
        responder.request_downgrade();
    }
}

/// A complete response held in memory: error pages, fakes, and benign answers.
struct FixedResponse {
    parts: ResponseParts,
    body: Bytes,
}

fn plain_response(status: StatusCode, message: &str) -> FixedResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    let body = Bytes::from(format!("{message}\n"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    FixedResponse {
        parts: ResponseParts::new(status, headers),
        body,
    }
}

fn fake_response(fake: &FakeResponse) -> FixedResponse {
    FixedResponse {
        parts: fake.response_parts(),
        body: fake.body_bytes(),
    }
}

async fn write_fixed(
    responder: &mut dyn Responder,
    response: &FixedResponse,
    method: &Method,
) -> ProxyResult<()> {
    let send_body = !response.body.is_empty() && method != Method::HEAD;
    let hint = if send_body {
        BodyHint::Length(response.body.len() as u64)
    } else {
        BodyHint::Empty
    };
    responder.send_head(&response.parts, hint).await?;
    if send_body {
        responder.send_data(response.body.clone()).await?;
    }
    responder.finish().await
}

async fn drain_body(body: &mut dyn BodySource) {
    loop {
        match body.next_chunk().await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return,
        }
    }
}

/// Works out where a request goes: absolute URI, then `Host`, then SNI.
pub fn resolve_target(request: &RequestParts, sni: Option<&str>) -> ProxyResult<Target> {
    if request.uri.scheme().is_some() {
        if let Some(authority) = request.uri.authority() {
            let scheme = request.uri.scheme_str().unwrap_or("https");
            return Target::parse(&format!("{scheme}://{authority}"));
        }
    }

    let host_header = request
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|host| !host.is_empty());
    if let Some(host) = host_header {
        return Target::parse(host);
    }

    match sni {
        Some(sni) => Ok(Target::https(sni, Scheme::Https.default_port())),
        None => Err(ProxyError::BadRequest("request names no host".into())),
    }
}

fn apply_replacement(
    exchange: &Exchange,
    target: &Target,
    matched: &MatchedSet,
) -> ProxyResult<(Target, Method, String)> {
    let mut upstream = target.clone();
    let mut method = exchange.request.method.clone();
    let mut path = exchange.request.path_and_query().to_string();

    if let Some(replacement) = matched.replacement() {
        if let Some(host) = &replacement.host {
            let replaced = Target::parse(&format!("{}://{host}", target.scheme.as_str()))?;
            tracing::debug!(exchange = %exchange.id, from = %target, to = %replaced, "hook replaced host");
            upstream = replaced;
        }
        if let Some(replaced) = &replacement.method {
            method = replaced.clone();
        }
        if let Some(replaced) = &replacement.path {
            path = if replaced.starts_with('/') {
                replaced.clone()
            } else {
                format!("/{replaced}")
            };
        }
    }

    Ok((upstream, method, path))
}

async fn run_exchange(
    ctx: &RelayContext,
    conn: &ConnectionInfo,
    exchange: &mut Exchange,
    body: &mut dyn BodySource,
    responder: &mut dyn Responder,
) -> ProxyResult<()> {
    if exchange.request.method == Method::CONNECT {
        return Err(ProxyError::BadRequest("CONNECT is not served on this listener".into()));
    }

    let target = resolve_target(&exchange.request, conn.sni.as_deref())?;
    exchange.target = Some(target.clone());

    if target.host == ctx.control.hostname {
        exchange.metadata.control = true;
        return relay_to_control(ctx, exchange, body, responder).await;
    }

    let hook_request = HookRequest {
        method: exchange.request.method.clone(),
        url: target.url(exchange.request.path_and_query())?,
        version: exchange.request.version,
        headers: exchange.request.headers.clone(),
    };

    let mut matched = match ctx.hooks.dispatch(&hook_request).await {
        Dispatch::Fake { index, response } => {
            drain_body(body).await;
            return serve_fake(ctx, exchange, index, &response, responder).await;
        }
        Dispatch::Fail(err) => {
            drain_body(body).await;
            return Err(err);
        }
        Dispatch::Pass(matched) => matched,
    };
    exchange.metadata.matched_hooks = matched.len();

    let (upstream_target, method, path) = apply_replacement(exchange, &target, &matched)?;
    let request_hint = body.hint();
    let mut call = open_upstream(ctx, conn, exchange, &upstream_target, &method, &path, request_hint).await?;

    let mut request_copy =
        (!matched.is_empty()).then(|| BodyBuffer::with_limit(ctx.max_buffered_body));
    while let Some(chunk) = body.next_chunk().await? {
        if let Some(copy) = request_copy.as_mut() {
            copy.push_bytes(&chunk);
        }
        call.send_data(chunk).await?;
    }
    call.finish_request().await?;

    if !matched.is_empty() {
        let decoded = request_copy
            .and_then(BodyBuffer::freeze)
            .map(|raw| decode_body(&exchange.request.headers, raw));
        if let Some((index, fake)) = matched.on_request_complete(&hook_request, decoded.as_ref()).await? {
            drop(call);
            return serve_fake(ctx, exchange, index, &fake, responder).await;
        }
    }

    let response = {
        let pending = call.response(&method);
        let pending = async {
            match ctx.exchange_timeout {
                Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                    ProxyError::Timeout(format!("no response from {upstream_target} within {limit:?}"))
                })?,
                None => pending.await,
            }
        };
        tokio::select! {
            response = pending => response?,
            _ = responder.closed() => return Err(ProxyError::ClientGone),
        }
    };
    let UpstreamResponse {
        mut head,
        hint,
        body: mut response_body,
    } = response;

    http1::strip_hop_by_hop(&mut head.headers);
    exchange.response = Some(head.clone());

    let intercept = matched.intercepts_response();
    exchange.metadata.intercepted = intercept;
    let mut response_copy = intercept.then(|| BodyBuffer::with_limit(ctx.max_buffered_body));

    responder.send_head(&head, hint).await?;
    while let Some(chunk) = response_body.next_chunk().await? {
        if let Some(copy) = response_copy.as_mut() {
            copy.push_bytes(&chunk);
        }
        responder.send_data(chunk).await?;
    }
    responder.finish().await?;
    drop(response_body);

    if intercept {
        let decoded = response_copy
            .and_then(BodyBuffer::freeze)
            .map(|raw| decode_body(&head.headers, raw));
        matched
            .on_response_complete(&HookResponse::from(&head), decoded.as_ref())
            .await;
    }

    Ok(())
}

async fn serve_fake(
    ctx: &RelayContext,
    exchange: &mut Exchange,
    index: usize,
    fake: &FakeResponse,
    responder: &mut dyn Responder,
) -> ProxyResult<()> {
    exchange.metadata.faked = true;
    let response = fake_response(fake);
    exchange.response = Some(response.parts.clone());
    write_fixed(responder, &response, &exchange.request.method).await?;

    if fake.intercept_response {
        let decoded = fake
            .body
            .clone()
            .map(|raw| decode_body(&response.parts.headers, raw));
        ctx.hooks.observe_fake(index, fake, decoded.as_ref()).await;
    }
    Ok(())
}

/// Forwards a control-interface request verbatim over plain HTTP/1.1, without hooks.
async fn relay_to_control(
    ctx: &RelayContext,
    exchange: &mut Exchange,
    body: &mut dyn BodySource,
    responder: &mut dyn Responder,
) -> ProxyResult<()> {
    let stream = ctx.connector.connect_local(ctx.control.addr).await?;
    tracing::debug!(exchange = %exchange.id, addr = %ctx.control.addr, "redirecting to control interface");

    let mut headers = exchange.request.headers.clone();
    http1::strip_hop_by_hop(&mut headers);
    if !headers.contains_key(header::HOST) {
        headers.insert(
            header::HOST,
            HeaderValue::from_str(&ctx.control.hostname)
                .map_err(|_| ProxyError::BadRequest("invalid control hostname".into()))?,
        );
    }
    let method = exchange.request.method.clone();
    let mut call = H1Call::start(
        Box::new(stream),
        &method,
        exchange.request.path_and_query(),
        headers,
        body.hint(),
    )
    .await?;
    exchange.metadata.upstream_protocol = Some("http/1.1");

    while let Some(chunk) = body.next_chunk().await? {
        call.send_data(chunk).await?;
    }
    call.finish_request().await?;

    let UpstreamResponse {
        mut head,
        hint,
        body: mut response_body,
    } = Box::new(call).response(&method).await?;
    http1::strip_hop_by_hop(&mut head.headers);
    exchange.response = Some(head.clone());

    responder.send_head(&head, hint).await?;
    while let Some(chunk) = response_body.next_chunk().await? {
        responder.send_data(chunk).await?;
    }
    responder.finish().await
}

async fn open_upstream(
    ctx: &RelayContext,
    conn: &ConnectionInfo,
    exchange: &mut Exchange,
    target: &Target,
    method: &Method,
    path: &str,
    hint: BodyHint,
) -> ProxyResult<Box<dyn UpstreamCall>> {
    let mut headers = exchange.request.headers.clone();
    http1::strip_hop_by_hop(&mut headers);

    let over_h2 = conn.protocol == ClientProtocol::Http2
        && target.scheme == Scheme::Https
        && !ctx.pool.memo().is_http1_only(&target.pool_key());

    if over_h2 {
        headers.remove(header::HOST);
        let uri = target.url(path)?;
        let stream = ctx
            .pool
            .send_request(target, method, &uri, &headers, hint == BodyHint::Empty)
            .await?;
        exchange.metadata.upstream_protocol = Some("h2");
        return Ok(Box::new(H2Call {
            target: target.clone(),
            pool: ctx.pool.clone(),
            response: stream.response,
            body: stream.body,
            lease: stream.lease,
            ended: hint == BodyHint::Empty,
        }));
    }

    headers.insert(
        header::HOST,
        HeaderValue::from_str(&target.authority())
            .map_err(|_| ProxyError::BadRequest("invalid upstream authority".into()))?,
    );
    if conn.protocol == ClientProtocol::Http2 {
        tracing::debug!(exchange = %exchange.id, authority = %target, "bridging HTTP/2 stream over HTTP/1.1");
    }
    let io = ctx.connector.connect_http1(target).await?;
    exchange.metadata.upstream_protocol = Some("http/1.1");
    Ok(Box::new(H1Call::start(io, method, path, headers, hint).await?))
}

/// Response head and body stream from an upstream.
pub struct UpstreamResponse {
    pub head: ResponseParts,
    pub hint: BodyHint,
    pub body: Box<dyn BodySource>,
}

/// An upstream request in progress.
#[async_trait]
trait UpstreamCall: Send {
    async fn send_data(&mut self, data: Bytes) -> ProxyResult<()>;

    async fn finish_request(&mut self) -> ProxyResult<()>;

    async fn response(self: Box<Self>, method: &Method) -> ProxyResult<UpstreamResponse>;
}

struct H2Call {
    target: Target,
    pool: Arc<H2SessionPool>,
    response: h2::client::ResponseFuture,
    body: SendStream<Bytes>,
    lease: StreamLease,
    ended: bool,
}

#[async_trait]
impl UpstreamCall for H2Call {
    async fn send_data(&mut self, data: Bytes) -> ProxyResult<()> {
        send_h2_data(&mut self.body, data)
            .await
            .map_err(|err| self.stream_error(err))
    }

    async fn finish_request(&mut self) -> ProxyResult<()> {
        if !self.ended {
            self.ended = true;
            self.body
                .send_data(Bytes::new(), true)
                .map_err(|err| self.stream_error(err))?;
        }
        Ok(())
    }

    async fn response(self: Box<Self>, _method: &Method) -> ProxyResult<UpstreamResponse> {
        let call = *self;
        let response = match call.response.await {
            Ok(response) => response,
            Err(err) => {
                return Err(stream_error(&call.pool, &call.target, err));
            }
        };

        let (parts, recv) = response.into_parts();
        let head = ResponseParts {
            status: parts.status,
            reason: None,
            version: Version::HTTP_2,
            headers: parts.headers,
        };
        let body = H2Body::new(recv, &head.headers, Some(call.lease));
        Ok(UpstreamResponse {
            hint: body.hint(),
            head,
            body: Box::new(body),
        })
    }
}

impl H2Call {
    fn stream_error(&self, err: h2::Error) -> ProxyError {
        stream_error(&self.pool, &self.target, err)
    }
}

/// An upstream reset with `HTTP_1_1_REQUIRED` turns into a memoised downgrade.
fn stream_error(pool: &H2SessionPool, target: &Target, err: h2::Error) -> ProxyError {
    if err.reason() == Some(Reason::HTTP_1_1_REQUIRED) {
        pool.mark_http1_only(target);
        return ProxyError::DowngradeRequired {
            authority: target.pool_key(),
        };
    }
    err.into()
}

/// One request/response over a dedicated HTTP/1.1 connection.
struct H1Call {
    io: BufReader<BoxedIo>,
    writer: BodyWriter,
}

impl H1Call {
    async fn start(
        io: BoxedIo,
        method: &Method,
        path: &str,
        mut headers: HeaderMap,
        hint: BodyHint,
    ) -> ProxyResult<Self> {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        let writer = match hint {
            BodyHint::Empty => BodyWriter::Raw,
            BodyHint::Length(len) => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                BodyWriter::Raw
            }
            BodyHint::Unknown => {
                headers.remove(header::CONTENT_LENGTH);
                headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                BodyWriter::Chunked
            }
        };

        let mut io = BufReader::new(io);
        http1::write_request_head(&mut io, method, path, &headers).await?;
        Ok(Self { io, writer })
    }
}

#[async_trait]
impl UpstreamCall for H1Call {
    async fn send_data(&mut self, data: Bytes) -> ProxyResult<()> {
        self.writer.write(&mut self.io, &data).await
    }

    async fn finish_request(&mut self) -> ProxyResult<()> {
        self.writer.finish(&mut self.io).await
    }

    async fn response(self: Box<Self>, method: &Method) -> ProxyResult<UpstreamResponse> {
        let mut io = self.io;
        io.flush().await?;
        let head = http1::read_response_head(&mut io).await?;
        let framing = http1::response_body_framing(method, head.status, &head.headers)?;
        Ok(UpstreamResponse {
            head,
            hint: BodyHint::from_framing(framing),
            body: Box::new(H1UpstreamBody {
                io,
                reader: BodyReader::new(framing),
                hint: BodyHint::from_framing(framing),
            }),
        })
    }
}

struct H1UpstreamBody {
    io: BufReader<BoxedIo>,
    reader: BodyReader,
    hint: BodyHint,
}

#[async_trait]
impl BodySource for H1UpstreamBody {
    async fn next_chunk(&mut self) -> ProxyResult<Option<Bytes>> {
        self.reader.next_chunk(&mut self.io).await
    }

    fn hint(&self) -> BodyHint {
        self.hint
    }
}

/// Collects a body fully; used where a whole body is needed at once.
pub async fn collect_body(body: &mut dyn BodySource) -> ProxyResult<Bytes> {
    let mut out = BytesMut::new();
    while let Some(chunk) = body.next_chunk().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out.freeze())
}
