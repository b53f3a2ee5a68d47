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

//! HTTP/1.x wire handling: head parsing/serialization and streaming body framing.
//!
//! Bodies are never buffered here; [`BodyReader`] yields chunks as they arrive and
//! [`BodyWriter`] frames outgoing chunks for whichever framing the head announced.

use bytes::Bytes;
use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, Method, StatusCode, Uri, Version,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    proxy::flow::{RequestParts, ResponseParts},
    utils::{ProxyError, ProxyResult},
};

/// Upper bound for a request or response head, request line included.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 256;
const READ_CHUNK: usize = 64 * 1024;

/// Connection-scoped headers that never cross the gateway.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// Reads one line (CRLF or bare LF) without the terminator, bounded by `budget`.
async fn read_line<R>(reader: &mut R, budget: &mut usize) -> ProxyResult<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = (*budget as u64).saturating_add(1);
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if read > *budget {
        return Err(ProxyError::Protocol("message head too large".into()));
    }
    *budget -= read;
    if line.last() != Some(&b'\n') {
        return Err(ProxyError::Protocol("connection closed mid-line".into()));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> ProxyResult<HeaderMap>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();
    loop {
        let line = read_line(reader, budget)
            .await?
            .ok_or_else(|| ProxyError::Protocol("unexpected EOF in header section".into()))?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(ProxyError::Protocol("too many header fields".into()));
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or_else(|| ProxyError::Protocol("header line without colon".into()))?;
        let name = HeaderName::from_bytes(line[..colon].trim_ascii())
            .map_err(|_| ProxyError::Protocol("invalid header name".into()))?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii())
            .map_err(|_| ProxyError::Protocol(format!("invalid value for header {name}")))?;
        headers.append(name, value);
    }
}

fn parse_version(token: &[u8]) -> ProxyResult<Version> {
    match token {
        b"HTTP/1.1" => Ok(Version::HTTP_11),
        b"HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(ProxyError::Protocol(format!(
            "unsupported HTTP version {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Reads a request head. `Ok(None)` means the peer closed cleanly between requests.
pub async fn read_request_head<R>(reader: &mut R) -> ProxyResult<Option<RequestParts>>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;
    let line = loop {
        match read_line(reader, &mut budget).await? {
            None => return Ok(None),
            // Tolerate stray CRLFs between pipelined requests.
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };

    let mut parts = line.split(|b| *b == b' ').filter(|part| !part.is_empty());
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::BadRequest("malformed request line".into()));
    };

    let method = Method::from_bytes(method)
        .map_err(|_| ProxyError::BadRequest("invalid request method".into()))?;
    let uri = Uri::try_from(target)
        .map_err(|_| ProxyError::BadRequest("invalid request target".into()))?;
    let version = parse_version(version)?;
    let headers = read_headers(reader, &mut budget).await?;

    Ok(Some(RequestParts {
        method,
        uri,
        version,
        headers,
    }))
}

/// Reads a final response head, skipping interim 1xx responses other than 101.
pub async fn read_response_head<R>(reader: &mut R) -> ProxyResult<ResponseParts>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut budget = MAX_HEAD_BYTES;
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| ProxyError::Protocol("upstream closed before sending a response".into()))?;

        let mut parts = line.splitn(3, |b| *b == b' ');
        let version = parse_version(parts.next().unwrap_or_default())?;
        let status = parts
            .next()
            .and_then(|code| StatusCode::from_bytes(code).ok())
            .ok_or_else(|| ProxyError::Protocol("invalid status line".into()))?;
        let reason = parts
            .next()
            .map(|reason| String::from_utf8_lossy(reason).trim().to_string())
            .filter(|reason| !reason.is_empty());
        let headers = read_headers(reader, &mut budget).await?;

        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            tracing::trace!(status = status.as_u16(), "skipping interim response");
            continue;
        }

        return Ok(ResponseParts {
            status,
            reason,
            version,
            headers,
        });
    }
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Serializes a request head in origin form.
pub async fn write_request_head<W>(
    writer: &mut W,
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(format!("{method} {path_and_query} HTTP/1.1\r\n").as_bytes());
    write_headers(&mut out, headers);
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_response_head<W>(writer: &mut W, response: &ResponseParts) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            version_str(response.version),
            response.status.as_str(),
            response.status_message()
        )
        .as_bytes(),
    );
    write_headers(&mut out, &response.headers);
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// How a message body is delimited on an HTTP/1.x connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    /// Response body runs until the upstream closes the connection.
    UntilClose,
}

pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> ProxyResult<Option<u64>> {
    let mut found = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .ok_or_else(|| ProxyError::Protocol("invalid content-length".into()))?;
        if found.is_some_and(|prior| prior != parsed) {
            return Err(ProxyError::Protocol("conflicting content-length values".into()));
        }
        found = Some(parsed);
    }
    Ok(found)
}

/// Requests carry a body only when chunked or with a non-zero Content-Length.
pub fn request_body_framing(headers: &HeaderMap) -> ProxyResult<BodyFraming> {
    if is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) | None => BodyFraming::None,
        Some(len) => BodyFraming::Length(len),
    })
}

/// 1xx, 204 and 304 responses never carry a body or `Content-Length`.
pub fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

pub fn response_body_framing(
    request_method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> ProxyResult<BodyFraming> {
    if request_method == Method::HEAD || !status_allows_body(status) {
        return Ok(BodyFraming::None);
    }
    if is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
    }
    Ok(match content_length(headers)? {
        Some(0) => BodyFraming::None,
        Some(len) => BodyFraming::Length(len),
        None => BodyFraming::UntilClose,
    })
}

/// True when the peer asked for the connection to end after this message.
pub fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let tokens = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .collect::<Vec<_>>();
    if tokens.iter().any(|token| token == "close") {
        return true;
    }
    version == Version::HTTP_10 && !tokens.iter().any(|token| token == "keep-alive")
}

/// Drops hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

#[derive(Debug)]
enum ReadState {
    Remaining(u64),
    ChunkHeader,
    ChunkData(u64),
    UntilClose,
    Done,
}

/// Incremental body decoder for one HTTP/1.x message.
#[derive(Debug)]
pub struct BodyReader {
    state: ReadState,
}

impl BodyReader {
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::None | BodyFraming::Length(0) => ReadState::Done,
            BodyFraming::Length(len) => ReadState::Remaining(len),
            BodyFraming::Chunked => ReadState::ChunkHeader,
            BodyFraming::UntilClose => ReadState::UntilClose,
        };
        Self { state }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ReadState::Done)
    }

    /// Next slice of body bytes, `None` once the message is complete.
    pub async fn next_chunk<R>(&mut self, reader: &mut R) -> ProxyResult<Option<Bytes>>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match self.state {
                ReadState::Done => return Ok(None),
                ReadState::Remaining(left) => {
                    let chunk = read_some(reader, left).await?;
                    if chunk.is_empty() {
                        return Err(ProxyError::Protocol(format!(
                            "body truncated with {left} bytes outstanding"
                        )));
                    }
                    let left = left - chunk.len() as u64;
                    self.state = if left == 0 {
                        ReadState::Done
                    } else {
                        ReadState::Remaining(left)
                    };
                    return Ok(Some(chunk));
                }
                ReadState::ChunkHeader => {
                    let mut budget = MAX_HEAD_BYTES;
                    let line = read_line(reader, &mut budget)
                        .await?
                        .ok_or_else(|| ProxyError::Protocol("EOF before chunk size".into()))?;
                    let token = line.split(|b| *b == b';').next().unwrap_or_default();
                    let size = std::str::from_utf8(token.trim_ascii())
                        .ok()
                        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                        .ok_or_else(|| ProxyError::Protocol("invalid chunk size".into()))?;
                    if size == 0 {
                        read_headers(reader, &mut budget).await?;
                        self.state = ReadState::Done;
                    } else {
                        self.state = ReadState::ChunkData(size);
                    }
                }
                ReadState::ChunkData(left) => {
                    let chunk = read_some(reader, left).await?;
                    if chunk.is_empty() {
                        return Err(ProxyError::Protocol("EOF inside chunk".into()));
                    }
                    let left = left - chunk.len() as u64;
                    if left == 0 {
                        let mut crlf = [0u8; 2];
                        reader.read_exact(&mut crlf).await?;
                        if &crlf != b"\r\n" {
                            return Err(ProxyError::Protocol("chunk missing CRLF terminator".into()));
                        }
                        self.state = ReadState::ChunkHeader;
                    } else {
                        self.state = ReadState::ChunkData(left);
                    }
                    return Ok(Some(chunk));
                }
                ReadState::UntilClose => {
                    let chunk = read_some(reader, u64::MAX).await?;
                    if chunk.is_empty() {
                        self.state = ReadState::Done;
                        return Ok(None);
                    }
                    return Ok(Some(chunk));
                }
            }
        }
    }
}

/// Copies whatever the reader has buffered, up to `max`. Empty means EOF.
async fn read_some<R>(reader: &mut R, max: u64) -> ProxyResult<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let available = reader.fill_buf().await?;
    let take = available.len().min(READ_CHUNK).min(max.min(usize::MAX as u64) as usize);
    let chunk = Bytes::copy_from_slice(&available[..take]);
    reader.consume(take);
    Ok(chunk)
}

/// Frames outgoing body chunks to match the head that was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyWriter {
    /// Content-Length or until-close: bytes go out as-is.
    Raw,
    Chunked,
}

impl BodyWriter {
    pub async fn write<W>(&self, writer: &mut W, data: &[u8]) -> ProxyResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        if data.is_empty() {
            return Ok(());
        }
        match self {
            BodyWriter::Raw => writer.write_all(data).await?,
            BodyWriter::Chunked => {
                writer
                    .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                    .await?;
                writer.write_all(data).await?;
                writer.write_all(b"\r\n").await?;
            }
        }
        Ok(())
    }

    pub async fn finish<W>(&self, writer: &mut W) -> ProxyResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        if *self == BodyWriter::Chunked {
            writer.write_all(b"0\r\n\r\n").await?;
        }
        writer.flush().await?;
        Ok(())
    }
}
