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

use std::io::Read;

use bytes::Bytes;
use http::{header, HeaderMap};

/// Body handed to hooks: decoded text when the charset is understood, raw bytes otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookBody {
    Text(String),
    Binary(Bytes),
}

impl HookBody {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            HookBody::Text(text) => text.as_bytes(),
            HookBody::Binary(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            HookBody::Text(text) => Some(text),
            HookBody::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Undoes `Content-Encoding` and decodes the charset named in `Content-Type`.
///
/// A body whose encoding cannot be undone is returned as the original bytes; a body
/// whose charset cannot be decoded is returned as the decompressed bytes.
pub fn decode_body(headers: &HeaderMap, raw: Bytes) -> HookBody {
    let decompressed = match decompress(headers, &raw) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::debug!("body decompression failed, passing raw bytes: {err}");
            return HookBody::Binary(raw);
        }
    };

    match decode_text(headers, &decompressed) {
        Some(text) => HookBody::Text(text),
        None => HookBody::Binary(decompressed),
    }
}

/// Applies every listed content coding in reverse order of application.
pub fn decompress(headers: &HeaderMap, raw: &Bytes) -> Result<Bytes, String> {
    let codings: Vec<String> = headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|coding| coding.trim().to_ascii_lowercase())
        .filter(|coding| !coding.is_empty() && coding != "identity")
        .collect();

    let mut body = raw.clone();
    for coding in codings.iter().rev() {
        body = Bytes::from(match coding.as_str() {
            "gzip" | "x-gzip" => decompress_gzip(&body)?,
            "deflate" => decompress_deflate(&body)?,
            "br" => decompress_brotli(&body)?,
            other => return Err(format!("unsupported content-encoding: {other}")),
        });
    }
    Ok(body)
}

fn decompress_gzip(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut decoder = flate2::read::MultiGzDecoder::new(input);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|error| format!("gzip decode failed: {error}"))?;
    Ok(out)
}

/// `deflate` is zlib-wrapped per RFC 9110, but raw DEFLATE shows up in the wild.
fn decompress_deflate(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::new();
    if flate2::read::ZlibDecoder::new(input)
        .read_to_end(&mut out)
        .is_ok()
    {
        return Ok(out);
    }
    out.clear();
    flate2::read::DeflateDecoder::new(input)
        .read_to_end(&mut out)
        .map_err(|error| format!("deflate decode failed: {error}"))?;
    Ok(out)
}

fn decompress_brotli(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut decoder = brotli::Decompressor::new(input, 4096);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|error| format!("brotli decode failed: {error}"))?;
    Ok(out)
}

/// `charset=` parameter of `Content-Type`, lowercased and unquoted.
pub fn sniff_charset(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
    })
}

fn is_binary_media(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let media = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ["image/", "audio/", "video/", "font/"]
        .iter()
        .any(|prefix| media.starts_with(prefix))
        || matches!(
            media.as_str(),
            "application/octet-stream" | "application/zip" | "application/x-protobuf"
        )
}

fn decode_text(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    let charset = sniff_charset(headers);
    if charset.is_none() && is_binary_media(headers) {
        return None;
    }

    match charset.as_deref() {
        None | Some("utf-8") | Some("utf8") => {
            let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
            String::from_utf8(body.to_vec()).ok()
        }
        Some("us-ascii") | Some("ascii") => body
            .is_ascii()
            .then(|| String::from_utf8_lossy(body).into_owned()),
        // ISO-8859-1 maps every byte to the code point of the same value.
        Some("iso-8859-1") | Some("latin1") | Some("latin-1") => {
            Some(body.iter().map(|&b| char::from(b)).collect())
        }
        Some(other) => {
            tracing::trace!(charset = other, "unsupported charset, passing bytes");
            None
        }
    }
}
