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

//! One-shot requests relayed through the gateway's own primary listener, so callers
//! get hook processing and protocol fallback without managing sockets.

use std::{io::BufReader as StdBufReader, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{
    proxy::{
        body::{decode_body, HookBody},
        exchange::{collect_body, send_h2_data, BodySource, H2Body},
        flow::Target,
        http1::strip_hop_by_hop,
    },
    tls::resolver::ALPN_H2,
    utils::{ProxyError, ProxyResult},
};

/// Response of a one-shot request, body fully collected.
#[derive(Debug)]
pub struct OneShotResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: HookBody,
}

/// Issues single requests over private loopback TLS + HTTP/2 connections into the
/// gateway, trusting only the gateway's CA.
#[derive(Clone)]
pub struct Http2RequestClient {
    server: SocketAddr,
    tls: Arc<ClientConfig>,
}

impl Http2RequestClient {
    pub fn new(server: SocketAddr, ca_cert_pem: &str) -> ProxyResult<Self> {
        let mut roots = RootCertStore::empty();
        let mut reader = StdBufReader::new(ca_cert_pem.as_bytes());
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|err| ProxyError::Certificate(format!("invalid CA PEM: {err}")))?;
            roots
                .add(cert)
                .map_err(|err| ProxyError::Certificate(format!("unusable CA certificate: {err}")))?;
        }
        if roots.is_empty() {
            return Err(ProxyError::Certificate("CA PEM holds no certificate".into()));
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(Self {
            server,
            tls: Arc::new(config),
        })
    }

    /// Sends one request to the absolute `url` and collects the whole response.
    ///
    /// With `convert_body_to_string` the body is decompressed and charset-decoded
    /// as hooks see it; otherwise it is returned raw. A 505 from an authority that
    /// turned out to be HTTP/1.1-only is retried once.
    pub async fn send_http2_request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
        convert_body_to_string: bool,
    ) -> ProxyResult<OneShotResponse> {
        let uri: Uri = url
            .parse()
            .map_err(|err| ProxyError::BadRequest(format!("invalid URL {url}: {err}")))?;
        if uri.scheme().is_none() || uri.host().is_none() {
            return Err(ProxyError::BadRequest(format!("URL must be absolute: {url}")));
        }
        let target = Target::parse(url)?;

        let mut response = self
            .attempt(&target, &method, &uri, &headers, body.clone())
            .await?;
        if response.0 == StatusCode::HTTP_VERSION_NOT_SUPPORTED {
            tracing::debug!(authority = %target.authority(), "one-shot request downgraded, retrying");
            response = self.attempt(&target, &method, &uri, &headers, body).await?;
        }

        let (status, headers, raw) = response;
        let body = if convert_body_to_string {
            decode_body(&headers, raw)
        } else {
            HookBody::Binary(raw)
        };
        Ok(OneShotResponse { status, headers, body })
    }

    async fn attempt(
        &self,
        target: &Target,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> ProxyResult<(StatusCode, HeaderMap, Bytes)> {
        let tcp = TcpStream::connect(self.server).await.map_err(|err| ProxyError::Connect {
            target: self.server.to_string(),
            reason: err.to_string(),
        })?;
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|err| ProxyError::TlsHandshake(format!("invalid server name {}: {err}", target.host)))?;
        let tls = TlsConnector::from(self.tls.clone())
            .connect(server_name, tcp)
            .await
            .map_err(|err| ProxyError::TlsHandshake(format!("loopback handshake: {err}")))?;
        if tls.get_ref().1.alpn_protocol() != Some(ALPN_H2) {
            return Err(ProxyError::Protocol("gateway did not negotiate h2".into()));
        }

        let (mut sender, connection) = h2::client::handshake(tls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::trace!("one-shot session closed: {err}");
            }
        });

        let mut request = Request::builder()
            .method(method.clone())
            .uri(uri.clone())
            .body(())?;
        let mut request_headers = headers.clone();
        request_headers.remove(http::header::HOST);
        strip_hop_by_hop(&mut request_headers);
        *request.headers_mut() = request_headers;

        let mut sender = sender.ready().await?;
        let end_of_stream = body.as_ref().map_or(true, Bytes::is_empty);
        let (response, mut stream) = sender.send_request(request, end_of_stream)?;
        if let Some(body) = body.filter(|body| !body.is_empty()) {
            send_h2_data(&mut stream, body).await?;
            stream.send_data(Bytes::new(), true)?;
        }

        let (parts, recv) = response.await?.into_parts();
        let mut body = H2Body::new(recv, &parts.headers, None);
        let raw = collect_body(&mut body as &mut dyn BodySource).await?;
        Ok((parts.status, parts.headers, raw))
    }
}
