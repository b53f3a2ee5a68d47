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

use std::sync::Arc;

use rustls::{
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};

use super::cert::{CertificateStore, FALLBACK_SNI};

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Server config for the primary listener: h2 preferred, http/1.1 accepted.
pub fn build_server_config(certs: Arc<CertificateStore>) -> ServerConfig {
    server_config(certs, vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()])
}

/// Server config that only ever negotiates http/1.1.
pub fn build_http1_server_config(certs: Arc<CertificateStore>) -> ServerConfig {
    server_config(certs, vec![ALPN_HTTP11.to_vec()])
}

fn server_config(certs: Arc<CertificateStore>, alpn: Vec<Vec<u8>>) -> ServerConfig {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(OnDemandCertResolver::new(certs)));
    config.alpn_protocols = alpn;
    config
}

/// Resolves TLS certificates during the handshake from the client's SNI.
///
/// rustls calls this synchronously. The listeners mint missing leaves on the
/// blocking pool before the handshake, so this is normally a cache lookup.
/// Clients that omit SNI get the certificate for [`FALLBACK_SNI`].
#[derive(Debug)]
pub struct OnDemandCertResolver {
    certs: Arc<CertificateStore>,
}

impl OnDemandCertResolver {
    pub fn new(certs: Arc<CertificateStore>) -> Self {
        Self { certs }
    }
}

impl ResolvesServerCert for OnDemandCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let requested = client_hello.server_name().unwrap_or(FALLBACK_SNI);

        match self.certs.certified_key(requested) {
            Ok(cert) => Some(cert),
            Err(err) => {
                // rustls aborts the handshake; nothing can be sent to the client yet.
                tracing::error!(hostname = %requested, "failed to mint certificate: {err}");
                None
            }
        }
    }
}
