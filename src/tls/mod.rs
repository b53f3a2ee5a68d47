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

/// Certificate authority, leaf issuance, and server-side TLS configuration.
pub mod cert;
pub mod resolver;

pub use cert::{
    new_cert_and_key, subject_hash_old, CacheMetrics, CertRequest, CertificateAuthority,
    CertificateStore, IssuedCert, KeySource, LeafCertificate, RsaKeySource,
};
pub use resolver::{build_http1_server_config, build_server_config, ALPN_H2, ALPN_HTTP11};
