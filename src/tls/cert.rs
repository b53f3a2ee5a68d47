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

use std::{
    fmt, fs,
    net::IpAddr,
    num::NonZeroUsize,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context};
use lru::LruCache;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    PKCS_RSA_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};

use crate::{
    config::TlsConfig,
    utils::{ProxyError, ProxyResult},
};

/// Common name of the self-signed root.
pub const CA_COMMON_NAME: &str = "MITM Gateway Root CA";
const ORGANIZATION: &str = "MITM Gateway";
const ORGANIZATIONAL_UNIT: &str = "Local Interception";

/// Hostname used when a client omits SNI.
pub const FALLBACK_SNI: &str = "mitm-gateway.local";

/// 16 random bytes: 32 hex digits, under the 20-octet ceiling webpki enforces.
const SERIAL_LEN: usize = 16;

/// Produces fresh key pairs for new certificates.
///
/// The default is RSA-2048 on the aws-lc-rs backend. Tests plug in a counting
/// source to observe how often the store actually mints a key.
pub trait KeySource: Send + Sync + fmt::Debug {
    fn generate(&self) -> ProxyResult<KeyPair>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RsaKeySource;

impl KeySource for RsaKeySource {
    fn generate(&self) -> ProxyResult<KeyPair> {
        Ok(KeyPair::generate_for(&PKCS_RSA_SHA256)?)
    }
}

/// Inputs for [`new_cert_and_key`].
///
/// `key_pair` is generated through the key source when absent. Leaf requests need
/// both a hostname (`common_name`) and an `issuer`.
#[derive(Default)]
pub struct CertRequest<'a> {
    pub is_ca: bool,
    pub common_name: Option<&'a str>,
    pub key_pair: Option<KeyPair>,
    pub issuer: Option<&'a CertificateAuthority>,
}

/// A freshly minted certificate together with its private key.
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
    cert: Certificate,
    key: KeyPair,
}

impl IssuedCert {
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        self.cert.der()
    }

    pub fn key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.serialize_der()))
    }
}

impl fmt::Debug for IssuedCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCert")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Builds one X.509 certificate.
///
/// CA certificates are self-signed and valid from one year ago to 29 years ahead.
/// Leaf certificates carry the hostname as a DNS SAN (plus an IP SAN for literal
/// addresses), are valid from five days ago to 85 days ahead, and are signed by the
/// issuer's key with SHA-256.
pub fn new_cert_and_key(request: CertRequest<'_>, keys: &dyn KeySource) -> ProxyResult<IssuedCert> {
    if !request.is_ca && request.common_name.is_none() {
        return Err(ProxyError::Certificate(
            "leaf certificate requested without a hostname".into(),
        ));
    }
    if !request.is_ca && request.issuer.is_none() {
        return Err(ProxyError::Certificate(
            "leaf certificate requested without a CA key".into(),
        ));
    }

    let key = match request.key_pair {
        Some(key) => key,
        None => keys.generate()?,
    };

    let now = OffsetDateTime::now_utc();
    let mut params = CertificateParams::default();
    params.serial_number = Some(random_serial());

    let cert = if request.is_ca {
        let common_name = request.common_name.unwrap_or(CA_COMMON_NAME);
        params.distinguished_name = dn_for(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = now - Duration::days(365);
        params.not_after = now + Duration::days(365 * 29);
        params.self_signed(&key)?
    } else {
        let hostname = request.common_name.unwrap_or_default();
        let issuer = request
            .issuer
            .ok_or_else(|| ProxyError::Certificate("missing issuer".into()))?;
        params.distinguished_name = dn_for(hostname);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = subject_alt_names(hostname)?;
        params.not_before = now - Duration::days(5);
        params.not_after = now + Duration::days(85);
        params.signed_by(&key, &issuer.cert, &issuer.key)?
    };

    Ok(IssuedCert {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        cert,
        key,
    })
}

fn subject_alt_names(hostname: &str) -> ProxyResult<Vec<SanType>> {
    let dns = Ia5String::try_from(hostname)
        .map_err(|_| ProxyError::Certificate(format!("hostname is not IA5: {hostname}")))?;
    let mut names = vec![SanType::DnsName(dns)];
    if let Ok(ip) = hostname.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        names.push(SanType::IpAddress(ip));
    }
    Ok(names)
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; SERIAL_LEN];
    OsRng.fill_bytes(&mut bytes);
    // Positive and without a leading zero octet.
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::from_slice(&bytes)
}

/// Constructs the fixed organization identity around a common name.
fn dn_for(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::OrganizationalUnitName, ORGANIZATIONAL_UNIT);
    dn.push(DnType::CommonName, common_name);
    dn
}

/// The root certificate and key every leaf chains to.
pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

// rcgen::Certificate doesn't implement Debug.
impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateAuthority {{ cert: <{} PEM bytes> }}", self.cert_pem.len())
    }
}

impl CertificateAuthority {
    /// Generates a brand-new self-signed root.
    pub fn generate(keys: &dyn KeySource) -> ProxyResult<Self> {
        let issued = new_cert_and_key(
            CertRequest {
                is_ca: true,
                ..CertRequest::default()
            },
            keys,
        )?;
        let cert_der = issued.cert.der().clone();
        Ok(Self {
            cert_pem: issued.cert_pem,
            cert_der,
            cert: issued.cert,
            key: issued.key,
        })
    }

    /// Rebuilds the signer from persisted PEM files.
    ///
    /// rcgen needs an issuer `Certificate` to sign with, so the parsed parameters are
    /// re-signed in memory. The served chain always uses the original on-disk bytes.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> ProxyResult<Self> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let cert = params.self_signed(&key)?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| ProxyError::Certificate("CA PEM holds no certificate".into()))?
            .map_err(|err| ProxyError::Certificate(format!("unreadable CA PEM: {err}")))?;

        Ok(Self {
            cert,
            key,
            cert_pem: cert_pem.to_string(),
            cert_der,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// OpenSSL `subject_hash_old` of the root, the Android trust-store file stem.
    pub fn subject_hash(&self) -> ProxyResult<String> {
        subject_hash_old(&self.cert_der)
    }
}

/// First four bytes of MD5 over the DER subject, read little-endian, as 8 hex digits.
pub fn subject_hash_old(cert_der: &[u8]) -> ProxyResult<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|err| ProxyError::Certificate(format!("unparseable certificate: {err}")))?;
    let digest = Md5::digest(cert.subject().as_raw());
    let value = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    Ok(format!("{value:08x}"))
}

/// A cached leaf: the PEM pair handed to callers plus the rustls view used during handshakes.
#[derive(Debug)]
pub struct LeafCertificate {
    pub hostname: String,
    pub cert_pem: String,
    pub key_pem: String,
    certified: Arc<CertifiedKey>,
}

impl LeafCertificate {
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.certified.clone()
    }

    /// DER of the leaf itself (chain position 0).
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.certified.cert[0]
    }
}

/// CertificateStore owns the root CA and a bounded cache of minted leaves.
///
/// The cache holds `capacity` entries and evicts the oldest insertion first. Lookups
/// use `peek`, so a hit never refreshes an entry's position.
#[derive(Debug)]
pub struct CertificateStore {
    authority: CertificateAuthority,
    leaves: Mutex<LruCache<String, Arc<LeafCertificate>>>,
    keys: Arc<dyn KeySource>,
    stats: CacheStats,
}

impl CertificateStore {
    pub fn new(authority: CertificateAuthority, capacity: usize) -> Self {
        Self::with_key_source(authority, capacity, Arc::new(RsaKeySource))
    }

    pub fn with_key_source(
        authority: CertificateAuthority,
        capacity: usize,
        keys: Arc<dyn KeySource>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            authority,
            leaves: Mutex::new(LruCache::new(capacity)),
            keys,
            stats: CacheStats::default(),
        }
    }

    /// Loads the CA from the configured paths, or generates and persists a new one.
    ///
    /// A certificate without its key is refused rather than silently replaced, since a
    /// new root would break every device that already trusts the old one.
    pub fn load_or_create(cfg: &TlsConfig) -> anyhow::Result<Self> {
        let cert_exists = cfg.ca_cert_path.exists();
        let key_exists = cfg.ca_key_path.exists();

        let authority = match (cert_exists, key_exists) {
            (true, true) => {
                let cert_pem = fs::read_to_string(&cfg.ca_cert_path).with_context(|| {
                    format!("failed to read CA certificate {}", cfg.ca_cert_path.display())
                })?;
                let key_pem = fs::read_to_string(&cfg.ca_key_path).with_context(|| {
                    format!("failed to read CA key {}", cfg.ca_key_path.display())
                })?;
                let authority = CertificateAuthority::from_pem(&cert_pem, &key_pem)
                    .context("persisted CA could not be loaded")?;
                tracing::info!(path = %cfg.ca_cert_path.display(), "loaded CA certificate");
                authority
            }
            (true, false) => bail!(
                "CA certificate {} exists but its key {} is missing; remove it or run with --reset-ca",
                cfg.ca_cert_path.display(),
                cfg.ca_key_path.display()
            ),
            _ => {
                let authority = CertificateAuthority::generate(&RsaKeySource)
                    .context("failed to generate CA")?;
                persist_authority(&authority, &cfg.ca_cert_path, &cfg.ca_key_path)?;
                tracing::info!(path = %cfg.ca_cert_path.display(), "generated new CA certificate");
                authority
            }
        };

        Ok(Self::new(authority, cfg.leaf_cache_capacity))
    }

    /// Deletes the persisted CA so the next `load_or_create` mints a fresh root.
    pub fn reset(cfg: &TlsConfig) -> anyhow::Result<()> {
        for path in [&cfg.ca_cert_path, &cfg.ca_key_path] {
            if path.exists() {
                fs::remove_file(path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }
        }
        tracing::warn!(path = %cfg.ca_cert_path.display(), "CA reset; clients must trust the new root");
        Ok(())
    }

    pub fn authority(&self) -> &CertificateAuthority {
        &self.authority
    }

    pub fn ca_cert_pem(&self) -> &str {
        self.authority.cert_pem()
    }

    pub fn ca_subject_hash(&self) -> ProxyResult<String> {
        self.authority.subject_hash()
    }

    /// Returns the cached leaf for `hostname`, minting and caching one on a miss.
    ///
    /// Generation runs outside the lock. Two racing callers may both mint; the first
    /// insert wins and the loser's certificate is dropped.
    pub fn get_cert_and_key(&self, hostname: &str) -> ProxyResult<Arc<LeafCertificate>> {
        let cache_key = normalize_sni(hostname);

        if let Some(hit) = self.leaves.lock().peek(&cache_key).cloned() {
            self.stats.record_hit();
            tracing::trace!(sni = %cache_key, "using cached leaf certificate");
            return Ok(hit);
        }
        self.stats.record_miss();

        let leaf = Arc::new(self.issue_leaf(&cache_key)?);

        let mut leaves = self.leaves.lock();
        if let Some(existing) = leaves.peek(&cache_key) {
            return Ok(existing.clone());
        }
        if let Some((evicted, _)) = leaves.push(cache_key.clone(), leaf.clone()) {
            self.stats.record_eviction();
            tracing::trace!(sni = %evicted, "evicted oldest leaf certificate");
        }
        drop(leaves);

        tracing::debug!(sni = %cache_key, "issued new leaf certificate");
        Ok(leaf)
    }

    /// rustls view of [`CertificateStore::get_cert_and_key`].
    pub fn certified_key(&self, server_name: &str) -> ProxyResult<Arc<CertifiedKey>> {
        Ok(self.get_cert_and_key(server_name)?.certified_key())
    }

    /// Whether a leaf for `hostname` is cached. Leaves the hit/miss counters alone.
    pub fn is_cached(&self, hostname: &str) -> bool {
        self.leaves.lock().contains(&normalize_sni(hostname))
    }

    pub fn cached_leaves(&self) -> usize {
        self.leaves.lock().len()
    }

    /// Grabs cache metrics for telemetry or debugging.
    pub fn cache_metrics(&self) -> CacheMetrics {
        self.stats.snapshot()
    }

    fn issue_leaf(&self, hostname: &str) -> ProxyResult<LeafCertificate> {
        let issued = new_cert_and_key(
            CertRequest {
                is_ca: false,
                common_name: Some(hostname),
                key_pair: None,
                issuer: Some(&self.authority),
            },
            self.keys.as_ref(),
        )?;

        let signing_key = any_supported_type(&issued.key_der())
            .map_err(|err| ProxyError::Certificate(format!("unusable leaf key: {err}")))?;
        // Leaf first, then issuer.
        let chain = vec![issued.cert_der().clone(), self.authority.cert_der().clone()];

        Ok(LeafCertificate {
            hostname: hostname.to_string(),
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
            cert_pem: issued.cert_pem,
            key_pem: issued.key_pem,
        })
    }
}

fn persist_authority(
    authority: &CertificateAuthority,
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<()> {
    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    fs::write(cert_path, authority.cert_pem())
        .with_context(|| format!("failed to write {}", cert_path.display()))?;
    fs::write(key_path, authority.key_pem())
        .with_context(|| format!("failed to write {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict {}", key_path.display()))?;
    }
    Ok(())
}

/// Lowercases and trims an SNI value; empty names fall back to [`FALLBACK_SNI`].
pub fn normalize_sni(server_name: &str) -> String {
    let trimmed = server_name.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        FALLBACK_SNI.to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
