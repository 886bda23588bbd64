//! Certificate Trust Negotiation
//!
//! Decides whether a certificate chain offered by the mail store may be used,
//! renders a human-readable summary for the accept/reject prompt, and records
//! accepted certificates in the trust store.
//!
//! Trust rules:
//! - a leaf whose SHA-1 fingerprint equals the certificate accepted for the same
//!   (host, port) is trusted
//! - a chain verified against the platform roots is trusted when one of the leaf's
//!   DNS names covers the host (exact, or `*.example.com` for any `*.example.com` host)
//! - everything else is untrusted and needs a human decision

use crate::db::{DbError, TrustStore};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

// ============================================================================
// Certificate Records
// ============================================================================

/// One subject alternative name entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AltName {
    Dns(String),
    Email(String),
    Uri(String),
    IpAddress(String),
    /// Entry kinds that cannot be displayed (other name, X.400, directory, EDI party)
    Unsupported(String),
}

/// Subject alternative names as far as they could be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "names", rename_all = "snake_case")]
pub enum AltNames {
    #[default]
    Absent,
    Parsed(Vec<AltName>),
    Unreadable(String),
}

/// A single certificate as offered by the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub alt_names: AltNames,
    /// DER encoding
    pub der: Vec<u8>,
}

impl CertificateRecord {
    /// Read subject, issuer and alternative names from a DER certificate.
    /// Parts that cannot be decoded are left unavailable.
    pub fn from_der(der: Vec<u8>) -> Self {
        let (subject, issuer, alt_names) = match X509Certificate::from_der(&der) {
            Ok((_, cert)) => (
                Some(cert.subject().to_string()),
                Some(cert.issuer().to_string()),
                read_alt_names(&cert),
            ),
            Err(e) => {
                log::warn!("Cannot parse peer certificate: {}", e);
                (None, None, AltNames::Unreadable(e.to_string()))
            }
        };

        Self {
            subject,
            issuer,
            alt_names,
            der,
        }
    }

    pub fn sha1_fingerprint(&self) -> String {
        hex::encode(Sha1::digest(&self.der))
    }

    pub fn sha256_fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.der))
    }

    /// DNS alternative names; empty when absent or unreadable
    pub fn dns_names(&self) -> Vec<&str> {
        match &self.alt_names {
            AltNames::Parsed(names) => names
                .iter()
                .filter_map(|n| match n {
                    AltName::Dns(name) => Some(name.as_str()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether any DNS alternative name covers `host`
    pub fn covers_host(&self, host: &str) -> bool {
        self.dns_names().into_iter().any(|name| host_matches(name, host))
    }
}

fn read_alt_names(cert: &X509Certificate<'_>) -> AltNames {
    match cert.subject_alternative_name() {
        Ok(Some(extension)) => AltNames::Parsed(extension.value.general_names.iter().map(alt_name).collect()),
        Ok(None) => AltNames::Absent,
        Err(e) => AltNames::Unreadable(e.to_string()),
    }
}

fn alt_name(name: &GeneralName<'_>) -> AltName {
    let kind = match name {
        GeneralName::DNSName(value) => return AltName::Dns(value.to_string()),
        GeneralName::RFC822Name(value) => return AltName::Email(value.to_string()),
        GeneralName::URI(value) => return AltName::Uri(value.to_string()),
        GeneralName::IPAddress(bytes) => match ip_address(bytes) {
            Some(ip) => return AltName::IpAddress(ip.to_string()),
            None => "malformed iPAddress",
        },
        GeneralName::OtherName(..) => "otherName",
        GeneralName::X400Address(..) => "x400Address",
        GeneralName::DirectoryName(..) => "directoryName",
        GeneralName::EDIPartyName(..) => "ediPartyName",
        GeneralName::RegisteredID(..) => "registeredID",
        #[allow(unreachable_patterns)]
        _ => "unknown",
    };
    AltName::Unsupported(kind.to_string())
}

fn ip_address(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    <[u8; 16]>::try_from(bytes).ok().map(|octets| IpAddr::V6(Ipv6Addr::from(octets)))
}

/// Certificates offered during one connection attempt, leaf first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateChain {
    pub host: String,
    pub port: u16,
    pub certificates: Vec<CertificateRecord>,
    /// Whether the chain passed verification against the platform roots
    #[serde(default)]
    pub system_verified: bool,
}

impl CertificateChain {
    pub fn new(host: impl Into<String>, port: u16, certificates: Vec<CertificateRecord>) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port,
            certificates,
            system_verified: false,
        }
    }

    pub fn leaf(&self) -> Option<&CertificateRecord> {
        self.certificates.first()
    }
}

/// Result of evaluating a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustOutcome {
    Trusted,
    Untrusted(CertificateChain),
}

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("No certificate at index {0} in the offered chain")]
    NoSuchCertificate(usize),

    #[error("Trust store error: {0}")]
    Store(#[from] DbError),
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Case-insensitive host match; `*.example.com` covers any host ending in `.example.com`
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    let host = host.trim().to_lowercase();
    if pattern.is_empty() || host.is_empty() {
        return false;
    }

    match pattern.strip_prefix('*') {
        Some(suffix) if suffix.starts_with('.') && suffix.len() > 1 => {
            host.len() > suffix.len() && host.ends_with(suffix)
        }
        _ => pattern == host,
    }
}

/// Evaluate `chain` against the certificate already accepted for its host/port.
pub fn evaluate_chain(chain: CertificateChain, known: Option<&CertificateRecord>) -> TrustOutcome {
    let Some(leaf) = chain.leaf() else {
        return TrustOutcome::Untrusted(chain);
    };

    if let Some(known) = known {
        if known.sha1_fingerprint() == leaf.sha1_fingerprint() {
            return TrustOutcome::Trusted;
        }
    }

    if chain.system_verified && leaf.covers_host(&chain.host) {
        return TrustOutcome::Trusted;
    }

    TrustOutcome::Untrusted(chain)
}

/// Human-readable description of `chain` for the accept/reject prompt.
///
/// Alternative names are only listed when they cover one of `expected_hosts`,
/// since a subject that does not name the server can otherwise look suspicious
/// even though an alternative name matches. Missing or unreadable fields are
/// reported as such.
pub fn summarize(chain: &CertificateChain, expected_hosts: &[String]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Server: {}:{}", chain.host, chain.port);

    for (index, cert) in chain.certificates.iter().enumerate() {
        let _ = writeln!(out, "Certificate {}:", index);
        let _ = writeln!(out, "  Subject: {}", cert.subject.as_deref().unwrap_or("(unavailable)"));

        match &cert.alt_names {
            AltNames::Absent => {}
            AltNames::Unreadable(reason) => {
                log::warn!("Cannot read alternative names of certificate {}: {}", index, reason);
            }
            AltNames::Parsed(names) => {
                let _ = writeln!(out, "  Alternative names: {}", names.len());
                for name in names {
                    let value = match name {
                        AltName::Dns(v) | AltName::Email(v) | AltName::Uri(v) | AltName::IpAddress(v) => v,
                        AltName::Unsupported(kind) => {
                            log::warn!("Skipping unsupported alternative name of type {}", kind);
                            continue;
                        }
                    };
                    if expected_hosts.iter().any(|host| host_matches(value, host)) {
                        let _ = writeln!(out, "  Alternative name: {}", value);
                    }
                }
            }
        }

        let _ = writeln!(out, "  Issuer: {}", cert.issuer.as_deref().unwrap_or("(unavailable)"));
        let _ = writeln!(out, "  Fingerprint (SHA-1): {}", cert.sha1_fingerprint());
        let _ = writeln!(out, "  Fingerprint (SHA-256): {}", cert.sha256_fingerprint());
    }

    out
}

// ============================================================================
// Negotiator
// ============================================================================

/// Evaluates offered chains and records trust decisions
#[derive(Clone)]
pub struct CertificateTrustNegotiator {
    store: Arc<dyn TrustStore>,
}

impl CertificateTrustNegotiator {
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        Self { store }
    }

    /// Certificate previously accepted for `host:port`
    pub fn pinned(&self, host: &str, port: u16) -> Result<Option<CertificateRecord>, TrustError> {
        Ok(self.store.trusted_certificate(host, port)?)
    }

    pub fn evaluate(&self, chain: CertificateChain) -> Result<TrustOutcome, TrustError> {
        let known = self.store.trusted_certificate(&chain.host, chain.port)?;
        Ok(evaluate_chain(chain, known.as_ref()))
    }

    /// Persist the certificate at `index` as trusted for the chain's host/port.
    pub fn accept(&self, chain: &CertificateChain, index: usize) -> Result<(), TrustError> {
        let cert = chain
            .certificates
            .get(index)
            .ok_or(TrustError::NoSuchCertificate(index))?;

        self.store.add_trusted_certificate(&chain.host, chain.port, cert)?;
        log::info!(
            "Accepted certificate {} for {}:{} (SHA-1 {})",
            index,
            chain.host,
            chain.port,
            cert.sha1_fingerprint()
        );
        Ok(())
    }

    /// Nothing is persisted for a rejected chain.
    pub fn reject(&self, chain: &CertificateChain) {
        log::info!("Rejected certificate chain for {}:{}", chain.host, chain.port);
    }
}
