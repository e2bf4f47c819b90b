//! Self-signed certificate generation.
//!
//! Used as the development/test certificate source and as the acceptor's
//! fallback certificate when a client sends no SNI. Production
//! deployments front this with a real (ACME-managed) source.

use boring::asn1::Asn1Time;
use boring::bn::BigNum;
use boring::hash::MessageDigest;
use boring::pkey::{PKey, Private};
use boring::rsa::Rsa;
use boring::ssl::SslAcceptor;
use boring::x509::extension::SubjectAlternativeName;
use boring::x509::{X509, X509NameBuilder};
use tracing::debug;

use crate::error::Result;

use super::CertificateSource;

/// Generates a fresh RSA key and a certificate naming `domains` as
/// subject alternative names, valid for one year.
pub fn generate(domains: &[String]) -> Result<(X509, PKey<Private>)> {
    let rsa = Rsa::generate(2048)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", domains.first().map_or("manifold", |d| d.as_str()))?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(1)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(365)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(&key)?;

    if !domains.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for domain in domains {
            san.dns(domain);
        }
        let extension = san.build(&builder.x509v3_context(None, None))?;
        builder.append_extension(extension)?;
    }

    builder.sign(&key, MessageDigest::sha256())?;
    Ok((builder.build(), key))
}

/// A certificate source serving one self-signed certificate that covers
/// every managed domain.
pub struct SelfSignedCertificateSource {
    acceptor: SslAcceptor,
}

impl SelfSignedCertificateSource {
    /// Generates the certificate for `domains` and builds the acceptor.
    pub fn new(domains: &[String]) -> Result<Self> {
        let (cert, key) = generate(domains)?;
        let contexts = std::sync::Arc::new(dashmap::DashMap::new());
        let acceptor = super::build_acceptor(&cert, &key, contexts)?;

        Ok(Self { acceptor })
    }
}

impl CertificateSource for SelfSignedCertificateSource {
    fn manage(&self, domains: &[String]) -> Result<()> {
        // The certificate from construction already names every domain.
        debug!(count = domains.len(), "Self-signed source managing domains");
        Ok(())
    }

    fn acceptor(&self) -> &SslAcceptor {
        &self.acceptor
    }
}
