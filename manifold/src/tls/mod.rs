//! TLS termination support.
//!
//! A [`CertificateSource`] is a provider of server certificates keyed by
//! SNI: it hands the dispatcher a built BoringSSL acceptor and is told at
//! startup which domains it is responsible for. Certificate acquisition
//! and renewal (ACME) live behind this trait in an external component;
//! Manifold ships a directory-backed source for pre-provisioned PEM files
//! and a self-signed source for development and tests.

pub mod detect;
pub mod self_signed;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use boring::pkey::{PKey, Private};
use boring::ssl::{
    select_next_proto, AlpnError, SniError, SslAcceptor, SslContext, SslContextBuilder,
    SslFiletype, SslMethod, SslRef, SslVerifyMode, NameType,
};
use boring::x509::X509;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::constants::TLS_ALPN_PROTOCOLS;
use crate::error::{CertificateError, Result};

/// A provider of TLS server configuration, keyed by SNI.
pub trait CertificateSource: Send + Sync {
    /// Registers the domains this source must be able to terminate.
    /// Called once at startup with every configured domain; an ACME-backed
    /// implementation starts managing certificates here.
    fn manage(&self, domains: &[String]) -> Result<()>;

    /// The acceptor used for terminated connections. Must offer `h2` and
    /// `http/1.1` via ALPN and resolve certificates by SNI.
    fn acceptor(&self) -> &SslAcceptor;
}

/// ALPN protocol list in wire format (length-prefixed), as BoringSSL
/// expects it.
pub(crate) fn alpn_wire_format() -> Vec<u8> {
    TLS_ALPN_PROTOCOLS
        .iter()
        .flat_map(|p| {
            let mut v = vec![p.len() as u8];
            v.extend_from_slice(p);
            v
        })
        .collect()
}

fn set_alpn_select(builder: &mut SslContextBuilder) {
    let server: &'static [u8] = Box::leak(alpn_wire_format().into_boxed_slice());
    builder.set_alpn_select_callback(move |_ssl, client| {
        select_next_proto(server, client).ok_or(AlpnError::NOACK)
    });
}

/// Builds a per-domain context from certificate and key files.
fn context_from_files(cert: &Path, key: &Path) -> Result<SslContext> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
    builder
        .set_certificate_chain_file(cert)
        .map_err(|_| CertificateError::LoadFailed {
            path: cert.to_path_buf(),
        })?;
    builder
        .set_private_key_file(key, SslFiletype::PEM)
        .map_err(|_| CertificateError::PrivateKeyLoadFailed {
            path: key.to_path_buf(),
        })?;
    set_alpn_select(&mut builder);
    Ok(builder.build())
}

/// Builds the acceptor: Mozilla intermediate profile, no client
/// certificates, ALPN h2 + http/1.1, and an SNI callback that swaps in
/// the per-domain context from `contexts` (exact name first, then the
/// single-label wildcard).
fn build_acceptor(
    default_cert: &X509,
    default_key: &PKey<Private>,
    contexts: Arc<DashMap<String, SslContext>>,
) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;

    builder.set_certificate(default_cert)?;
    builder.set_private_key(default_key)?;
    builder.set_verify(SslVerifyMode::NONE);
    set_alpn_select(&mut builder);

    builder.set_servername_callback(move |ssl: &mut SslRef, _alert| {
        let Some(name) = ssl.servername(NameType::HOST_NAME) else {
            return Ok(());
        };

        let context = contexts
            .get(name)
            .or_else(|| contexts.get(&wildcard_of(name)?));
        if let Some(context) = context {
            if ssl.set_ssl_context(&context).is_err() {
                return Err(SniError::ALERT_FATAL);
            }
        }
        // Without a matching context the handshake continues with the
        // default certificate.
        Ok(())
    });

    Ok(builder.build())
}

/// `api.app.com` -> `*.app.com`; None when there is no parent domain.
fn wildcard_of(name: &str) -> Option<String> {
    let (_, parent) = name.split_once('.')?;
    Some(format!("*.{parent}"))
}

/// A certificate source backed by a directory of pre-provisioned PEM
/// files, `<domain>.crt` and `<domain>.key` per managed domain. This is
/// the deployment shape where an external ACME manager writes renewed
/// certificates into the directory.
pub struct DirCertificateSource {
    dir: PathBuf,
    contexts: Arc<DashMap<String, SslContext>>,
    acceptor: SslAcceptor,
}

impl DirCertificateSource {
    /// Creates the source. The acceptor's fallback certificate (used when
    /// a client sends no SNI or an unmanaged name) is freshly self-signed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let contexts = Arc::new(DashMap::new());
        let (cert, key) = self_signed::generate(&["manifold.invalid".to_string()])?;
        let acceptor = build_acceptor(&cert, &key, contexts.clone())?;

        Ok(Self {
            dir: dir.into(),
            contexts,
            acceptor,
        })
    }
}

impl CertificateSource for DirCertificateSource {
    fn manage(&self, domains: &[String]) -> Result<()> {
        for domain in domains {
            let cert = self.dir.join(format!("{domain}.crt"));
            let key = self.dir.join(format!("{domain}.key"));

            if !cert.exists() || !key.exists() {
                warn!(%domain, "No certificate material on disk, domain is unterminatable until provisioned");
                continue;
            }

            let context = context_from_files(&cert, &key)?;
            self.contexts.insert(domain.clone(), context);
            debug!(%domain, "Certificate loaded");
        }
        Ok(())
    }

    fn acceptor(&self) -> &SslAcceptor {
        &self.acceptor
    }
}
