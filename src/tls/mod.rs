//! Role-scoped TLS contexts.
//!
//! Every TLS connection of a role shares one context: the server role presents
//! a single certificate chain, the client role applies a single trust policy.
//! A [`TlsContexts`] hands out `Arc` handles to them and only keeps weak
//! references itself, so a context is built on the first acquisition for its
//! role and released when the last connection holding it is dropped. The next
//! acquisition rebuilds it, re-reading the credentials from disk.
mod session;

use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use log::{debug, info};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, InconsistentKeys, RootCertStore,
    ServerConfig, ServerConnection, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, WebPkiSupportedAlgorithms},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime, pem::PemObject},
    sign::CertifiedKey,
};

use crate::{
    config::{ClientTrust, ServerIdentity, TlsSettings},
    error::TransportError,
};

pub use session::TlsSession;
pub(crate) use session::TlsStream;

/// Process-wide holder of the server and client contexts.
#[derive(Debug)]
pub struct TlsContexts {
    settings: TlsSettings,
    provider: Arc<CryptoProvider>,
    server: Mutex<Weak<ServerContext>>,
    client: Mutex<Weak<ClientContext>>,
}

#[derive(Debug)]
pub struct ServerContext {
    config: Arc<ServerConfig>,
}

#[derive(Debug)]
pub struct ClientContext {
    config: Arc<ClientConfig>,
    server_name: Option<String>,
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TlsContexts {
    pub fn new(settings: TlsSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            server: Mutex::new(Weak::new()),
            client: Mutex::new(Weak::new()),
        })
    }

    pub fn settings(&self) -> &TlsSettings {
        &self.settings
    }

    /// Shared server-role context, loading the identity if no connection holds it.
    pub fn server(&self) -> Result<Arc<ServerContext>, TransportError> {
        let mut slot = lock(&self.server);
        if let Some(ctx) = slot.upgrade() {
            return Ok(ctx);
        }

        let identity = self
            .settings
            .identity
            .as_ref()
            .ok_or(TransportError::MissingIdentity)?;
        let ctx = Arc::new(ServerContext {
            config: Arc::new(server_config(&self.provider, identity)?),
        });
        info!("server tls context created from {:?}", identity.certificate);

        *slot = Arc::downgrade(&ctx);
        Ok(ctx)
    }

    /// Shared client-role context.
    pub fn client(&self) -> Result<Arc<ClientContext>, TransportError> {
        let mut slot = lock(&self.client);
        if let Some(ctx) = slot.upgrade() {
            return Ok(ctx);
        }

        let ctx = Arc::new(ClientContext {
            config: Arc::new(client_config(&self.provider, &self.settings.trust)?),
            server_name: self.settings.server_name.clone(),
        });
        debug!("client tls context created, trust {:?}", self.settings.trust);

        *slot = Arc::downgrade(&ctx);
        Ok(ctx)
    }

    /// Number of live handles to the `(server, client)` contexts.
    pub fn live(&self) -> (usize, usize) {
        (
            lock(&self.server).strong_count(),
            lock(&self.client).strong_count(),
        )
    }
}

impl ServerContext {
    pub(crate) fn accept(&self) -> Result<ServerConnection, TransportError> {
        Ok(ServerConnection::new(Arc::clone(&self.config))?)
    }
}

impl ClientContext {
    /// `host` is what the caller connected to; a configured server name wins.
    pub(crate) fn connect(&self, host: &str) -> Result<ClientConnection, TransportError> {
        let name = self.server_name.as_deref().unwrap_or(host);
        let server_name = ServerName::try_from(name.to_owned())
            .map_err(|_| TransportError::ServerName(name.to_owned()))?;

        Ok(ClientConnection::new(Arc::clone(&self.config), server_name)?)
    }
}

fn server_config(
    provider: &Arc<CryptoProvider>,
    identity: &ServerIdentity,
) -> Result<ServerConfig, TransportError> {
    let certs = load_certificates(&identity.certificate)?;
    let key = load_private_key(&identity.private_key)?;

    let signing_key = provider.key_provider.load_private_key(key.clone_key())?;
    match CertifiedKey::new(certs.clone(), signing_key).keys_match() {
        Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
        Err(e) => {
            return Err(TransportError::Credentials {
                what: "private key",
                path: identity.private_key.clone(),
                reason: format!("does not match {:?}: {e}", identity.certificate),
            });
        }
    }

    Ok(ServerConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?)
}

fn client_config(
    provider: &Arc<CryptoProvider>,
    trust: &ClientTrust,
) -> Result<ClientConfig, TransportError> {
    let builder = ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()?;

    let config = match trust {
        ClientTrust::CaFile(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certificates(path)? {
                roots
                    .add(cert)
                    .map_err(|e| credentials("ca certificate", path, e))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        ClientTrust::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier {
                algorithms: provider.signature_verification_algorithms,
            }))
            .with_no_client_auth(),
    };
    Ok(config)
}

fn credentials(what: &'static str, path: &Path, reason: impl ToString) -> TransportError {
    TransportError::Credentials {
        what,
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| credentials("certificate", path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| credentials("certificate", path, e))?;

    if certs.is_empty() {
        return Err(credentials("certificate", path, "no PEM certificates found"));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| credentials("private key", path, e))
}

/// Accepts any certificate but still checks handshake signatures against it.
#[derive(Debug)]
struct InsecureVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
