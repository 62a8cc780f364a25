use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use armorpc_common::{Result, RpcError};

/// TLS trust configuration for an https endpoint.
///
/// The default posture is strict: the server chain must validate against an
/// explicitly supplied CA bundle and the certificate must match the endpoint
/// hostname. The platform trust store is only consulted when the caller opts
/// in with `platform_roots`. All certificate material is read and validated
/// by [`build`](Self::build), so a bad path fails at proxy construction, not
/// on the first call.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub ca_certs: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub validate_hostname: bool,
    pub platform_roots: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions {
            ca_certs: None,
            cert_file: None,
            key_file: None,
            validate_hostname: true,
            platform_roots: false,
        }
    }
}

impl TlsOptions {
    /// Build a verified client context from these options.
    pub fn build(&self) -> Result<TlsPolicy> {
        let roots = Arc::new(self.load_roots()?);

        let identity = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some(load_identity(cert, key)?),
            (None, None) => None,
            _ => {
                return Err(RpcError::Config(
                    "cert_file and key_file must be supplied together".into(),
                ))
            }
        };

        let builder = if self.validate_hostname {
            ClientConfig::builder().with_root_certificates(roots)
        } else {
            let inner = WebPkiServerVerifier::builder(roots).build().map_err(|e| {
                RpcError::Config(format!("unable to build certificate verifier: {}", e))
            })?;
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(ChainOnlyVerifier { inner }))
        };

        let config = match identity {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| RpcError::Config(format!("invalid client certificate: {}", e)))?,
            None => builder.with_no_client_auth(),
        };

        Ok(TlsPolicy {
            config: Arc::new(config),
        })
    }

    fn load_roots(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        let mut trusted = false;

        if let Some(path) = &self.ca_certs {
            let certs = read_pem_certs(path)?;
            if certs.is_empty() {
                return Err(RpcError::Config(format!(
                    "no certificates found in CA bundle {}",
                    path.display()
                )));
            }
            for cert in certs {
                roots.add(cert).map_err(|e| {
                    RpcError::Config(format!("invalid certificate in {}: {}", path.display(), e))
                })?;
            }
            trusted = true;
        }

        if self.platform_roots {
            let native = rustls_native_certs::load_native_certs();
            if native.certs.is_empty() {
                return Err(RpcError::Config(format!(
                    "unable to load platform trust store: {:?}",
                    native.errors
                )));
            }
            for cert in native.certs {
                // Tolerate individual unparseable platform certs, as long as
                // some trust anchors load.
                let _ = roots.add(cert);
            }
            trusted = true;
        }

        if !trusted {
            return Err(RpcError::Config(
                "https endpoints require an explicit CA bundle (ca_certs) or the platform_roots opt-in"
                    .into(),
            ));
        }

        Ok(roots)
    }
}

/// A built, immutable TLS client context.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    config: Arc<ClientConfig>,
}

impl TlsPolicy {
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }
}

fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| RpcError::Config(format!("unable to read {}: {}", path.display(), e)))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RpcError::Config(format!("invalid PEM in {}: {}", path.display(), e)))
}

fn load_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certs = read_pem_certs(cert_path)?;
    if certs.is_empty() {
        return Err(RpcError::Config(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| RpcError::Config(format!("unable to read {}: {}", key_path.display(), e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| RpcError::Config(format!("invalid PEM in {}: {}", key_path.display(), e)))?
        .ok_or_else(|| {
            RpcError::Config(format!("no private key found in {}", key_path.display()))
        })?;

    Ok((certs, key))
}

/// Verifier for `validate_hostname = false`: the full chain is still checked
/// against the trust anchors, but a name mismatch on an otherwise valid
/// certificate is tolerated. Every other failure is passed through.
#[derive(Debug)]
struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
