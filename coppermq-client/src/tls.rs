use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use tokio_rustls::{
    rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore},
    webpki, TlsConnector,
};

/// TLS connector plus the domain name presented during the handshake.
///
/// The transport below the AMQP framing is interchangeable, so the engine
/// only needs a configured connector here; certificate policy stays with
/// the caller.
#[derive(Clone)]
pub struct TlsAdaptor {
    pub(crate) connector: TlsConnector,
    pub(crate) domain: String,
}

impl TlsAdaptor {
    /// Create TlsAdaptor from customized connector.
    pub fn new(connector: TlsConnector, domain: String) -> Self {
        Self { connector, domain }
    }

    /// Build SSL/TLS without client authentication.
    ///
    /// # Errors
    ///
    /// Return errors if any I/O failure.
    pub fn without_client_auth(root_ca_cert: &Path, domain: String) -> std::io::Result<Self> {
        let root_cert_store = Self::build_root_store(root_ca_cert)?;

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        Ok(Self { connector, domain })
    }

    /// Build SSL/TLS with client authentication.
    ///
    /// # Errors
    ///
    /// Return errors if any I/O failure or if the key material is invalid.
    pub fn with_client_auth(
        root_ca_cert: &Path,
        client_cert: &Path,
        client_private_key: &Path,
        domain: String,
    ) -> std::io::Result<Self> {
        let root_cert_store = Self::build_root_store(root_ca_cert)?;
        let client_certs = Self::build_client_certificates(client_cert)?;
        let mut client_keys = Self::build_client_private_keys(client_private_key)?;

        if client_keys.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "No private key found",
            ));
        }

        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_cert_store)
            .with_single_cert(client_certs, client_keys.remove(0))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let connector = TlsConnector::from(Arc::new(config));

        Ok(Self { connector, domain })
    }

    fn build_root_store(root_ca_cert: &Path) -> std::io::Result<RootCertStore> {
        let mut root_store = RootCertStore::empty();
        let mut pem = BufReader::new(File::open(root_ca_cert)?);
        let certs = rustls_pemfile::certs(&mut pem)?;
        let trust_anchors = certs.iter().filter_map(|cert| {
            let ta = webpki::TrustAnchor::try_from_cert_der(&cert[..]).ok()?;
            Some(OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            ))
        });
        root_store.add_server_trust_anchors(trust_anchors);
        Ok(root_store)
    }

    fn build_client_certificates(client_cert: &Path) -> std::io::Result<Vec<Certificate>> {
        let mut pem = BufReader::new(File::open(client_cert)?);
        let certs = rustls_pemfile::certs(&mut pem)?;
        Ok(certs.into_iter().map(Certificate).collect())
    }

    fn build_client_private_keys(client_private_key: &Path) -> std::io::Result<Vec<PrivateKey>> {
        let mut pem = BufReader::new(File::open(client_private_key)?);
        let keys = rustls_pemfile::pkcs8_private_keys(&mut pem)?;
        Ok(keys.into_iter().map(PrivateKey).collect())
    }
}
