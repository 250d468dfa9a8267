//! TLS termination modes and certificate plumbing.
//!
//! The router negotiates TLS independently per side: toward the client it
//! may refuse, offer, require, or pass the encrypted bytes through
//! untouched; toward the server it may additionally mirror whatever the
//! client chose.

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientSslMode {
    Disabled,
    #[default]
    Preferred,
    Required,
    /// Do not terminate; relay encrypted bytes to the backend.
    Passthrough,
}

impl FromStr for ClientSslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DISABLED" => Ok(ClientSslMode::Disabled),
            "PREFERRED" => Ok(ClientSslMode::Preferred),
            "REQUIRED" => Ok(ClientSslMode::Required),
            "PASSTHROUGH" => Ok(ClientSslMode::Passthrough),
            other => Err(format!("unknown client_ssl_mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerSslMode {
    Disabled,
    Preferred,
    Required,
    /// Mirror the client side's choice.
    #[default]
    AsClient,
}

impl FromStr for ServerSslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DISABLED" => Ok(ServerSslMode::Disabled),
            "PREFERRED" => Ok(ServerSslMode::Preferred),
            "REQUIRED" => Ok(ServerSslMode::Required),
            "AS_CLIENT" => Ok(ServerSslMode::AsClient),
            other => Err(format!("unknown server_ssl_mode {other:?}")),
        }
    }
}

impl ServerSslMode {
    /// Resolve AS_CLIENT against what actually happened on the client
    /// side.
    pub fn resolve(&self, client_used_tls: bool) -> ServerSslMode {
        match self {
            ServerSslMode::AsClient => {
                if client_used_tls {
                    ServerSslMode::Required
                } else {
                    ServerSslMode::Disabled
                }
            }
            other => *other,
        }
    }
}

#[cfg(feature = "tls")]
pub use tls_impl::*;

#[cfg(feature = "tls")]
mod tls_impl {
    use std::io;
    use std::sync::Arc;

    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{
        CertificateDer, PrivateKeyDer, ServerName, UnixTime,
    };
    use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, ServerConfig};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    /// Server-side TLS config from PEM cert/key files.
    pub fn server_tls_config(cert_path: &str, key_path: &str) -> io::Result<Arc<ServerConfig>> {
        let cert_pem = fs_err::read(cert_path)?;
        let key_pem = fs_err::read(key_path)?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<_, _>>()?;
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])?
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "no private key in key file")
            })?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Arc::new(config))
    }

    pub fn tls_acceptor(config: Arc<ServerConfig>) -> TlsAcceptor {
        TlsAcceptor::from(config)
    }

    /// Upstream servers usually present self-signed certificates; like the
    /// usual PREFERRED semantics, encrypt without verifying the chain.
    #[derive(Debug)]
    struct AcceptAnyServerCert;

    impl ServerCertVerifier for AcceptAnyServerCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    /// Connector for the router→server side.
    pub fn backend_tls_connector() -> TlsConnector {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// SNI name for an endpoint; IP literals become IP server-names.
    pub fn server_name_for(endpoint: &str) -> ServerName<'static> {
        let host = endpoint
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(endpoint);
        ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::try_from("localhost".to_string()).expect("static name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_modes_parse() {
        assert_eq!(
            "preferred".parse::<ClientSslMode>().unwrap(),
            ClientSslMode::Preferred
        );
        assert_eq!(
            "PASSTHROUGH".parse::<ClientSslMode>().unwrap(),
            ClientSslMode::Passthrough
        );
        assert!("sometimes".parse::<ClientSslMode>().is_err());
        assert_eq!(
            "as_client".parse::<ServerSslMode>().unwrap(),
            ServerSslMode::AsClient
        );
    }

    #[test]
    fn as_client_resolves() {
        assert_eq!(
            ServerSslMode::AsClient.resolve(true),
            ServerSslMode::Required
        );
        assert_eq!(
            ServerSslMode::AsClient.resolve(false),
            ServerSslMode::Disabled
        );
        assert_eq!(
            ServerSslMode::Preferred.resolve(true),
            ServerSslMode::Preferred
        );
    }
}
