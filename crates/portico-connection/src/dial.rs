//! Dialing remotes.
//!
//! A client accepts remote endpoints as `tcp://host:port` or
//! `tls://host:port` (a bare `host:port` means tcp). TLS remotes are
//! preferred when both are configured.

use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::info;

use crate::BoxedStream;

/// TLS knobs for `tls://` remotes.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Extra PEM root certificate(s) trusted in addition to the webpki set.
    pub root_cert: Option<PathBuf>,
    /// Skip server certificate verification. Testing only.
    pub insecure: bool,
}

/// One parsed remote endpoint.
#[derive(Clone)]
pub enum Remote {
    Tcp {
        addr: String,
    },
    Tls {
        addr: String,
        server_name: ServerName<'static>,
        connector: TlsConnector,
    },
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remote::Tcp { addr } => write!(f, "tcp://{addr}"),
            Remote::Tls { addr, .. } => write!(f, "tls://{addr}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("remote url '{0}' is invalid")]
    InvalidUrl(String),

    #[error("remote url '{0}' has an invalid host name")]
    InvalidServerName(String),

    #[error("failed to read remote cert '{0}'")]
    RootCert(PathBuf),

    #[error("no remote is configured")]
    NoRemote,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed remotes with dial preference: tls beats tcp.
#[derive(Debug, Clone, Default)]
pub struct Dialer {
    tcp: Option<String>,
    tls: Option<Remote>,
}

impl Dialer {
    pub fn new(remotes: &[String], tls_options: &TlsOptions) -> Result<Self, DialError> {
        let mut dialer = Dialer::default();
        for remote in remotes {
            match parse_remote(remote, tls_options)? {
                Remote::Tcp { addr } => dialer.tcp = Some(addr),
                tls @ Remote::Tls { .. } => dialer.tls = Some(tls),
            }
        }
        Ok(dialer)
    }

    pub fn is_ready(&self) -> bool {
        self.tcp.is_some() || self.tls.is_some()
    }

    /// Open a fresh stream to the preferred remote.
    pub async fn dial(&self) -> Result<BoxedStream, DialError> {
        if let Some(Remote::Tls {
            addr,
            server_name,
            connector,
        }) = &self.tls
        {
            let tcp = TcpStream::connect(addr).await?;
            tcp.set_nodelay(true)?;
            let stream = connector.connect(server_name.clone(), tcp).await?;
            info!(remote = %addr, "connected over tls");
            return Ok(Box::new(stream));
        }
        if let Some(addr) = &self.tcp {
            let tcp = TcpStream::connect(addr).await?;
            tcp.set_nodelay(true)?;
            info!(remote = %addr, "connected over tcp");
            return Ok(Box::new(tcp));
        }
        Err(DialError::NoRemote)
    }
}

fn parse_remote(remote: &str, tls_options: &TlsOptions) -> Result<Remote, DialError> {
    let (scheme, rest) = match remote.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("tcp", remote),
    };
    if rest.is_empty() {
        return Err(DialError::InvalidUrl(remote.to_owned()));
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => (host, port),
        _ => (rest, if scheme == "tls" { "443" } else { "80" }),
    };
    let addr = format!("{host}:{port}");

    match scheme {
        "tcp" => Ok(Remote::Tcp { addr }),
        "tls" => {
            let server_name = ServerName::try_from(host.to_owned())
                .map_err(|_| DialError::InvalidServerName(remote.to_owned()))?;
            let connector = TlsConnector::from(Arc::new(tls_client_config(tls_options)?));
            Ok(Remote::Tls {
                addr,
                server_name,
                connector,
            })
        }
        _ => Err(DialError::InvalidUrl(remote.to_owned())),
    }
}

fn tls_client_config(options: &TlsOptions) -> Result<rustls::ClientConfig, DialError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = &options.root_cert {
        let file = std::fs::File::open(path).map_err(|_| DialError::RootCert(path.clone()))?;
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert = cert.map_err(|_| DialError::RootCert(path.clone()))?;
            roots
                .add(cert)
                .map_err(|_| DialError::RootCert(path.clone()))?;
        }
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if options.insecure {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification));
    }
    Ok(config)
}

/// Accept-anything verifier behind the `insecure` flag.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schemes_and_default_ports() {
        let options = TlsOptions::default();
        match parse_remote("tcp://relay.example.com:8080", &options).unwrap() {
            Remote::Tcp { addr } => assert_eq!(addr, "relay.example.com:8080"),
            other => panic!("unexpected remote {other:?}"),
        }
        match parse_remote("relay.example.com", &options).unwrap() {
            Remote::Tcp { addr } => assert_eq!(addr, "relay.example.com:80"),
            other => panic!("unexpected remote {other:?}"),
        }
        match parse_remote("tls://relay.example.com", &options).unwrap() {
            Remote::Tls { addr, .. } => assert_eq!(addr, "relay.example.com:443"),
            other => panic!("unexpected remote {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_scheme_and_empty_host() {
        let options = TlsOptions::default();
        assert!(parse_remote("quic://relay:443", &options).is_err());
        assert!(parse_remote("tcp://", &options).is_err());
    }

    #[test]
    fn tls_beats_tcp() {
        let options = TlsOptions::default();
        let dialer = Dialer::new(
            &["tcp://relay:80".to_owned(), "tls://relay:443".to_owned()],
            &options,
        )
        .unwrap();
        assert!(dialer.is_ready());
        assert!(dialer.tls.is_some());
    }
}
