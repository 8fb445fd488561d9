use crate::config::*;
use crate::error::TransportError;

use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerName};
use sha1::{Digest, Sha1};
use std::{
    convert::TryFrom,
    fs::File,
    io::BufReader,
    path::Path,
    sync::Arc,
};
use tokio_rustls::TlsConnector;

/// Everything needed to run a TLS handshake with the configured server.
#[derive(Clone)]
pub struct TlsSettings
{
    pub connector: TlsConnector,
    pub server_name: ServerName,
}

impl std::fmt::Debug for TlsSettings
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("TlsSettings").field("server_name", &self.server_name).finish()
    }
}

fn config_error(what: &str, e: impl std::fmt::Display) -> TransportError
{
    TransportError::TlsConfig(format!("{}: {}", what, e))
}

fn load_certificates(filename: &Path) -> Result<Vec<Certificate>, TransportError>
{
    let file = File::open(filename).map_err(|e| config_error(&filename.display().to_string(), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|e| config_error(&filename.display().to_string(), e))?;

    if certs.is_empty()
    {
        return Err(TransportError::TlsConfig(format!("No certificates in {}", filename.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(filename: &Path) -> Result<PrivateKey, TransportError>
{
    let file = File::open(filename).map_err(|e| config_error(&filename.display().to_string(), e))?;
    let mut reader = BufReader::new(file);
    let key = rustls_pemfile::read_one(&mut reader).map_err(|e| config_error(&filename.display().to_string(), e))?;

    use rustls_pemfile::Item;

    match key {
        Some(Item::RSAKey(key)) | Some(Item::PKCS8Key(key)) => Ok(PrivateKey(key)),
        Some(Item::X509Certificate(_)) | None => Err(TransportError::TlsConfig(format!("No private key in {}", filename.display())))
    }
}

fn trust_roots(config: &Config) -> Result<RootCertStore, TransportError>
{
    let mut roots = RootCertStore::empty();

    match config.get(&TLS_TRUST_ROOTS)
    {
        Some(filename) => {
            for cert in load_certificates(&filename)?
            {
                roots.add(&cert).map_err(|e| config_error("Invalid trust root", e))?;
            }
        }
        None => {
            roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
                OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
            }));
        }
    }

    Ok(roots)
}

/// The host part of a `host:port` address, without IPv6 brackets.
pub(crate) fn host_part(address: &str) -> &str
{
    let host = match address.rfind(':') {
        Some(idx) if !address[idx + 1..].contains(']') => &address[..idx],
        _ => address,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Build the TLS client configuration for a connection to `server_address`.
///
/// Any error here is a configuration fault.
pub fn build_tls_settings(config: &Config, server_address: &str) -> Result<TlsSettings, TransportError>
{
    if config.get(&TLS_KEY_PASSWORD).is_some()
    {
        return Err(TransportError::TlsConfig("Encrypted private keys are not supported".to_string()));
    }

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(trust_roots(config)?);

    let client_config = match (config.get(&TLS_KEY_CERT_CHAIN), config.get(&TLS_KEY))
    {
        (Some(chain), Some(key)) => builder.with_single_cert(load_certificates(&chain)?, load_private_key(&key)?)?,
        (None, None) => builder.with_no_client_auth(),
        _ => return Err(TransportError::TlsConfig("Client certificate and key must be configured together".to_string())),
    };

    let host = host_part(server_address);
    let server_name = ServerName::try_from(host).map_err(|e| config_error(host, e))?;

    Ok(TlsSettings {
        connector: TlsConnector::from(Arc::new(client_config)),
        server_name,
    })
}

/// Hex-encoded SHA-1 fingerprint of a certificate.
pub fn fingerprint(cert: &Certificate) -> String
{
    let mut hasher = Sha1::new();
    hasher.update(&cert.0);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn host_extraction()
    {
        assert_eq!(host_part("irc.libera.chat:6697"), "irc.libera.chat");
        assert_eq!(host_part("[::1]:6697"), "::1");
        assert_eq!(host_part("[::1]"), "::1");
        assert_eq!(host_part("localhost"), "localhost");
    }

    #[test]
    fn default_trust_builds()
    {
        let config = Config::new();
        let settings = build_tls_settings(&config, "irc.example.org:6697").unwrap();
        assert_eq!(settings.server_name, ServerName::try_from("irc.example.org").unwrap());
    }

    #[test]
    fn key_password_is_a_config_fault()
    {
        let config = Config::new();
        config.set(&TLS_KEY_PASSWORD, Some("hunter2".to_string())).unwrap();
        let err = build_tls_settings(&config, "irc.example.org:6697").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn missing_key_file_is_a_config_fault()
    {
        let config = Config::new();
        config.set(&TLS_KEY_CERT_CHAIN, Some("/nonexistent/chain.pem".into())).unwrap();
        config.set(&TLS_KEY, Some("/nonexistent/key.pem".into())).unwrap();
        assert!(build_tls_settings(&config, "irc.example.org:6697").unwrap_err().is_fatal());
    }

    #[test]
    fn unpaired_client_cert_is_a_config_fault()
    {
        let config = Config::new();
        config.set(&TLS_KEY, Some("/nonexistent/key.pem".into())).unwrap();
        assert!(build_tls_settings(&config, "irc.example.org:6697").unwrap_err().is_fatal());
    }

    #[test]
    fn fingerprint_is_sha1_hex()
    {
        let cert = Certificate(b"abc".to_vec());
        assert_eq!(fingerprint(&cert), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
