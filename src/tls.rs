use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

/// Builds the STARTTLS acceptor from PEM files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("Failed to open certificate: {:?}", cert_path))?;
    let cert_chain: Vec<Certificate> = certs(&mut BufReader::new(cert_file))
        .map_err(|_| anyhow::anyhow!("Failed to parse certificate {:?}", cert_path))?
        .into_iter()
        .map(Certificate)
        .collect();

    if cert_chain.is_empty() {
        return Err(anyhow::anyhow!("No certificate found in {:?}", cert_path));
    }

    let private_key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow::anyhow!("Failed to build TLS config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// PKCS#8 first, then PKCS#1 RSA.
fn load_private_key(key_path: &Path) -> Result<PrivateKey> {
    let open = || {
        std::fs::File::open(key_path)
            .map(BufReader::new)
            .with_context(|| format!("Failed to open private key: {:?}", key_path))
    };

    let mut keys = pkcs8_private_keys(&mut open()?)
        .map_err(|_| anyhow::anyhow!("Failed to parse private key {:?}", key_path))?;
    if keys.is_empty() {
        keys = rsa_private_keys(&mut open()?)
            .map_err(|_| anyhow::anyhow!("Failed to parse private key {:?}", key_path))?;
    }

    if keys.is_empty() {
        return Err(anyhow::anyhow!("No private key found in {:?}", key_path));
    }

    Ok(PrivateKey(keys.remove(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_reported() {
        let err = load_acceptor(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("Failed to open certificate"));
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("roundhouse-empty-{}.pem", std::process::id()));
        std::fs::write(&path, "").unwrap();
        let err = load_acceptor(&path, &path).err().unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(err.to_string().contains("No certificate found"));
    }
}
