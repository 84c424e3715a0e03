//! Node keypair persistence.
//!
//! Keys are stored as a single hex-encoded 32-byte Ed25519 secret.

use std::path::Path;

use mumblechat_crypto::{NodeIdentity, SigningKeypair};
use thiserror::Error;
use tracing::{debug, info};

use crate::Result;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Failed to read key file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to write key file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("Malformed key file {0}")]
    Malformed(String),
}

/// Load a keypair from `path`; fails if missing
pub fn load_signing_keypair(path: &Path) -> Result<SigningKeypair> {
    let content = std::fs::read_to_string(path).map_err(|source| KeystoreError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let bytes = hex::decode(content.trim())
        .map_err(|_| KeystoreError::Malformed(path.display().to_string()))?;
    SigningKeypair::from_secret_slice(&bytes)
        .ok_or_else(|| KeystoreError::Malformed(path.display().to_string()))
}

/// Load the keypair at `path`, or generate and persist a new one
pub fn load_or_generate_signing_keypair(path: &Path) -> Result<SigningKeypair> {
    if path.exists() {
        let keypair = load_signing_keypair(path)?;
        debug!("Loaded signing key from {:?}", path);
        return Ok(keypair);
    }

    let keypair = SigningKeypair::generate();
    save_keypair_bytes(path, &keypair.secret_key_bytes())?;
    info!("Generated new signing key at {:?}", path);
    Ok(keypair)
}

/// Same as [`load_or_generate_signing_keypair`], returning the derived identity
pub fn load_or_generate_identity(path: &Path) -> Result<NodeIdentity> {
    load_or_generate_signing_keypair(path).map(NodeIdentity::from_keypair)
}

/// Write secret bytes as hex, creating parent directories. Owner-only on unix.
pub fn save_keypair_bytes(path: &Path, secret: &[u8; 32]) -> Result<()> {
    let write_err = |source| KeystoreError::Write {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
    }
    std::fs::write(path, hex::encode(secret)).map_err(write_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(write_err)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mumblechat-keystore-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_generate_then_reload_same_key() {
        let dir = temp_dir("reload");
        let path = dir.join("keys").join("node.key");

        let first = load_or_generate_signing_keypair(&path).unwrap();
        let second = load_or_generate_signing_keypair(&path).unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_malformed_key_file() {
        let dir = temp_dir("malformed");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("node.key");
        std::fs::write(&path, "not-hex").unwrap();

        let err = load_signing_keypair(&path).unwrap_err();
        assert!(matches!(err, KeystoreError::Malformed(_)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = temp_dir("perms");
        let path = dir.join("node.key");
        save_keypair_bytes(&path, &[3u8; 32]).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_identity_matches_keypair() {
        let dir = temp_dir("identity");
        let path = dir.join("node.key");
        let id = load_or_generate_identity(&path).unwrap();
        let kp = load_signing_keypair(&path).unwrap();
        assert_eq!(id.public_key(), kp.public_key_bytes());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
