//! Server identity loading

use crate::error::{Error, Result};
use russh::keys::PrivateKey;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Location of the host key below the user's home directory
pub const IDENTITY_FILE: &str = ".ssh/id_rsa";

/// Resolve `<home>/.ssh/id_rsa`
pub fn default_identity_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("could not retrieve home directory".to_string()))?;
    Ok(home.join(IDENTITY_FILE))
}

/// Read and parse a private key file
///
/// Any format russh-keys understands is accepted, not only RSA.
pub fn load_identity(path: impl AsRef<Path>) -> Result<PrivateKey> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|source| Error::KeyLoad {
        path: path.to_path_buf(),
        source,
    })?;

    let key = russh::keys::decode_secret_key(&data, None).map_err(|source| Error::KeyParse {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(path = %path.display(), algorithm = %key.algorithm(), "Loaded host key");
    Ok(key)
}

/// Load the identity from its conventional location
pub fn load_default_identity() -> Result<PrivateKey> {
    load_identity(default_identity_path()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::LineEnding;

    #[test]
    fn test_missing_key_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_identity(dir.path().join("id_rsa")).unwrap_err();

        assert!(matches!(err, Error::KeyLoad { .. }));
        assert!(err.to_string().starts_with("failed to load private key"));
    }

    #[test]
    fn test_garbage_key_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_rsa");
        std::fs::write(&path, "this is not a key").unwrap();

        let err = load_identity(&path).unwrap_err();
        assert!(matches!(err, Error::KeyParse { .. }));
    }

    #[test]
    fn test_load_openssh_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_rsa");
        let key = PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519).unwrap();
        let encoded = key.to_openssh(LineEnding::LF).unwrap();
        std::fs::write(&path, encoded.as_bytes()).unwrap();

        let loaded = load_identity(&path).unwrap();
        assert_eq!(loaded.public_key(), key.public_key());
    }

    #[test]
    fn test_default_path_ends_with_ssh_id_rsa() {
        if let Ok(path) = default_identity_path() {
            assert!(path.ends_with(".ssh/id_rsa"));
        }
    }
}
