//! Host-key store (§4.2): load or generate the server's long-lived signer.
//!
//! Grounded on the original implementation's generate/validate/persist split
//! (RSA-2048, PKCS#1 PEM, `0600`), adapted to the `rsa` + `russh_keys` crates.

use std::fs;
use std::io::Write;
use std::path::Path;

use log::info;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::RsaPrivateKey;
use russh_keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh_keys::ssh_key::LineEnding;
use russh_keys::PrivateKey;

use crate::error::HostKeyError;

const RSA_KEY_BITS: usize = 2048;

#[cfg(unix)]
fn restrict_permissions(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

fn generate_rsa_key() -> Result<RsaPrivateKey, HostKeyError> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| HostKeyError::Parse(format!("rsa keygen failed: {e}")))?;
    key.validate()
        .map_err(|e| HostKeyError::Parse(format!("generated rsa key failed validation: {e}")))?;
    Ok(key)
}

fn rsa_key_to_signer(key: RsaPrivateKey) -> Result<PrivateKey, HostKeyError> {
    let keypair = RsaKeypair::try_from(key)
        .map_err(|e| HostKeyError::Parse(format!("rsa key is not ssh-compatible: {e}")))?;
    PrivateKey::new(KeypairData::Rsa(keypair), "")
        .map_err(|e| HostKeyError::Parse(format!("failed to build ssh signer: {e}")))
}

fn write_host_key(path: &Path, key: &RsaPrivateKey) -> Result<(), HostKeyError> {
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| HostKeyError::Parse(format!("failed to encode pkcs1 pem: {e}")))?;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    restrict_permissions(&file)?;
    file.write_all(pem.as_bytes())?;
    Ok(())
}

fn read_host_key(path: &Path) -> Result<RsaPrivateKey, HostKeyError> {
    let pem = fs::read_to_string(path)?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .map_err(|e| HostKeyError::Parse(format!("failed to parse pkcs1 pem: {e}")))
}

/// Loads the signer at `path`, generating and persisting a fresh RSA-2048
/// key if the file does not exist. Fails with [`HostKeyError::IsDirectory`]
/// if `path` names a directory. The file is opened and closed within each
/// helper, so the descriptor is released on every exit path.
pub fn load_or_generate(path: &Path) -> Result<PrivateKey, HostKeyError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Err(HostKeyError::IsDirectory),
        Ok(_) => {
            info!("loading host key from {}", path.display());
            let key = read_host_key(path)?;
            rsa_key_to_signer(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("generating new host key at {}", path.display());
            let key = generate_rsa_key()?;
            write_host_key(path, &key)?;
            rsa_key_to_signer(key)
        }
        Err(e) => Err(HostKeyError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct TempPath(PathBuf);

    impl TempPath {
        fn new(name: &str) -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!(
                "tunnelgate-hostkey-test-{name}-{}",
                std::process::id()
            ));
            Self(path)
        }
    }

    impl Drop for TempPath {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.0);
        }
    }

    #[test]
    fn generate_then_reload_same_public_key() {
        let tmp = TempPath::new("roundtrip");
        let first = load_or_generate(&tmp.0).expect("first load generates");
        let second = load_or_generate(&tmp.0).expect("second load reads back");
        assert_eq!(
            first.public_key().to_bytes().unwrap(),
            second.public_key().to_bytes().unwrap()
        );
    }

    #[test]
    fn generated_file_has_0600_permissions() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let tmp = TempPath::new("perms");
            load_or_generate(&tmp.0).expect("load generates");
            let mode = fs::metadata(&tmp.0).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn directory_path_is_rejected() {
        let dir = std::env::temp_dir();
        let err = load_or_generate(&dir).unwrap_err();
        assert!(matches!(err, HostKeyError::IsDirectory));
    }
}
