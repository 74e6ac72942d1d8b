//! Keystore backups: the wallet snapshot with its root secret sealed under
//! a separate backup password.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::errors::WalletError;
use crate::core::wallet_info::WalletSnapshot;

pub const KEYSTORE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreDocument {
    pub version: u32,
    /// `sealed_root` is sealed under the backup password, not the pay password.
    #[serde(flatten)]
    pub wallet: WalletSnapshot,
}

impl KeystoreDocument {
    pub fn new(wallet: WalletSnapshot) -> Self {
        Self { version: KEYSTORE_VERSION, wallet }
    }
}

/// Where keystore documents are kept.
pub trait KeystoreFile: Send + Sync {
    fn write(&self, document: &KeystoreDocument) -> Result<(), WalletError>;
    fn read(&self) -> Result<KeystoreDocument, WalletError>;
}

/// Pretty-printed JSON file, replaced atomically on write.
#[derive(Debug, Clone)]
pub struct FileKeystore {
    path: PathBuf,
}

impl FileKeystore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeystoreFile for FileKeystore {
    fn write(&self, document: &KeystoreDocument) -> Result<(), WalletError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(document)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.path)?;
        info!("Keystore written ({} bytes, {} chains)", json.len(), document.wallet.chains.len());
        Ok(())
    }

    fn read(&self) -> Result<KeystoreDocument, WalletError> {
        let bytes = fs::read(&self.path).map_err(|e| {
            WalletError::StorageError(format!("{}: {}", self.path.display(), e))
        })?;
        let document: KeystoreDocument = serde_json::from_slice(&bytes)?;
        if document.version != KEYSTORE_VERSION {
            return Err(WalletError::StorageError(format!(
                "Unsupported keystore version {}",
                document.version
            )));
        }
        debug!("Keystore read from {}", self.path.display());
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::KdfParams;
    use crate::crypto::vault::seal;
    use chrono::Utc;
    use uuid::Uuid;

    fn document() -> KeystoreDocument {
        KeystoreDocument::new(WalletSnapshot {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            sealed_root: seal(b"root", "backup-pass", &KdfParams::Scrypt { log_n: 4, r: 8, p: 1 }).unwrap(),
            chains: Vec::new(),
            identities: Vec::new(),
        })
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = FileKeystore::new(dir.path().join("nested/wallet.json"));
        let doc = document();
        keystore.write(&doc).unwrap();
        let back = keystore.read().unwrap();
        assert_eq!(back.wallet.id, doc.wallet.id);
        assert_eq!(back.wallet.sealed_root, doc.wallet.sealed_root);
        assert!(!dir.path().join("nested/wallet.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = FileKeystore::new(dir.path().join("absent.json"));
        assert!(matches!(keystore.read(), Err(WalletError::StorageError(_))));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");
        let mut value = serde_json::to_value(document()).unwrap();
        value["version"] = serde_json::json!(99);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        assert!(matches!(FileKeystore::new(&path).read(), Err(WalletError::StorageError(_))));
    }
}
