//! Credential vault — seals backend API keys before they touch SQLite.
//!
//! Cipher: ChaCha20-Poly1305 AEAD with a per-daemon 32-byte key stored at
//! `{data_dir}/vault.key` (mode 0600 on Unix, generated on first use).
//!
//! Sealed format: hex( nonce_12 || ciphertext ). A fresh random nonce is
//! drawn per sealing, so re-sealing the same credential yields a different
//! blob. The vault protects the database file at rest; it is not a defense
//! against an attacker who can already read the key file.

use anyhow::{anyhow, Context as _, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::{OsRng, RngCore};
use std::path::Path;

const KEY_FILE: &str = "vault.key";
const NONCE_LEN: usize = 12;

pub struct Vault {
    cipher: ChaCha20Poly1305,
}

impl Vault {
    /// Open the vault for `data_dir`, generating the key file on first use.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(KEY_FILE);

        let key_bytes: [u8; 32] = if path.exists() {
            let raw = std::fs::read(&path).context("failed to read vault key file")?;
            raw.try_into()
                .map_err(|_| anyhow!("vault key file is corrupt — expected 32 bytes"))?
        } else {
            let mut fresh = [0u8; 32];
            OsRng.fill_bytes(&mut fresh);
            std::fs::create_dir_all(data_dir)?;
            std::fs::write(&path, fresh).context("failed to write vault key file")?;

            // Restrict to owner read/write only on Unix
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            }
            fresh
        };

        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key_bytes)),
        })
    }

    /// Encrypt a credential. Returns hex( nonce_12 || ciphertext ).
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ct = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| anyhow!("AEAD encrypt failed"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ct.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ct);
        Ok(hex::encode(blob))
    }

    /// Decrypt a sealed credential produced by [`Vault::seal`].
    pub fn unseal(&self, sealed_hex: &str) -> Result<String> {
        let blob = hex::decode(sealed_hex).context("sealed credential is not valid hex")?;
        if blob.len() < NONCE_LEN {
            return Err(anyhow!("sealed credential too short"));
        }
        let (nonce_bytes, ct) = blob.split_at(NONCE_LEN);

        let pt = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ct)
            .map_err(|_| anyhow!("AEAD decrypt failed — wrong key or corrupt blob"))?;
        String::from_utf8(pt).context("decrypted credential is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn seal_then_unseal_round_trips() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let sealed = vault.seal("sk-super-secret").unwrap();
        assert_ne!(sealed, "sk-super-secret");
        assert_eq!(vault.unseal(&sealed).unwrap(), "sk-super-secret");
    }

    #[test]
    fn key_persists_across_reopens() {
        let dir = TempDir::new().unwrap();
        let sealed = Vault::open(dir.path()).unwrap().seal("sk-abc").unwrap();
        let reopened = Vault::open(dir.path()).unwrap();
        assert_eq!(reopened.unseal(&sealed).unwrap(), "sk-abc");
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        let mut sealed = vault.seal("sk-abc").unwrap();
        // Flip the last hex digit.
        let flipped = if sealed.ends_with('0') { '1' } else { '0' };
        sealed.pop();
        sealed.push(flipped);
        assert!(vault.unseal(&sealed).is_err());
    }
}
