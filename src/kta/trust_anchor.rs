//! TrustAnchor — KCM public key plus the KTA certificate and keypair
//!
//! Provisioned once by INITIALIZE and immutable afterwards. The three records
//! are committed together, and loading reports "not initialized" unless all
//! three are present.

use super::error::KtaError;
use crate::tee::SecureStorage;
use std::fmt;

pub const MAX_KEY_LEN: usize = 2048;
pub const MAX_CERT_LEN: usize = 8192;

pub const KCM_PUBKEY_RECORD: &str = "kcmpub";
pub const KTA_CERT_RECORD: &str = "ktacert";
pub const KTA_KEY_RECORD: &str = "ktakey";

pub const ANCHOR_RECORDS: [&str; 3] = [KCM_PUBKEY_RECORD, KTA_CERT_RECORD, KTA_KEY_RECORD];

#[derive(Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    kcm_public_key: Vec<u8>,
    kta_certificate: Vec<u8>,
    kta_key_pair: Vec<u8>,
}

impl TrustAnchor {
    /// Validate bootstrap inputs without touching storage
    pub fn new(
        kcm_public_key: &[u8],
        kta_certificate: &[u8],
        kta_key_pair: &[u8],
    ) -> Result<Self, KtaError> {
        check_len("KCM public key", kcm_public_key, MAX_KEY_LEN)?;
        check_len("KTA certificate", kta_certificate, MAX_CERT_LEN)?;
        check_len("KTA private key", kta_key_pair, MAX_KEY_LEN)?;
        Ok(Self {
            kcm_public_key: kcm_public_key.to_vec(),
            kta_certificate: kta_certificate.to_vec(),
            kta_key_pair: kta_key_pair.to_vec(),
        })
    }

    pub fn kcm_public_key(&self) -> &[u8] {
        &self.kcm_public_key
    }

    pub fn kta_certificate(&self) -> &[u8] {
        &self.kta_certificate
    }

    pub fn kta_key_pair(&self) -> &[u8] {
        &self.kta_key_pair
    }

    /// Records to commit for this anchor
    pub fn records(&self) -> [(&'static str, &[u8]); 3] {
        [
            (KCM_PUBKEY_RECORD, self.kcm_public_key.as_slice()),
            (KTA_CERT_RECORD, self.kta_certificate.as_slice()),
            (KTA_KEY_RECORD, self.kta_key_pair.as_slice()),
        ]
    }

    /// Load a previously provisioned anchor
    pub fn load(storage: &impl SecureStorage) -> Result<Option<Self>, KtaError> {
        let kcm = storage.load(KCM_PUBKEY_RECORD)?;
        let cert = storage.load(KTA_CERT_RECORD)?;
        let key = storage.load(KTA_KEY_RECORD)?;
        match (kcm, cert, key) {
            (Some(kcm_public_key), Some(kta_certificate), Some(kta_key_pair)) => Ok(Some(Self {
                kcm_public_key,
                kta_certificate,
                kta_key_pair,
            })),
            (None, None, None) => Ok(None),
            _ => {
                log::warn!("Partial trust anchor found in storage, treating KTA as uninitialized");
                Ok(None)
            }
        }
    }
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("kcm_public_key", &format_args!("{} bytes", self.kcm_public_key.len()))
            .field("kta_certificate", &format_args!("{} bytes", self.kta_certificate.len()))
            .field("kta_key_pair", &"<redacted>")
            .finish()
    }
}

fn check_len(what: &str, buf: &[u8], max: usize) -> Result<(), KtaError> {
    if buf.is_empty() || buf.len() > max {
        return Err(KtaError::BadParameters(format!(
            "{} must be 1..={} bytes, got {}",
            what,
            max,
            buf.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::MemoryStorage;

    #[test]
    fn test_bounds() {
        assert!(TrustAnchor::new(&[1; MAX_KEY_LEN], &[2; MAX_CERT_LEN], &[3; MAX_KEY_LEN]).is_ok());
        assert!(matches!(
            TrustAnchor::new(&[1; 16], &[], &[3; 16]),
            Err(KtaError::BadParameters(_))
        ));
        assert!(TrustAnchor::new(&[1; MAX_KEY_LEN + 1], &[2; 16], &[3; 16]).is_err());
        assert!(TrustAnchor::new(&[1; 16], &[2; MAX_CERT_LEN + 1], &[3; 16]).is_err());
        assert!(TrustAnchor::new(&[1; 16], &[2; 16], &[]).is_err());
    }

    #[test]
    fn test_load_requires_all_records() {
        let mut storage = MemoryStorage::new();
        assert!(TrustAnchor::load(&storage).unwrap().is_none());

        storage
            .commit(&[(KCM_PUBKEY_RECORD, &b"pub"[..]), (KTA_CERT_RECORD, &b"cert"[..])])
            .unwrap();
        assert!(TrustAnchor::load(&storage).unwrap().is_none());

        let anchor = TrustAnchor::new(b"pub", b"cert", b"key").unwrap();
        storage.commit(&anchor.records()).unwrap();
        assert_eq!(TrustAnchor::load(&storage).unwrap(), Some(anchor));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let anchor = TrustAnchor::new(b"pub", b"cert", b"super-secret").unwrap();
        let printed = format!("{:?}", anchor);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("redacted"));
    }
}
