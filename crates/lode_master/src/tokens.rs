//! Token signing keys and the certificate-authority lifecycle hooks.
//!
//! The master signs short-lived authentication tokens with a private key
//! whose record (sequence number, expiration, DER-encoded key) is stored in
//! the system table. Keys are generated ahead of use on a rotation cadence
//! and deleted once expired. Actual cryptography lives behind [`KeySource`]
//! and [`CertAuthority`]; the catalog only drives the lifecycle.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A persisted token signing key record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenSigningKey {
    pub seq_num: i64,
    pub expire_at_unix_secs: i64,
    pub private_key_der: Vec<u8>,
}

/// Internal certificate-authority material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaBundle {
    pub private_key_der: Vec<u8>,
    pub certificate_der: Vec<u8>,
}

/// Source of private key material for token signing keys.
pub trait KeySource: Send + Sync {
    fn generate_key_der(&self) -> Result<Vec<u8>>;
}

/// Stand-in key source producing random bytes; real deployments plug in an
/// actual crypto backend.
#[derive(Default)]
pub struct RandomKeySource;

impl KeySource for RandomKeySource {
    fn generate_key_der(&self) -> Result<Vec<u8>> {
        let mut der = vec![0u8; 64];
        rand::thread_rng().fill_bytes(&mut der);
        Ok(der)
    }
}

/// Certificate-authority hooks invoked from the leader preparation routine.
pub trait CertAuthority: Send + Sync {
    /// Generate fresh CA material. Must not install it.
    fn generate(&self) -> Result<CaBundle>;

    /// Install persisted CA material into the process.
    fn adopt(&self, bundle: CaBundle) -> Result<()>;
}

pub fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

struct SignerKeys {
    /// All known keys by sequence number, expired ones included: they keep
    /// the sequence numbering monotonic across restarts.
    keys: BTreeMap<i64, TokenSigningKey>,
    current: Option<i64>,
}

/// Manages the set of token signing keys for the leader master.
///
/// Protocol: `check_need_key` generates (but does not install) a key when the
/// newest one is older than the rotation interval; the caller persists it,
/// then `add_key` + `try_rotate` install and activate it. A key that was
/// never persisted must never be installed.
pub struct TokenSigner {
    rotation_interval: Duration,
    validity_period: Duration,
    key_source: Arc<dyn KeySource>,
    inner: Mutex<SignerKeys>,
}

impl TokenSigner {
    pub fn new(
        rotation_interval: Duration,
        validity_period: Duration,
        key_source: Arc<dyn KeySource>,
    ) -> Self {
        Self {
            rotation_interval,
            validity_period,
            key_source,
            inner: Mutex::new(SignerKeys { keys: BTreeMap::new(), current: None }),
        }
    }

    /// Replace the in-memory key set with keys loaded from the system table.
    pub fn import_keys(&self, keys: Vec<TokenSigningKey>) {
        let mut inner = self.inner.lock().unwrap();
        inner.keys.clear();
        inner.current = None;
        for key in keys {
            inner.keys.insert(key.seq_num, key);
        }
    }

    /// Generate the next key if it is time to do so. The returned key is not
    /// yet known to the signer; the caller persists it first.
    pub fn check_need_key(&self) -> Result<Option<TokenSigningKey>> {
        self.check_need_key_at(now_unix_secs())
    }

    pub fn check_need_key_at(&self, now_unix: i64) -> Result<Option<TokenSigningKey>> {
        let next_seq = {
            let inner = self.inner.lock().unwrap();
            match inner.keys.last_key_value() {
                None => 0,
                Some((&seq, key)) => {
                    let created_at =
                        key.expire_at_unix_secs - self.validity_period.as_secs() as i64;
                    if now_unix < created_at + self.rotation_interval.as_secs() as i64 {
                        return Ok(None);
                    }
                    seq + 1
                }
            }
        };
        let der = self.key_source.generate_key_der()?;
        Ok(Some(TokenSigningKey {
            seq_num: next_seq,
            expire_at_unix_secs: now_unix + self.validity_period.as_secs() as i64,
            private_key_der: der,
        }))
    }

    /// Install a key that has been durably persisted.
    pub fn add_key(&self, key: TokenSigningKey) {
        self.inner.lock().unwrap().keys.insert(key.seq_num, key);
    }

    /// Activate the newest non-expired key as the current signing key.
    pub fn try_rotate(&self) -> Result<()> {
        self.try_rotate_at(now_unix_secs())
    }

    pub fn try_rotate_at(&self, now_unix: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let newest_valid = inner
            .keys
            .values()
            .rev()
            .find(|k| k.expire_at_unix_secs > now_unix)
            .map(|k| k.seq_num);
        match newest_valid {
            Some(seq) => {
                inner.current = Some(seq);
                Ok(())
            }
            None => bail!("no valid token signing key available"),
        }
    }

    pub fn is_current_key_valid(&self) -> bool {
        self.is_current_key_valid_at(now_unix_secs())
    }

    pub fn is_current_key_valid_at(&self, now_unix: i64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .current
            .and_then(|seq| inner.keys.get(&seq))
            .map(|k| k.expire_at_unix_secs > now_unix)
            .unwrap_or(false)
    }

    pub fn current_key_seq(&self) -> Option<i64> {
        self.inner.lock().unwrap().current
    }

    /// Sequence numbers of keys whose expiration has passed.
    pub fn expired_key_seqs_at(&self, now_unix: i64) -> Vec<i64> {
        self.inner
            .lock()
            .unwrap()
            .keys
            .values()
            .filter(|k| k.expire_at_unix_secs <= now_unix)
            .map(|k| k.seq_num)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(
            Duration::from_secs(100),
            Duration::from_secs(700),
            Arc::new(RandomKeySource),
        )
    }

    #[test]
    fn first_key_has_sequence_zero() {
        let signer = signer();
        let key = signer
            .check_need_key_at(1000)
            .expect("generate")
            .expect("a key is needed");
        assert_eq!(key.seq_num, 0);
        assert_eq!(key.expire_at_unix_secs, 1700);

        signer.add_key(key);
        signer.try_rotate_at(1000).expect("rotate onto the new key");
        assert!(signer.is_current_key_valid_at(1000));
        assert_eq!(signer.current_key_seq(), Some(0));
    }

    #[test]
    fn rotation_interval_gates_new_keys() {
        let signer = signer();
        let key = signer.check_need_key_at(1000).unwrap().expect("first key");
        signer.add_key(key);

        assert!(signer.check_need_key_at(1050).unwrap().is_none(), "too early");
        let next = signer
            .check_need_key_at(1100)
            .unwrap()
            .expect("one rotation interval later");
        assert_eq!(next.seq_num, 1);
    }

    #[test]
    fn sequence_numbers_survive_expired_imports() {
        let signer = signer();
        signer.import_keys(vec![
            TokenSigningKey { seq_num: 4, expire_at_unix_secs: 900, private_key_der: vec![1] },
            TokenSigningKey { seq_num: 5, expire_at_unix_secs: 1700, private_key_der: vec![2] },
        ]);
        assert_eq!(signer.expired_key_seqs_at(1000), vec![4]);
        signer.try_rotate_at(1000).expect("rotate");
        assert_eq!(signer.current_key_seq(), Some(5));

        // 1700 + rotation has not passed relative to key 5's creation, so no
        // new key yet; later a seq 6 key is produced.
        assert!(signer.check_need_key_at(1050).unwrap().is_none());
        let next = signer.check_need_key_at(1200).unwrap().expect("need key");
        assert_eq!(next.seq_num, 6);
    }

    #[test]
    fn rotate_without_valid_keys_fails() {
        let signer = signer();
        signer.import_keys(vec![TokenSigningKey {
            seq_num: 0,
            expire_at_unix_secs: 500,
            private_key_der: vec![1],
        }]);
        assert!(signer.try_rotate_at(1000).is_err());
        assert!(!signer.is_current_key_valid_at(1000));
    }
}
