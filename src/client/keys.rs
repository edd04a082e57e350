//! Key Validation and Namespacing
//!
//! Every key passes through [`KeyManager::validate`] before it is routed or
//! encoded. The result is the key as it appears on the wire.

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::protocol::MAX_KEY_LENGTH;

/// Length of the hex digest appended to shortened keys
const DIGEST_LENGTH: usize = 40;

/// Separator between the kept prefix and the digest
const DIGEST_MARKER: &[u8] = b":sha1:";

/// Applies the namespace and length rules to keys.
#[derive(Debug, Clone, Default)]
pub struct KeyManager {
    namespace: Option<String>,
}

impl KeyManager {
    pub fn new(namespace: Option<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns the wire form of `key`: namespaced, and shortened to a
    /// digest form when longer than memcached allows.
    pub fn validate(&self, key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(Error::InvalidKey("key cannot be empty".to_string()));
        }

        let mut full = match &self.namespace {
            Some(ns) => {
                let mut full = Vec::with_capacity(ns.len() + 1 + key.len());
                full.extend_from_slice(ns.as_bytes());
                full.push(b':');
                full.extend_from_slice(key);
                full
            }
            None => key.to_vec(),
        };

        if full.len() > MAX_KEY_LENGTH {
            let digest = hex(&Sha1::digest(&full));
            full.truncate(MAX_KEY_LENGTH - DIGEST_MARKER.len() - DIGEST_LENGTH);
            full.extend_from_slice(DIGEST_MARKER);
            full.extend_from_slice(digest.as_bytes());
        }

        Ok(full)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_key() {
        let keys = KeyManager::default();
        assert_eq!(keys.validate(b"user:1").unwrap(), b"user:1");
    }

    #[test]
    fn test_empty_key_rejected() {
        let keys = KeyManager::default();
        assert!(matches!(keys.validate(b""), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_namespace_prefix() {
        let keys = KeyManager::new(Some("app".to_string()));
        assert_eq!(keys.namespace(), Some("app"));
        assert_eq!(keys.validate(b"user:1").unwrap(), b"app:user:1");

        // an empty namespace is no namespace
        let keys = KeyManager::new(Some(String::new()));
        assert_eq!(keys.validate(b"k").unwrap(), b"k");
    }

    #[test]
    fn test_long_key_is_digested() {
        let keys = KeyManager::new(Some("ns".to_string()));
        let long = vec![b'x'; 400];
        let wire = keys.validate(&long).unwrap();

        assert_eq!(wire.len(), MAX_KEY_LENGTH);
        assert!(wire.starts_with(b"ns:xxx"));
        let marker = wire.len() - DIGEST_LENGTH - DIGEST_MARKER.len();
        assert_eq!(&wire[marker..marker + DIGEST_MARKER.len()], DIGEST_MARKER);

        // stable, and distinct for keys sharing the kept prefix
        assert_eq!(keys.validate(&long).unwrap(), wire);
        let mut other = long.clone();
        other[399] = b'y';
        assert_ne!(keys.validate(&other).unwrap(), wire);
    }

    #[test]
    fn test_max_length_key_untouched() {
        let keys = KeyManager::default();
        let key = vec![b'k'; MAX_KEY_LENGTH];
        assert_eq!(keys.validate(&key).unwrap(), key);
    }
}
