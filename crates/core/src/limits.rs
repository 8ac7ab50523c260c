//! Size limits for keys and values
//!
//! Keys and values are persisted as bytes. The engine checks encoded sizes
//! before buffering a write so an oversized payload never reaches the log.

use crate::error::{StateError, StateResult};

/// Default maximum encoded key size (4KB)
pub const DEFAULT_MAX_KEY_BYTES: usize = 4 * 1024;

/// Default maximum encoded value size (16MB)
pub const DEFAULT_MAX_VALUE_BYTES: usize = 16 * 1024 * 1024;

/// Size limits for keys and values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum encoded key length in bytes
    pub max_key_bytes: usize,
    /// Maximum encoded value length in bytes
    pub max_value_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_key_bytes: DEFAULT_MAX_KEY_BYTES,
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
        }
    }
}

impl Limits {
    /// Create limits with small values for testing
    pub fn with_small_limits() -> Self {
        Limits {
            max_key_bytes: 64,
            max_value_bytes: 256,
        }
    }

    /// Validate an encoded key length
    pub fn check_key(&self, encoded_len: usize) -> StateResult<()> {
        if encoded_len > self.max_key_bytes {
            return Err(StateError::invalid_operation(format!(
                "key of {} bytes exceeds limit of {} bytes",
                encoded_len, self.max_key_bytes
            )));
        }
        Ok(())
    }

    /// Validate an encoded value length
    pub fn check_value(&self, encoded_len: usize) -> StateResult<()> {
        if encoded_len > self.max_value_bytes {
            return Err(StateError::ValueTooLarge {
                size: encoded_len,
                limit: self.max_value_bytes,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = Limits::default();
        assert!(limits.check_key(DEFAULT_MAX_KEY_BYTES).is_ok());
        assert!(limits.check_key(DEFAULT_MAX_KEY_BYTES + 1).is_err());
        assert!(limits.check_value(DEFAULT_MAX_VALUE_BYTES).is_ok());
    }

    #[test]
    fn test_value_too_large() {
        let limits = Limits::with_small_limits();
        match limits.check_value(257) {
            Err(StateError::ValueTooLarge { size, limit }) => {
                assert_eq!(size, 257);
                assert_eq!(limit, 256);
            }
            other => panic!("expected ValueTooLarge, got {:?}", other),
        }
    }
}
