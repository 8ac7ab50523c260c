//! State provider type descriptors
//!
//! Each state provider is logged with a compact, self-describing type string
//! so recovery can reconstruct the right concrete type without a schema
//! lookup:
//!
//! ```text
//! '0' <version:char> <kind:char> [language tag] '\n' [language metadata]
//! ```
//!
//! The version and kind are single characters carrying their numeric value
//! (`'\u{1}'` for 1). A plain store is `"0\u{1}\u{1}\n"`.
//!
//! Older writers logged fully qualified type names instead. Those are mapped
//! to a kind through a fixed alias table; anything else is rejected with
//! `StateError::TypeDescriptorDecode`.

use crate::error::{StateError, StateResult};
use serde::{Deserialize, Serialize};
use std::fmt;

const MARKER: char = '0';
const CURRENT_VERSION: u8 = 1;
const TERMINATOR: char = '\n';

const LEGACY_ALIASES: &[(&str, StateProviderKind)] = &[
    (
        "Microsoft.ServiceFabric.Data.Collections.DistributedDictionary",
        StateProviderKind::ReliableDictionaryCompat,
    ),
    (
        "Microsoft.ServiceFabric.Data.Collections.ReliableConcurrentQueue",
        StateProviderKind::ConcurrentQueue,
    ),
    ("TStore", StateProviderKind::Store),
];

/// Concrete kind of a state provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateProviderKind {
    /// Versioned key/value store
    Store,
    /// FIFO queue
    ConcurrentQueue,
    /// Dictionary wrapper owning one child store
    ReliableDictionaryCompat,
}

impl StateProviderKind {
    fn code(&self) -> u8 {
        match self {
            StateProviderKind::Store => 1,
            StateProviderKind::ConcurrentQueue => 2,
            StateProviderKind::ReliableDictionaryCompat => 3,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(StateProviderKind::Store),
            2 => Some(StateProviderKind::ConcurrentQueue),
            3 => Some(StateProviderKind::ReliableDictionaryCompat),
            _ => None,
        }
    }

    /// Number of child providers created alongside a provider of this kind
    pub fn child_count(&self) -> usize {
        match self {
            StateProviderKind::ReliableDictionaryCompat => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for StateProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateProviderKind::Store => write!(f, "Store"),
            StateProviderKind::ConcurrentQueue => write!(f, "ConcurrentQueue"),
            StateProviderKind::ReliableDictionaryCompat => write!(f, "ReliableDictionaryCompat"),
        }
    }
}

/// Decoded type descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Encoding version
    pub version: u8,
    /// Provider kind
    pub kind: StateProviderKind,
    /// Language binding that wrote the metadata
    pub lang: Option<String>,
    /// Language-specific type metadata, e.g. key/value type names
    pub lang_metadata: Option<String>,
}

impl TypeDescriptor {
    /// Descriptor with no language metadata
    pub fn new(kind: StateProviderKind) -> Self {
        TypeDescriptor {
            version: CURRENT_VERSION,
            kind,
            lang: None,
            lang_metadata: None,
        }
    }

    /// Plain store descriptor, `"0\u{1}\u{1}\n"`
    pub fn store() -> Self {
        Self::new(StateProviderKind::Store)
    }

    /// Attach language metadata
    pub fn with_lang(mut self, lang: impl Into<String>, metadata: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self.lang_metadata = Some(metadata.into());
        self
    }

    /// Language metadata, reported only to a caller using the same language
    pub fn metadata_for(&self, lang: &str) -> Option<&str> {
        match (&self.lang, &self.lang_metadata) {
            (Some(own), Some(metadata)) if own == lang => Some(metadata.as_str()),
            _ => None,
        }
    }

    /// Encode to the wire string
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(8);
        out.push(MARKER);
        out.push(char::from(self.version));
        out.push(char::from(self.kind.code()));
        if let Some(lang) = &self.lang {
            out.push_str(lang);
        }
        out.push(TERMINATOR);
        if let Some(metadata) = &self.lang_metadata {
            out.push_str(metadata);
        }
        out
    }

    /// Decode a wire string, falling back to legacy aliases
    pub fn decode(encoded: &str) -> StateResult<Self> {
        if let Some(descriptor) = Self::decode_current(encoded) {
            return Ok(descriptor);
        }
        LEGACY_ALIASES
            .iter()
            .find(|(prefix, _)| encoded.starts_with(prefix))
            .map(|(_, kind)| TypeDescriptor::new(*kind))
            .ok_or_else(|| StateError::TypeDescriptorDecode(encoded.to_string()))
    }

    fn decode_current(encoded: &str) -> Option<Self> {
        let mut chars = encoded.chars();
        if chars.next()? != MARKER {
            return None;
        }
        let version = chars.next()? as u32;
        if version != CURRENT_VERSION as u32 {
            return None;
        }
        let kind = StateProviderKind::from_code(chars.next()? as u32)?;
        let rest = chars.as_str();
        let (lang, metadata) = rest.split_once(TERMINATOR)?;
        Some(TypeDescriptor {
            version: CURRENT_VERSION,
            kind,
            lang: (!lang.is_empty()).then(|| lang.to_string()),
            lang_metadata: (!metadata.is_empty()).then(|| metadata.to_string()),
        })
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let (Some(lang), Some(metadata)) = (&self.lang, &self.lang_metadata) {
            write!(f, "[{}:{}]", lang, metadata)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_store_encoding() {
        assert_eq!(TypeDescriptor::store().encode(), "0\u{1}\u{1}\n");
    }

    #[test]
    fn test_decode_with_language_metadata() {
        let descriptor = TypeDescriptor::decode("0\u{1}\u{3}rust\nString,Vec<u8>").unwrap();
        assert_eq!(descriptor.kind, StateProviderKind::ReliableDictionaryCompat);
        assert_eq!(descriptor.lang.as_deref(), Some("rust"));
        assert_eq!(descriptor.metadata_for("rust"), Some("String,Vec<u8>"));
        assert_eq!(descriptor.metadata_for("java"), None);
    }

    #[test]
    fn test_encode_decode_with_lang() {
        let descriptor = TypeDescriptor::new(StateProviderKind::ConcurrentQueue).with_lang("rust", "u64");
        let decoded = TypeDescriptor::decode(&descriptor.encode()).unwrap();
        assert_eq!(decoded, descriptor);
    }

    #[test]
    fn test_legacy_aliases() {
        let dict = TypeDescriptor::decode(
            "Microsoft.ServiceFabric.Data.Collections.DistributedDictionary`2[[System.String]]",
        )
        .unwrap();
        assert_eq!(dict.kind, StateProviderKind::ReliableDictionaryCompat);

        let queue =
            TypeDescriptor::decode("Microsoft.ServiceFabric.Data.Collections.ReliableConcurrentQueue`1")
                .unwrap();
        assert_eq!(queue.kind, StateProviderKind::ConcurrentQueue);

        let store = TypeDescriptor::decode("TStore`5[System.Int64]").unwrap();
        assert_eq!(store.kind, StateProviderKind::Store);
        assert_eq!(store.lang, None);
    }

    #[test]
    fn test_unknown_descriptor_is_decode_error() {
        for bad in ["", "0", "0\u{2}\u{1}\n", "0\u{1}\u{9}\n", "0\u{1}\u{1}", "SomethingElse"] {
            let err = TypeDescriptor::decode(bad).unwrap_err();
            assert!(matches!(err, StateError::TypeDescriptorDecode(_)), "{bad:?}");
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_child_count() {
        assert_eq!(StateProviderKind::ReliableDictionaryCompat.child_count(), 1);
        assert_eq!(StateProviderKind::Store.child_count(), 0);
    }
}
