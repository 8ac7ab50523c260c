//! Provider factory registry
//!
//! A type descriptor names a provider kind plus, optionally, language
//! metadata such as the key and value type names. The registry maps
//! `(kind, metadata)` to a constructor so recovery can rebuild the right
//! concrete type from the logged descriptor alone.
//!
//! Metadata only counts when it was written by this language binding;
//! descriptors from other bindings resolve to the defaults:
//!
//! | kind                     | default                              |
//! |--------------------------|--------------------------------------|
//! | Store                    | `Store<String, Vec<u8>>`             |
//! | ReliableDictionaryCompat | `CompatDictionary<String, Vec<u8>>`  |

use super::compat::CompatDictionary;
use parking_lot::RwLock;
use replistate_concurrency::{ProviderContext, StateProvider};
use replistate_core::{
    StateError, StateProviderKind, StateResult, StoreKey, StoreValue, TypeDescriptor,
};
use replistate_storage::Store;
use std::collections::HashMap;
use std::sync::Arc;

/// Language tag this binding writes into type descriptors
pub const RUST_LANG: &str = "rust";

/// Constructor for one concrete provider type
pub type ProviderFactory =
    Arc<dyn Fn(ProviderContext) -> StateResult<Arc<dyn StateProvider>> + Send + Sync>;

type FactoryKey = (StateProviderKind, Option<String>);

/// Descriptor of a typed store created by this binding
pub fn store_descriptor(metadata: &str) -> TypeDescriptor {
    TypeDescriptor::store().with_lang(RUST_LANG, metadata)
}

/// Descriptor of a typed compatibility dictionary created by this binding
pub fn compat_descriptor(metadata: &str) -> TypeDescriptor {
    TypeDescriptor::new(StateProviderKind::ReliableDictionaryCompat).with_lang(RUST_LANG, metadata)
}

/// Registry of provider constructors
pub struct ProviderFactories {
    factories: RwLock<HashMap<FactoryKey, ProviderFactory>>,
}

impl Default for ProviderFactories {
    fn default() -> Self {
        let registry = ProviderFactories {
            factories: RwLock::new(HashMap::new()),
        };
        registry.insert(StateProviderKind::Store, None, store_factory::<String, Vec<u8>>());
        registry.insert(
            StateProviderKind::ReliableDictionaryCompat,
            None,
            compat_factory::<String, Vec<u8>>(),
        );
        registry
    }
}

impl ProviderFactories {
    /// Registry with the default store and compatibility dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `kind` with optional language metadata
    pub fn insert(&self, kind: StateProviderKind, metadata: Option<&str>, factory: ProviderFactory) {
        self.factories
            .write()
            .insert((kind, metadata.map(str::to_string)), factory);
    }

    /// Register `Store<K, V>` (and its compatibility dictionary) under `metadata`
    pub fn register_store<K: StoreKey, V: StoreValue>(&self, metadata: &str) {
        self.insert(StateProviderKind::Store, Some(metadata), store_factory::<K, V>());
        self.insert(
            StateProviderKind::ReliableDictionaryCompat,
            Some(metadata),
            compat_factory::<K, V>(),
        );
    }

    /// Construct the provider `ctx.descriptor` selects
    ///
    /// An unregistered descriptor fails with `TypeDescriptorDecode`.
    pub fn create(&self, ctx: ProviderContext) -> StateResult<Arc<dyn StateProvider>> {
        let key = (
            ctx.descriptor.kind,
            ctx.descriptor.metadata_for(RUST_LANG).map(str::to_string),
        );
        let factory = self.factories.read().get(&key).cloned();
        match factory {
            Some(factory) => factory(ctx),
            None => Err(StateError::TypeDescriptorDecode(format!(
                "no provider registered for kind {} with metadata {:?}",
                key.0, key.1
            ))),
        }
    }
}

fn store_factory<K: StoreKey, V: StoreValue>() -> ProviderFactory {
    Arc::new(|ctx| Ok(Store::<K, V>::new(ctx) as Arc<dyn StateProvider>))
}

fn compat_factory<K: StoreKey, V: StoreValue>() -> ProviderFactory {
    Arc::new(|ctx| Ok(CompatDictionary::<K, V>::new(ctx)? as Arc<dyn StateProvider>))
}

impl std::fmt::Debug for ProviderFactories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderFactories")
            .field("registered", &self.factories.read().len())
            .finish()
    }
}
