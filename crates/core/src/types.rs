//! Identifier and ordering types
//!
//! - `Lsn`: commit sequence number, the total order of committed transactions
//! - `Epoch`: (data loss number, configuration number) reconfiguration era
//! - `TransactionId`, `StateProviderId`: opaque identities
//! - `StateProviderName`: hierarchical URI-like name of a state provider
//! - `ReplicaRole`: role reported by the replication layer

use crate::error::{StateError, StateResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Log/commit sequence number
///
/// Assigned once per committed transaction. Every operation inside one
/// transaction carries the same LSN. `Lsn::INVALID` (-1) doubles as the
/// "no version" marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(i64);

impl Lsn {
    /// Marker for "no LSN assigned"
    pub const INVALID: Lsn = Lsn(-1);
    /// LSN of the empty replica (nothing committed yet)
    pub const ZERO: Lsn = Lsn(0);

    /// Wrap a raw sequence number
    #[inline]
    pub const fn new(value: i64) -> Self {
        Lsn(value)
    }

    /// Raw value
    #[inline]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// The LSN following this one
    #[inline]
    pub const fn next(&self) -> Lsn {
        Lsn(self.0 + 1)
    }

    /// Whether this is a real, assigned LSN
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl Default for Lsn {
    fn default() -> Self {
        Lsn::ZERO
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reconfiguration era
///
/// Ordered first by data loss number, then by configuration number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Epoch {
    /// Incremented each time data loss is declared
    pub data_loss_number: i64,
    /// Incremented on every reconfiguration within a data loss era
    pub configuration_number: i64,
}

impl Epoch {
    /// Create an epoch
    pub const fn new(data_loss_number: i64, configuration_number: i64) -> Self {
        Epoch {
            data_loss_number,
            configuration_number,
        }
    }

    /// The next configuration within the same data loss era
    pub const fn next_configuration(&self) -> Self {
        Epoch::new(self.data_loss_number, self.configuration_number + 1)
    }

    /// The first configuration of the next data loss era
    pub const fn next_data_loss(&self) -> Self {
        Epoch::new(self.data_loss_number + 1, 0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{},{}>", self.data_loss_number, self.configuration_number)
    }
}

/// Transaction identifier, unique within a replica's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// State provider identifier
///
/// Stable across recovery; logged operations address providers by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateProviderId(pub i64);

impl StateProviderId {
    /// Reserved id for the state manager's own namespace operations
    pub const STATE_MANAGER: StateProviderId = StateProviderId(0);
    /// First id handed out to user providers
    pub const FIRST: StateProviderId = StateProviderId(1);
}

impl fmt::Display for StateProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sp-{}", self.0)
    }
}

/// Role of the replica as reported by the replication layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Not part of the replica set (closed or not yet opened)
    None,
    /// Being built from the primary
    IdleSecondary,
    /// Receiving replicated operations
    ActiveSecondary,
    /// Accepting writes
    Primary,
}

impl ReplicaRole {
    /// Whether the role accepts writes
    pub fn is_primary(&self) -> bool {
        matches!(self, ReplicaRole::Primary)
    }
}

/// Hierarchical, URI-like state provider name
///
/// Format: `scheme:/segment(/segment)*`, e.g. `fabric:/app/orders`.
/// Names are case-sensitive and compared byte-wise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateProviderName(String);

impl StateProviderName {
    /// Parse and validate a name
    pub fn new(name: impl Into<String>) -> StateResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(StateProviderName(name))
    }

    fn validate(name: &str) -> StateResult<()> {
        let (scheme, path) = name.split_once(":/").ok_or_else(|| {
            StateError::invalid_operation(format!("state provider name {name:?} has no scheme"))
        })?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StateError::invalid_operation(format!(
                "state provider name {name:?} has an invalid scheme"
            )));
        }
        if path.is_empty() || path.split('/').any(|segment| segment.is_empty()) {
            return Err(StateError::invalid_operation(format!(
                "state provider name {name:?} has an empty path segment"
            )));
        }
        if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(StateError::invalid_operation(format!(
                "state provider name {name:?} contains whitespace or control characters"
            )));
        }
        Ok(())
    }

    /// Name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments after the scheme
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0
            .split_once(":/")
            .map(|(_, path)| path)
            .unwrap_or_default()
            .split('/')
    }

    /// Name of a child one level below this one
    pub fn child(&self, segment: &str) -> StateResult<StateProviderName> {
        StateProviderName::new(format!("{}/{}", self.0, segment))
    }

    /// Name one level up, if this name has more than one segment
    pub fn parent(&self) -> Option<StateProviderName> {
        let (head, _) = self.0.rsplit_once('/')?;
        if head.ends_with(':') {
            return None;
        }
        Some(StateProviderName(head.to_string()))
    }

    /// Whether `self` is strictly below `other` in the hierarchy
    pub fn is_descendant_of(&self, other: &StateProviderName) -> bool {
        self.0.len() > other.0.len()
            && self.0.starts_with(other.as_str())
            && self.0.as_bytes()[other.0.len()] == b'/'
    }
}

impl fmt::Display for StateProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StateProviderName {
    type Err = StateError;

    fn from_str(s: &str) -> StateResult<Self> {
        StateProviderName::new(s)
    }
}

impl AsRef<str> for StateProviderName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
