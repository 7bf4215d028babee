//! Failure classification
//!
//! Every upstream or storage failure is mapped to one [`FailureKind`] in a
//! single place; workers decide what to do by matching on the kind.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crawling::workers::persister::PersistError;
use crate::domain::StoreError;
use crate::infrastructure::vault_client::VaultError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The vault asked us to slow down
    Throttled,
    /// Server fault, also how the vault answers pages past the end of the listing
    UpstreamUnavailable,
    /// Connection, timeout or disconnect
    TransientNetwork,
    /// The body could not be decoded into the expected shape
    MalformedResponse,
    /// The store rejected an operation; the session must be replaced
    PersistenceFailure,
    /// Anything else
    Unclassified,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Throttled => "throttled",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::TransientNetwork => "transient_network",
            Self::MalformedResponse => "malformed_response",
            Self::PersistenceFailure => "persistence_failure",
            Self::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&VaultError> for FailureKind {
    fn from(err: &VaultError) -> Self {
        match err {
            VaultError::Throttled { .. } => Self::Throttled,
            VaultError::Unavailable(_) => Self::UpstreamUnavailable,
            VaultError::Transport(inner) if inner.is_decode() => Self::MalformedResponse,
            VaultError::Transport(_) => Self::TransientNetwork,
            VaultError::Malformed(_) => Self::MalformedResponse,
            VaultError::UnrecognizedCode { .. } | VaultError::InvalidUrl(_) | VaultError::NotFound(_) => {
                Self::Unclassified
            }
        }
    }
}

impl From<&StoreError> for FailureKind {
    fn from(_: &StoreError) -> Self {
        Self::PersistenceFailure
    }
}

impl From<&PersistError> for FailureKind {
    fn from(err: &PersistError) -> Self {
        match err {
            PersistError::Store(inner) => Self::from(inner),
            PersistError::UnknownCard { .. } => Self::Unclassified,
        }
    }
}
