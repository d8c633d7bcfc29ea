//! Mutations that flow from the frontend through the dispatcher to the store.

use crate::replication::data_provider::DataProvider;
use crate::storage::btree::StoreKey;

/// Whether a set may create a missing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddPolicy {
    Yes = 0,
    No = 1,
}

impl TryFrom<u8> for AddPolicy {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Yes),
            1 => Ok(Self::No),
            _ => Err(value),
        }
    }
}

/// Whether a set may overwrite an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplacePolicy {
    Yes = 0,
    No = 1,
    /// Only if the stored CAS equals the mutation's `old_cas`.
    IfCasMatches = 2,
}

impl TryFrom<u8> for ReplacePolicy {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Yes),
            1 => Ok(Self::No),
            2 => Ok(Self::IfCasMatches),
            _ => Err(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrDecrKind {
    Incr,
    Decr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendPrependKind {
    Append,
    Prepend,
}

/// A single-key mutation.
///
/// `Sarc` ("set, add, replace, cas") and `AppendPrepend` carry their value as a
/// [`DataProvider`], which can only be consumed once.
#[derive(Debug)]
pub enum Mutation {
    GetCas {
        key: StoreKey,
    },
    Sarc {
        key: StoreKey,
        data: DataProvider,
        flags: u32,
        exptime: u32,
        add_policy: AddPolicy,
        replace_policy: ReplacePolicy,
        old_cas: u64,
    },
    IncrDecr {
        kind: IncrDecrKind,
        key: StoreKey,
        amount: u64,
    },
    AppendPrepend {
        kind: AppendPrependKind,
        key: StoreKey,
        data: DataProvider,
    },
    Delete {
        key: StoreKey,
    },
}

impl Mutation {
    /// An unconditional set.
    #[must_use]
    pub fn set(key: StoreKey, value: Vec<u8>, flags: u32, exptime: u32) -> Self {
        Self::Sarc {
            key,
            data: DataProvider::from_bytes(value),
            flags,
            exptime,
            add_policy: AddPolicy::Yes,
            replace_policy: ReplacePolicy::Yes,
            old_cas: 0,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &StoreKey {
        match self {
            Self::GetCas { key }
            | Self::Sarc { key, .. }
            | Self::IncrDecr { key, .. }
            | Self::AppendPrepend { key, .. }
            | Self::Delete { key } => key,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetCas { .. } => "get_cas",
            Self::Sarc { .. } => "sarc",
            Self::IncrDecr {
                kind: IncrDecrKind::Incr,
                ..
            } => "incr",
            Self::IncrDecr {
                kind: IncrDecrKind::Decr,
                ..
            } => "decr",
            Self::AppendPrepend {
                kind: AppendPrependKind::Append,
                ..
            } => "append",
            Self::AppendPrepend {
                kind: AppendPrependKind::Prepend,
                ..
            } => "prepend",
            Self::Delete { .. } => "delete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_wire_values() {
        assert_eq!(AddPolicy::try_from(AddPolicy::No as u8), Ok(AddPolicy::No));
        assert_eq!(
            ReplacePolicy::try_from(ReplacePolicy::IfCasMatches as u8),
            Ok(ReplacePolicy::IfCasMatches)
        );
        assert_eq!(AddPolicy::try_from(7), Err(7));
        assert_eq!(ReplacePolicy::try_from(3), Err(3));
    }

    #[test]
    fn test_mutation_key_and_name() {
        let key = StoreKey::try_from("counter").expect("valid key");
        let decr = Mutation::IncrDecr {
            kind: IncrDecrKind::Decr,
            key: key.clone(),
            amount: 1,
        };
        assert_eq!(decr.key(), &key);
        assert_eq!(decr.name(), "decr");

        let set = Mutation::set(key.clone(), b"1".to_vec(), 0, 0);
        assert_eq!(set.name(), "sarc");
    }
}
