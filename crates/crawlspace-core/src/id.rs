//! Strongly-typed identifiers for Crawlspace entities.
//!
//! All identifiers are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Opaque**: 21 characters drawn from a uniform 64-symbol alphabet
//! - **Globally unique**: No coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use crawlspace_core::id::{ActorId, RunId};
//!
//! let actor = ActorId::generate();
//! let run = RunId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: ActorId = run;
//! ```

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Number of characters in every entity identifier.
pub const ID_LEN: usize = 21;

/// The uniform 64-symbol identifier alphabet.
const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Generates a fresh 21-character identifier string.
fn generate_raw() -> String {
    let mut bytes = [0u8; ID_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| ALPHABET[(b & 0x3f) as usize] as char)
        .collect()
}

/// Validates that `s` is a well-formed identifier.
fn validate(s: &str) -> bool {
    s.len() == ID_LEN && s.bytes().all(|b| ALPHABET.contains(&b))
}

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generates a new unique identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(generate_raw())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                if validate(s) {
                    Ok(Self(s.to_string()))
                } else {
                    Err(Error::InvalidId {
                        message: format!(
                            "invalid {} '{s}': expected {ID_LEN} characters from the id alphabet",
                            stringify!($name)
                        ),
                    })
                }
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

entity_id! {
    /// A unique identifier for an actor (a deployable scraping job definition).
    ActorId
}

entity_id! {
    /// A unique identifier for a run (one execution attempt of an actor).
    RunId
}

entity_id! {
    /// A unique identifier for a dataset (ordered append-only item sequence).
    DatasetId
}

entity_id! {
    /// A unique identifier for a key-value store.
    KeyValueStoreId
}

entity_id! {
    /// A unique identifier for a request queue.
    RequestQueueId
}

entity_id! {
    /// A unique identifier for a single queued request.
    RequestId
}

entity_id! {
    /// The opaque identity of an authenticated caller.
    PrincipalId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_well_formed() {
        let id = RunId::generate();
        assert_eq!(id.as_str().len(), ID_LEN);
        assert!(validate(id.as_str()));
    }

    #[test]
    fn id_roundtrip() {
        let id = ActorId::generate();
        let parsed: ActorId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        let a = DatasetId::generate();
        let b = DatasetId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn invalid_id_returns_error() {
        let short: Result<RunId> = "too-short".parse();
        assert!(short.is_err());

        let bad_chars: Result<RunId> = "!!!!!!!!!!!!!!!!!!!!!".parse();
        assert!(bad_chars.is_err());
    }

    #[test]
    fn reserved_alias_is_not_a_valid_id() {
        let parsed: Result<DatasetId> = "default".parse();
        assert!(parsed.is_err());
    }

    #[test]
    fn serde_is_transparent() {
        let id = RequestId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
