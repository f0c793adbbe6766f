//! Core contracts for the Crawlspace platform.
//!
//! This crate holds the leaves of the system: shared error types, the typed
//! identifier scheme, the blob store contract, the ephemeral coordination
//! store contract, and the principal/auth seam. Everything here is consumed
//! by `crawlspace-engine` and `crawlspace-api`; nothing here depends on the
//! relational store or the container runtime.

pub mod blob;
pub mod coord;
pub mod error;
pub mod id;
pub mod principal;

pub use blob::{BlobMeta, BlobStore, FsBlobStore, MemoryBlobStore};
pub use coord::{CoordStore, Lease, MemoryCoordStore, Subscription};
pub use error::{Error, Result};
pub use id::{
    ActorId, DatasetId, KeyValueStoreId, PrincipalId, RequestId, RequestQueueId, RunId, ID_LEN,
};
pub use principal::{Authenticator, Principal, PrincipalKind, StaticKeyAuthenticator};
