//! `SignatureStore` (C1) and `SignatureRecovery` (C2): the layered cache and
//! the recovery pipeline built on top of it.

pub mod queue;
pub mod recovery;
pub mod sqlite;
pub mod store;
pub mod types;

pub use queue::AsyncWriteQueue;
pub use recovery::{RecoverySource, RecoveryResult};
pub use store::SignatureStore;
pub use types::{
    is_valid_signature, CacheKey, SessionSignatureEntry, SignatureEntry, StoreStats,
    ToolSignatureEntry, MIN_SIGNATURE_LENGTH, SENTINEL_SIGNATURE, TOOL_ID_SEPARATOR,
};
