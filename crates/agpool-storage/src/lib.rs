//! Typed persistence for agpool: accounts, per-model quotas, attempt logs,
//! settings, api keys, and the persisted signature-cache tier, all in one
//! WAL-mode sqlite file.

pub mod entities;
mod store;

pub use store::{
    AccountRow, AttemptInsert, CandidateRow, NewAccount, SqliteStore, StorageError, StorageResult,
    STATUS_ACTIVE, STATUS_DISABLED, STATUS_ERROR, hash_api_key,
};
