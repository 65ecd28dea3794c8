//! Synchronisation d'index distants chiffrés et cache local SQLCipher.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod index;
pub mod keys;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheEntry, CachePage, CacheStore, ShareFilter};
pub use config::WorkerConfig;
pub use error::{Result, SyncError};
pub use identity::IdentityContext;
pub use index::{FileOperation, GroupShareManager, MasterIndexStore};
pub use keys::KeyManager;
pub use remote::{BlobStore, Session};
pub use sync::SyncEngine;
pub use worker::{CommandSink, Worker, WorkerRequest, WorkerResponse};
