//! Append-only bytestream storage.
//!
//! A bytestream is a directory of chunk files, each named by the 16-digit
//! hex start offset of the chunk within the logical stream. One STORAGE
//! process arbitrates every stream: a single writer appends and commits,
//! readers map committed ranges and block cooperatively until the writer's
//! commit point covers them. Clients map chunk files themselves; the server
//! only hands out offsets and lengths.

pub mod record;
pub mod proto;
pub mod server;
pub mod client;
pub mod service;

pub use client::{StorageConn, StorageFile};
pub use proto::{OpenMode, SeekDir};
pub use server::StorageServer;
pub use service::StorageService;
