//! Core library of the CoMo passive network monitor.
//!
//! The pieces here are shared by every CoMo process: the framed IPC layer,
//! the shared-memory pool allocator, the bytestream storage engine, the
//! module ABI and the capture/export pipeline engines. The process event
//! loops themselves live in the `como-node` crate.

pub mod logging;
pub mod time;
pub mod error;
pub mod serial;
pub mod buffer;
pub mod packet;
pub mod filter;
pub mod ipc;
pub mod mem;
pub mod storage;
pub mod module;
pub mod capture;
pub mod export;
