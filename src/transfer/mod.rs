//! Peer-to-peer file transfer
//!
//! A [`TransferServer`] streams files out of one publish directory; a
//! [`TransferClient`] pulls a named file from a remote peer onto local disk.
//! Both ends speak the framing in [`protocol`].

/// Download side
pub mod client;
/// Transfer errors
pub mod error;
/// Wire framing
pub mod protocol;
/// Upload side
pub mod server;

pub use client::{DownloadHandle, DownloadRequest, TransferClient, TransferEvent, TransferOutcome};
pub use error::TransferError;
pub use server::TransferServer;
