//! Derived identifiers for index documents.
//!
//! Ids are pure functions of their inputs so a file can be retracted without
//! looking it up first.

use crate::constants::{FILE_ID_HASH_LEN, FILE_ID_PREFIX, PEER_ID_PREFIX};

/// Document id of a peer record.
pub fn peer_id(username: &str) -> String {
    format!("{}{}", PEER_ID_PREFIX, username)
}

/// Document id of a file record, stable for an `(owner, filename)` pair.
pub fn file_id(owner: &str, filename: &str) -> String {
    let hash = blake3::hash(filename.as_bytes());
    let hex = hash.to_hex();
    format!("{}{}-{}", FILE_ID_PREFIX, owner, &hex[..FILE_ID_HASH_LEN])
}
