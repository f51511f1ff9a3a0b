//! File records and the update operations that publish or retract them.

use crate::types::ids::file_id;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// A shared file as seen by the directory.
///
/// `owner_addr` is only filled in for search results, where it is joined in
/// from the owner's peer record. Locally scanned files leave it empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Index document id, when known
    pub id: Option<String>,
    /// Name relative to the owner's publish directory
    pub filename: String,
    /// Size in bytes
    pub size: u64,
    /// Username of the owning peer
    pub owner: String,
    /// Transfer address of the owner, search results only
    pub owner_addr: Option<SocketAddr>,
}

/// Identity of a file for synchronisation purposes.
///
/// Size and id are deliberately excluded: a file rewritten in place with a
/// different size keeps its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncKey {
    /// Owning username
    pub owner: String,
    /// Filename
    pub filename: String,
}

impl FileRecord {
    /// A file found while scanning the local publish directory.
    pub fn local(owner: impl Into<String>, filename: impl Into<String>, size: u64) -> Self {
        Self {
            id: None,
            filename: filename.into(),
            size,
            owner: owner.into(),
            owner_addr: None,
        }
    }

    /// The stored id, or the derived one when none was returned.
    pub fn resolved_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => file_id(&self.owner, &self.filename),
        }
    }

    /// Key used to diff local and indexed files
    pub fn sync_key(&self) -> SyncKey {
        SyncKey {
            owner: self.owner.clone(),
            filename: self.filename.clone(),
        }
    }

    /// True when both records denote the same shared file.
    pub fn same_file(&self, other: &FileRecord) -> bool {
        self.owner == other.owner && self.filename == other.filename
    }
}

/// One change to the published file set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOperation {
    /// Publish a file
    Add(FileRecord),
    /// Retract a file; the record always carries a resolved id
    Remove(FileRecord),
}

impl UpdateOperation {
    /// Publish `record` under its derived id.
    pub fn add(mut record: FileRecord) -> Self {
        record.id = Some(file_id(&record.owner, &record.filename));
        UpdateOperation::Add(record)
    }

    /// Retract `record`, deriving its id if the index did not return one.
    pub fn remove(mut record: FileRecord) -> Self {
        record.id = Some(record.resolved_id());
        UpdateOperation::Remove(record)
    }

    /// The record carried by the operation
    pub fn record(&self) -> &FileRecord {
        match self {
            UpdateOperation::Add(r) | UpdateOperation::Remove(r) => r,
        }
    }

    /// True for [`UpdateOperation::Add`]
    pub fn is_add(&self) -> bool {
        matches!(self, UpdateOperation::Add(_))
    }
}
