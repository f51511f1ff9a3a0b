//! Mapping between records and index documents.

use crate::directory::index::Document;
use peershare_core::constants::fields;
use peershare_core::types::peer_id;
use peershare_core::{log_warn, FileRecord, PeerRecord, PeerStatus};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};

/// Full peer document, written on registration.
pub fn peer_document(peer: &PeerRecord) -> Document {
    let mut doc = Document::new();
    doc.insert(fields::ID.into(), json!(peer_id(&peer.username)));
    doc.insert(fields::DOC_TYPE.into(), json!(fields::DOC_TYPE_PEER));
    doc.insert(fields::USERNAME.into(), json!(peer.username));
    doc.extend(peer_presence(peer));
    doc
}

/// Status and address fields, always written together.
pub fn peer_presence(peer: &PeerRecord) -> Document {
    let mut doc = Document::new();
    doc.insert(fields::IP.into(), json!(peer.ip.to_string()));
    doc.insert(fields::PORT.into(), json!(peer.port));
    doc.insert(fields::STATUS.into(), json!(peer.status.as_str()));
    doc
}

/// File document published for `record` under its resolved id.
pub fn file_document(record: &FileRecord) -> Document {
    let mut doc = Document::new();
    doc.insert(fields::ID.into(), json!(record.resolved_id()));
    doc.insert(fields::DOC_TYPE.into(), json!(fields::DOC_TYPE_FILE));
    doc.insert(fields::FILENAME.into(), json!(record.filename));
    doc.insert(fields::FILENAME_TEXT.into(), json!(record.filename));
    doc.insert(fields::SIZE.into(), json!(record.size));
    doc.insert(fields::OWNER.into(), json!(record.owner));
    doc
}

/// Decode a peer document; `None` when it lacks a usable address.
pub fn decode_peer(doc: &Document) -> Option<PeerRecord> {
    let username = str_field(doc, fields::USERNAME)?;
    let ip = str_field(doc, fields::IP).and_then(|ip| ip.parse::<IpAddr>().ok());
    let port = u64_field(doc, fields::PORT)
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p > 0);
    let (Some(ip), Some(port)) = (ip, port) else {
        log_warn!("Peer '{}' has no usable address in the directory", username);
        return None;
    };
    let status = str_field(doc, fields::STATUS)
        .and_then(|s| s.parse::<PeerStatus>().ok())
        .unwrap_or(PeerStatus::Offline);
    Some(PeerRecord {
        username: username.to_string(),
        ip,
        port,
        status,
    })
}

/// Decode a file document, filling placeholders for missing fields.
pub fn decode_file(doc: &Document, owner_addr: Option<SocketAddr>) -> FileRecord {
    FileRecord {
        id: Some(str_field(doc, fields::ID).unwrap_or("unknown-id").to_string()),
        filename: str_field(doc, fields::FILENAME).unwrap_or("unknown-filename").to_string(),
        size: u64_field(doc, fields::SIZE).unwrap_or(0),
        owner: str_field(doc, fields::OWNER).unwrap_or("unknown-owner").to_string(),
        owner_addr,
    }
}

/// String value of a field; multi-valued fields yield their first entry.
pub fn str_field<'a>(doc: &'a Document, name: &str) -> Option<&'a str> {
    match doc.get(name)? {
        Value::String(s) => Some(s),
        Value::Array(items) => items.first()?.as_str(),
        _ => None,
    }
}

fn u64_field(doc: &Document, name: &str) -> Option<u64> {
    match doc.get(name)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        Value::Array(items) => items.first()?.as_u64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_document_round_trip() {
        let peer = PeerRecord::online("alice", "10.0.0.5".parse().unwrap(), 6001);
        let doc = peer_document(&peer);
        assert_eq!(doc["id"], "user-alice");
        assert_eq!(doc["doc_type_s"], "user");
        assert_eq!(doc["port_i"], 6001);
        assert_eq!(decode_peer(&doc), Some(peer));
    }

    #[test]
    fn test_peer_without_address_is_skipped() {
        let mut doc = peer_document(&PeerRecord::online("bob", "10.0.0.6".parse().unwrap(), 6002));
        doc.remove(fields::PORT);
        assert_eq!(decode_peer(&doc), None);
    }

    #[test]
    fn test_file_document_uses_derived_id() {
        let record = FileRecord::local("alice", "a.txt", 12);
        let doc = file_document(&record);
        assert_eq!(doc["id"], Value::String(peershare_core::types::file_id("alice", "a.txt")));
        assert_eq!(doc["filename_txt_en"], "a.txt");
        assert_eq!(doc["size_l"], 12);
    }

    #[test]
    fn test_decode_file_placeholders() {
        let record = decode_file(&Document::new(), None);
        assert_eq!(record.id.as_deref(), Some("unknown-id"));
        assert_eq!(record.size, 0);
    }

    #[test]
    fn test_multi_valued_fields_take_first() {
        let doc = json!({"filename_s": ["a.txt"], "size_l": [7]}).as_object().cloned().unwrap();
        let record = decode_file(&doc, None);
        assert_eq!(record.filename, "a.txt");
        assert_eq!(record.size, 7);
    }
}
