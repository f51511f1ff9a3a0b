//! Constants shared by the peer node and the balancer.

/// Prefix of every peer document id in the index service
pub const PEER_ID_PREFIX: &str = "user-";

/// Prefix of every file document id in the index service
pub const FILE_ID_PREFIX: &str = "file-";

/// Number of hex characters of the filename hash kept in a file id
pub const FILE_ID_HASH_LEN: usize = 16;

/// First port tried when the transfer server port is auto-selected
pub const AUTO_PORT_START: u16 = 6000;

/// Number of consecutive ports tried during auto-selection
pub const AUTO_PORT_ATTEMPTS: u16 = 100;

/// Index-service document fields
pub mod fields {
    /// Unique document id
    pub const ID: &str = "id";
    /// Document kind discriminator
    pub const DOC_TYPE: &str = "doc_type_s";
    /// Peer username
    pub const USERNAME: &str = "username_s";
    /// Peer address
    pub const IP: &str = "ip_s";
    /// Peer transfer port
    pub const PORT: &str = "port_i";
    /// Peer status (`online` or `offline`)
    pub const STATUS: &str = "status_s";
    /// Exact filename
    pub const FILENAME: &str = "filename_s";
    /// Tokenised filename used for full-text matching
    pub const FILENAME_TEXT: &str = "filename_txt_en";
    /// File size in bytes
    pub const SIZE: &str = "size_l";
    /// Username of the file owner
    pub const OWNER: &str = "owner_username_s";

    /// `doc_type_s` value for peer documents
    pub const DOC_TYPE_PEER: &str = "user";
    /// `doc_type_s` value for file documents
    pub const DOC_TYPE_FILE: &str = "file";
}
