//! Wire format shared by the transfer server and client.
//!
//! ```text
//! client -> server   u16 BE length | UTF-8 filename
//! server -> client   u16 BE length | "OK" or "ERROR: <reason>"
//! on OK              i64 BE size   | <size> raw bytes
//! ```
//!
//! There is no trailer; each side closes once the payload is done.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Accepting response frame
pub const RESPONSE_OK: &str = "OK";

/// Prefix of every rejecting response frame
pub const ERROR_PREFIX: &str = "ERROR:";

/// Reason sent for names that escape the publish directory
pub const INVALID_FILENAME: &str = "Invalid filename";

/// Reason sent for missing, non-regular or unreadable files
pub const NOT_FOUND: &str = "File not found or not readable";

/// Server's answer to a file request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Size and payload follow
    Ok,
    /// Request refused with a reason
    Error(String),
}

impl Response {
    /// Text frame for this response
    pub fn encode(&self) -> String {
        match self {
            Response::Ok => RESPONSE_OK.to_string(),
            Response::Error(reason) => format!("{} {}", ERROR_PREFIX, reason),
        }
    }

    /// Parse a response frame, `None` when it is neither OK nor ERROR.
    pub fn parse(frame: &str) -> Option<Self> {
        if frame == RESPONSE_OK {
            Some(Response::Ok)
        } else {
            frame
                .strip_prefix(ERROR_PREFIX)
                .map(|reason| Response::Error(reason.trim().to_string()))
        }
    }
}

/// Whether `name` is acceptable as a requested filename.
///
/// Names are relative paths under the publish directory: non-empty, not
/// absolute, and without `..` segments under either separator.
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('\0')
        && !std::path::Path::new(name).is_absolute()
        && !name.split(['/', '\\']).any(|segment| segment == "..")
}

/// Write one length-prefixed UTF-8 frame.
pub async fn write_frame<W>(writer: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(text.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "frame longer than 65535 bytes")
    })?;
    writer.write_u16(len).await?;
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}

/// Read one length-prefixed UTF-8 frame.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write the payload size that follows an OK frame.
pub async fn write_size<W>(writer: &mut W, size: u64) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let size = i64::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file too large for the wire"))?;
    writer.write_i64(size).await
}

/// Read the payload size, rejecting negative values.
pub async fn read_size<R>(reader: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_i64().await?;
    u64::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("negative file size {}", size)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_frame_layout_is_length_prefixed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, "song.mp3").await.unwrap();
        assert_eq!(&buf[..2], &[0x00, 0x08]);
        assert_eq!(&buf[2..], b"song.mp3");

        let mut reader = &buf[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), "song.mp3");
    }

    #[tokio::test]
    async fn test_size_is_signed_big_endian() {
        let mut buf = Vec::new();
        write_size(&mut buf, 258).await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0, 0, 0, 1, 2]);

        let negative = (-5i64).to_be_bytes();
        let mut reader = &negative[..];
        let err = read_size(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused() {
        let mut buf = Vec::new();
        let long = "x".repeat(70_000);
        assert!(write_frame(&mut buf, &long).await.is_err());
    }

    #[test]
    fn test_filename_rules() {
        assert!(is_valid_filename("song.mp3"));
        assert!(is_valid_filename("albums/one/track.flac"));
        assert!(is_valid_filename("not..parent.txt"));
        assert!(!is_valid_filename(""));
        assert!(!is_valid_filename("../secret.txt"));
        assert!(!is_valid_filename("a/../../b"));
        assert!(!is_valid_filename("..\\secret.txt"));
        assert!(!is_valid_filename("/etc/passwd"));
    }

    #[test]
    fn test_response_parse() {
        assert_eq!(Response::parse("OK"), Some(Response::Ok));
        assert_eq!(
            Response::parse("ERROR: Invalid filename"),
            Some(Response::Error(INVALID_FILENAME.to_string()))
        );
        assert_eq!(Response::parse("HELLO"), None);
        assert_eq!(
            Response::Error(NOT_FOUND.to_string()).encode(),
            "ERROR: File not found or not readable"
        );
    }

    proptest! {
        #[test]
        fn prop_parent_segment_always_rejected(
            before in proptest::collection::vec("[a-zA-Z0-9 ._-]{1,8}", 0..3),
            after in proptest::collection::vec("[a-zA-Z0-9 ._-]{1,8}", 0..3),
            sep in prop_oneof![Just("/"), Just("\\")],
        ) {
            let mut segments = before;
            segments.push("..".to_string());
            segments.extend(after);
            prop_assert!(!is_valid_filename(&segments.join(sep)));
        }
    }
}
