use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ProtocolError;
use crate::constants::MAX_ORDERING_CHANNELS;

// ---------------------------------------------------------------------------
// ContentHash
// ---------------------------------------------------------------------------

/// SHA-256 digest of a file's content.
///
/// Serialized as a 64-character lowercase hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Wraps a raw 32-byte digest.
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a hex-encoded digest.
    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ProtocolError::InvalidHash(format!("{s:?}: {e}")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({})", &hex[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// FileRecord / FileManifest
// ---------------------------------------------------------------------------

/// One file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Path relative to the manifest's directory, `/`-separated.
    pub relative_path: String,
    /// Size in bytes.
    pub size: u64,
    /// Content hash; `None` until the record has been hashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,
}

impl FileRecord {
    /// Creates an unhashed record.
    pub fn new(relative_path: impl Into<String>, size: u64) -> Self {
        Self {
            relative_path: relative_path.into(),
            size,
            hash: None,
        }
    }

    /// Returns a copy of this record carrying `hash` and the hashed `size`.
    pub fn hashed(&self, size: u64, hash: ContentHash) -> Self {
        Self {
            relative_path: self.relative_path.clone(),
            size,
            hash: Some(hash),
        }
    }

    pub fn is_hashed(&self) -> bool {
        self.hash.is_some()
    }
}

/// Ordered collection of [`FileRecord`]s with unique paths.
///
/// Inserting a path that already exists replaces the record in place, so
/// iteration order stays the order in which paths were first seen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<FileRecord>", into = "Vec<FileRecord>")]
pub struct FileManifest {
    records: Vec<FileRecord>,
    index: HashMap<String, usize>,
}

impl FileManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record, returning the record it replaced (if any).
    pub fn insert(&mut self, record: FileRecord) -> Option<FileRecord> {
        match self.index.get(&record.relative_path) {
            Some(&pos) => Some(std::mem::replace(&mut self.records[pos], record)),
            None => {
                self.index
                    .insert(record.relative_path.clone(), self.records.len());
                self.records.push(record);
                None
            }
        }
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileRecord> {
        self.index.get(relative_path).map(|&pos| &self.records[pos])
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.index.contains_key(relative_path)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of all record sizes.
    pub fn total_size(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.relative_path.as_str())
    }

    /// Returns `true` if every record carries a hash.
    pub fn is_fully_hashed(&self) -> bool {
        self.records.iter().all(FileRecord::is_hashed)
    }

    /// Selects the records under `prefix` with the prefix stripped.
    ///
    /// An empty prefix selects everything.
    pub fn with_prefix(&self, prefix: &str) -> FileManifest {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return self.clone();
        }
        let dir = format!("{prefix}/");
        self.records
            .iter()
            .filter_map(|r| {
                let rest = r.relative_path.strip_prefix(&dir)?;
                Some(FileRecord {
                    relative_path: rest.to_string(),
                    size: r.size,
                    hash: r.hash,
                })
            })
            .collect()
    }

    /// Prepends `prefix` to every path (inverse of [`with_prefix`](Self::with_prefix)).
    pub fn prefixed(&self, prefix: &str) -> FileManifest {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return self.clone();
        }
        self.records
            .iter()
            .map(|r| FileRecord {
                relative_path: format!("{prefix}/{}", r.relative_path),
                size: r.size,
                hash: r.hash,
            })
            .collect()
    }
}

impl PartialEq for FileManifest {
    fn eq(&self, other: &Self) -> bool {
        self.records == other.records
    }
}

impl Eq for FileManifest {}

impl FromIterator<FileRecord> for FileManifest {
    fn from_iter<I: IntoIterator<Item = FileRecord>>(iter: I) -> Self {
        let mut manifest = FileManifest::new();
        manifest.extend(iter);
        manifest
    }
}

impl Extend<FileRecord> for FileManifest {
    fn extend<I: IntoIterator<Item = FileRecord>>(&mut self, iter: I) {
        for record in iter {
            self.insert(record);
        }
    }
}

impl From<Vec<FileRecord>> for FileManifest {
    fn from(records: Vec<FileRecord>) -> Self {
        records.into_iter().collect()
    }
}

impl From<FileManifest> for Vec<FileRecord> {
    fn from(manifest: FileManifest) -> Self {
        manifest.records
    }
}

impl IntoIterator for FileManifest {
    type Item = FileRecord;
    type IntoIter = std::vec::IntoIter<FileRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a FileManifest {
    type Item = &'a FileRecord;
    type IntoIter = std::slice::Iter<'a, FileRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

// ---------------------------------------------------------------------------
// Handles and send parameters
// ---------------------------------------------------------------------------

/// Identifies one in-flight download request or file session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferHandle(pub u16);

impl fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Send priority requested from the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketPriority {
    Immediate,
    High,
    #[default]
    Medium,
    Low,
}

/// Ordering lane on the transport. Messages on one channel arrive in send order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct OrderingChannel(u8);

impl OrderingChannel {
    pub fn new(channel: u8) -> Result<Self, ProtocolError> {
        if channel >= MAX_ORDERING_CHANNELS {
            return Err(ProtocolError::InvalidChannel(channel));
        }
        Ok(Self(channel))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for OrderingChannel {
    type Error = ProtocolError;

    fn try_from(channel: u8) -> Result<Self, Self::Error> {
        Self::new(channel)
    }
}

impl From<OrderingChannel> for u8 {
    fn from(channel: OrderingChannel) -> Self {
        channel.0
    }
}

/// Priority and ordering channel for one outgoing message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendParams {
    pub priority: PacketPriority,
    pub channel: OrderingChannel,
}

impl SendParams {
    pub fn new(priority: PacketPriority, channel: u8) -> Result<Self, ProtocolError> {
        Ok(Self {
            priority,
            channel: OrderingChannel::new(channel)?,
        })
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Error category reported to callbacks and across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PathNotFound,
    PathEscapesRoot,
    Io,
    HashComputation,
    PeerDisconnected,
    Cancelled,
    InvalidRequest,
    ChecksumMismatch,
    Protocol,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::PathNotFound => "path not found",
            ErrorKind::PathEscapesRoot => "path escapes root",
            ErrorKind::Io => "I/O error",
            ErrorKind::HashComputation => "hash computation error",
            ErrorKind::PeerDisconnected => "peer disconnected",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::ChecksumMismatch => "checksum mismatch",
            ErrorKind::Protocol => "protocol error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(byte: u8) -> ContentHash {
        ContentHash::from_raw([byte; 32])
    }

    #[test]
    fn content_hash_hex_roundtrip() {
        let h = hash_of(0xAB);
        let parsed = ContentHash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
        assert_eq!(h.to_hex().len(), 64);
    }

    #[test]
    fn content_hash_rejects_bad_hex() {
        assert!(ContentHash::from_hex("abcd").is_err());
        assert!(ContentHash::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn content_hash_serializes_as_hex_string() {
        let json = serde_json::to_string(&hash_of(1)).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
    }

    #[test]
    fn record_field_names() {
        let record = FileRecord::new("data/a.bin", 12).hashed(12, hash_of(2));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["relativePath"], "data/a.bin");
        assert_eq!(json["size"], 12);
        assert!(json["hash"].is_string());
    }

    #[test]
    fn unhashed_record_omits_hash() {
        let json = serde_json::to_string(&FileRecord::new("a", 1)).unwrap();
        assert!(!json.contains("hash"));
    }

    #[test]
    fn manifest_insert_replaces_duplicate_path() {
        let mut m = FileManifest::new();
        assert!(m.insert(FileRecord::new("a.txt", 1)).is_none());
        m.insert(FileRecord::new("b.txt", 2));
        let old = m.insert(FileRecord::new("a.txt", 10)).unwrap();

        assert_eq!(old.size, 1);
        assert_eq!(m.len(), 2);
        assert_eq!(m.get("a.txt").unwrap().size, 10);
        let paths: Vec<&str> = m.paths().collect();
        assert_eq!(paths, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn manifest_deserialize_rebuilds_index() {
        let m: FileManifest = vec![FileRecord::new("x", 3), FileRecord::new("y/z", 4)].into();
        let json = serde_json::to_string(&m).unwrap();
        let parsed: FileManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, m);
        assert!(parsed.contains("y/z"));
        assert_eq!(parsed.total_size(), 7);
    }

    #[test]
    fn manifest_with_prefix_strips_directory() {
        let m: FileManifest = vec![
            FileRecord::new("assets/a.png", 1),
            FileRecord::new("assets/sub/b.png", 2),
            FileRecord::new("assetsx/c.png", 3),
            FileRecord::new("readme.txt", 4),
        ]
        .into();

        let sel = m.with_prefix("assets");
        let paths: Vec<&str> = sel.paths().collect();
        assert_eq!(paths, vec!["a.png", "sub/b.png"]);

        assert_eq!(m.with_prefix("").len(), 4);
        assert_eq!(sel.prefixed("assets").get("sub/b.png"), None);
        assert!(sel.prefixed("assets").contains("assets/sub/b.png"));
    }

    #[test]
    fn fully_hashed_detection() {
        let mut m = FileManifest::new();
        assert!(m.is_fully_hashed());
        m.insert(FileRecord::new("a", 1).hashed(1, hash_of(3)));
        assert!(m.is_fully_hashed());
        m.insert(FileRecord::new("b", 1));
        assert!(!m.is_fully_hashed());
    }

    #[test]
    fn ordering_channel_bounds() {
        assert!(OrderingChannel::new(0).is_ok());
        assert!(OrderingChannel::new(MAX_ORDERING_CHANNELS - 1).is_ok());
        assert!(matches!(
            OrderingChannel::new(MAX_ORDERING_CHANNELS),
            Err(ProtocolError::InvalidChannel(32))
        ));
        assert!(serde_json::from_str::<OrderingChannel>("200").is_err());
    }

    #[test]
    fn ordering_channel_error_names_the_limit() {
        let err = OrderingChannel::new(MAX_ORDERING_CHANNELS).unwrap_err();
        assert_eq!(err.to_string(), "ordering channel 32 out of range (max 31)");
    }

    #[test]
    fn send_params_json() {
        let params = SendParams::new(PacketPriority::High, 3).unwrap();
        let json = serde_json::to_value(params).unwrap();
        assert_eq!(json["priority"], "high");
        assert_eq!(json["channel"], 3);
    }

    #[test]
    fn priority_ordering_immediate_first() {
        assert!(PacketPriority::Immediate < PacketPriority::High);
        assert!(PacketPriority::Medium < PacketPriority::Low);
        assert_eq!(PacketPriority::default(), PacketPriority::Medium);
    }

    #[test]
    fn error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::PathEscapesRoot).unwrap();
        assert_eq!(json, "\"path_escapes_root\"");
    }
}
