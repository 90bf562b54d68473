//! Transfer Core Types
//!
//! Identifiers, file attributes and the request/reply shapes exchanged with
//! the namespace, the pool manager, the pools and billing.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::TransferError;

/// Process-unique transfer id.
///
/// Used as the correlation id of every request sent on behalf of a transfer,
/// so that asynchronous replies (redirects, completion) can be matched back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pool-side mover handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MoverId(pub i32);

impl fmt::Display for MoverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Namespace identifier of a file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PnfsId(pub String);

impl fmt::Display for PnfsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Client writes; the pool accepts a file
    Upload,
    /// Client reads; the pool delivers a file
    Download,
}

impl Direction {
    #[inline]
    pub fn is_write(&self) -> bool {
        matches!(self, Direction::Upload)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "UPLOAD",
            Direction::Download => "DOWNLOAD",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Directory,
    Link,
    Special,
}

/// Backing-storage descriptor of a file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Entry exists in the namespace but no data was ever stored
    pub created_only: bool,
    /// Storage class used by the pool manager for placement
    pub storage_class: Option<String>,
    /// Tape (HSM) locations; non-empty means the file can be staged
    pub locations: Vec<String>,
    /// Path to report to billing instead of the transfer path
    pub billing_path: Option<String>,
}

/// File attributes as far as they are known to the door
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub pnfs_id: Option<PnfsId>,
    pub size: Option<u64>,
    pub file_type: Option<FileType>,
    pub storage_info: Option<StorageInfo>,
}

impl FileAttributes {
    pub fn regular() -> Self {
        Self {
            file_type: Some(FileType::Regular),
            ..Self::default()
        }
    }

    /// True if the namespace entry exists but was never written
    pub fn is_created_only(&self) -> bool {
        self.storage_info
            .as_ref()
            .is_some_and(|info| info.created_only)
    }
}

/// Pool selected for a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub address: String,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Protocol descriptor handed to the pool manager and the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolInfo {
    pub protocol: String,
    pub major: u32,
    pub minor: u32,
    /// Address the pool should expect the client from
    pub client: Option<SocketAddr>,
}

impl ProtocolInfo {
    pub fn new(protocol: impl Into<String>, major: u32, minor: u32) -> Self {
        Self {
            protocol: protocol.into(),
            major,
            minor,
            client: None,
        }
    }
}

/// Principal performing the transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub uid: Option<u32>,
    pub gids: Vec<u32>,
}

impl Subject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            gids: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("nobody")
    }
}

/// Activities the pool manager may perform to satisfy a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedStates {
    /// Restore the file from tape
    pub stage: bool,
    /// Copy the file between pools
    pub pool_to_pool: bool,
}

impl AllowedStates {
    pub const fn all() -> Self {
        Self {
            stage: true,
            pool_to_pool: true,
        }
    }

    /// Only files already on a readable pool
    pub const fn online_only() -> Self {
        Self {
            stage: false,
            pool_to_pool: false,
        }
    }

    pub fn without_stage(self) -> Self {
        Self {
            stage: false,
            ..self
        }
    }
}

impl Default for AllowedStates {
    fn default() -> Self {
        Self::all()
    }
}

/// Continuation state threaded through repeated read-pool selections.
/// Opaque to the door.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPoolContext {
    pub attempt: u32,
    pub previous_stage_pool: Option<String>,
}

// ============================================================================
// Pool Manager
// ============================================================================

#[derive(Debug, Clone)]
pub struct WritePoolRequest {
    pub session_id: SessionId,
    pub subject: Subject,
    pub attributes: FileAttributes,
    pub protocol: ProtocolInfo,
    pub allocation: u64,
    pub transfer_path: String,
    pub billing_path: String,
    pub io_queue: Option<String>,
    pub excluded_hosts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReadPoolRequest {
    pub session_id: SessionId,
    pub subject: Subject,
    pub attributes: FileAttributes,
    pub protocol: ProtocolInfo,
    pub context: Option<ReadPoolContext>,
    pub allowed_states: AllowedStates,
    pub transfer_path: String,
    pub billing_path: String,
    pub io_queue: Option<String>,
    pub excluded_hosts: Vec<String>,
}

/// Pool manager reply to a selection request
#[derive(Debug, Clone)]
pub struct PoolSelection {
    pub pool: Pool,
    pub attributes: FileAttributes,
    /// Only set by read selections
    pub context: Option<ReadPoolContext>,
}

// ============================================================================
// Pool
// ============================================================================

/// Mover creation request: accept (upload) or deliver (download)
#[derive(Debug, Clone)]
pub struct MoverRequest {
    pub session_id: SessionId,
    pub pool: Pool,
    pub direction: Direction,
    pub subject: Subject,
    pub protocol: ProtocolInfo,
    pub attributes: FileAttributes,
    pub io_queue: Option<String>,
    /// Preallocation for uploads
    pub allocation: Option<u64>,
    pub maximum_size: Option<u64>,
    pub transfer_path: String,
    pub billing_path: String,
}

/// Liveness probe reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoverInfo {
    pub mover_id: MoverId,
    pub state: String,
    pub bytes_transferred: u64,
}

/// Completion notification sent by a pool when a mover ends
#[derive(Debug, Clone)]
pub struct TransferFinished {
    pub session_id: SessionId,
    pub attributes: Option<FileAttributes>,
    pub result: Result<(), TransferError>,
}

// ============================================================================
// Billing & monitoring
// ============================================================================

/// One billing entry per transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    pub session_id: SessionId,
    pub path: String,
    pub pnfs_id: Option<PnfsId>,
    pub file_size: Option<u64>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Comma-separated client chain, directly connected client first
    pub client_chain: String,
    pub result_code: i32,
    pub error: String,
}

/// Snapshot of a transfer for an "active transfers" view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferInfo {
    pub session_id: SessionId,
    pub pnfs_id: Option<PnfsId>,
    pub path: String,
    pub subject: String,
    pub direction: Direction,
    pub pool: Option<String>,
    pub mover_id: Option<MoverId>,
    pub status: Option<String>,
    pub started_at: DateTime<Utc>,
    pub client: Option<String>,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_only() {
        let mut attrs = FileAttributes::regular();
        assert!(!attrs.is_created_only());

        attrs.storage_info = Some(StorageInfo {
            created_only: true,
            ..StorageInfo::default()
        });
        assert!(attrs.is_created_only());
    }

    #[test]
    fn test_allowed_states() {
        assert!(AllowedStates::default().stage);
        let no_stage = AllowedStates::all().without_stage();
        assert!(!no_stage.stage);
        assert!(no_stage.pool_to_pool);
        assert_eq!(AllowedStates::online_only(), AllowedStates {
            stage: false,
            pool_to_pool: false
        });
    }

    #[test]
    fn test_billing_record_json() {
        let record = BillingRecord {
            session_id: SessionId(7),
            path: "/data/file".into(),
            pnfs_id: Some(PnfsId("0000A1".into())),
            file_size: Some(1024),
            duration: Duration::from_millis(1500),
            client_chain: "10.0.0.1".into(),
            result_code: 0,
            error: String::new(),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["session_id"], 7);

        let back: BillingRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_display() {
        assert_eq!(Direction::Upload.to_string(), "UPLOAD");
        assert_eq!(SessionId(12).to_string(), "12");
        assert!(Direction::Upload.is_write());
        assert!(!Direction::Download.is_write());
    }
}
