//! Service Adapters
//!
//! Narrow contracts of the services a transfer talks to. Implementations sit
//! on top of the messaging layer and are responsible for routing and
//! serialization; the coordinator only sees replies or errors.
//!
//! Request/response calls are `async` and receive the timeout the coordinator
//! budgets for them. Fire-and-forget calls are plain methods that only
//! enqueue a message and must not block.

use std::time::Duration;

use async_trait::async_trait;

use super::error::TransferError;
use super::types::{
    BillingRecord, FileAttributes, MoverId, MoverInfo, MoverRequest, PnfsId, Pool, PoolSelection,
    ReadPoolRequest, Subject, WritePoolRequest,
};

/// Namespace (file metadata) service
#[async_trait]
pub trait Namespace: Send + Sync {
    /// Create a new regular file entry.
    ///
    /// Fails with `FileExists` if the path is taken.
    async fn create_entry(
        &self,
        subject: &Subject,
        path: &str,
        timeout: Duration,
    ) -> Result<FileAttributes, TransferError>;

    /// Read the attributes of an entry, by id when known, else by path.
    async fn read_entry(
        &self,
        subject: &Subject,
        pnfs_id: Option<&PnfsId>,
        path: &str,
        allow_write: bool,
        timeout: Duration,
    ) -> Result<FileAttributes, TransferError>;

    /// Delete an entry. `pnfs_id` of `None` deletes by path.
    async fn delete_entry(
        &self,
        pnfs_id: Option<&PnfsId>,
        path: &str,
        timeout: Duration,
    ) -> Result<(), TransferError>;
}

/// Placement service
#[async_trait]
pub trait PoolManager: Send + Sync {
    async fn select_write_pool(
        &self,
        request: WritePoolRequest,
        timeout: Duration,
    ) -> Result<PoolSelection, TransferError>;

    async fn select_read_pool(
        &self,
        request: ReadPoolRequest,
        timeout: Duration,
    ) -> Result<PoolSelection, TransferError>;
}

/// Storage nodes
#[async_trait]
pub trait PoolClient: Send + Sync {
    /// Ask `request.pool` to create a mover; returns its id.
    async fn create_mover(
        &self,
        request: MoverRequest,
        timeout: Duration,
    ) -> Result<MoverId, TransferError>;

    /// Fire-and-forget kill. An `Err` means the message could not be sent.
    fn kill_mover(&self, pool: &Pool, mover_id: MoverId, explanation: &str)
    -> Result<(), TransferError>;

    /// Liveness probe of a mover
    async fn query_mover(
        &self,
        pool: &Pool,
        mover_id: MoverId,
        timeout: Duration,
    ) -> Result<MoverInfo, TransferError>;
}

/// Billing sink. Fire-and-forget.
pub trait BillingSink: Send + Sync {
    fn record(&self, record: BillingRecord) -> Result<(), TransferError>;
}

/// Site policy deciding whether a subject may trigger tape restores
pub trait StagePermission: Send + Sync {
    fn can_stage(
        &self,
        subject: &Subject,
        attributes: &FileAttributes,
    ) -> Result<bool, TransferError>;
}

/// Permits staging for everyone
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowStaging;

impl StagePermission for AllowStaging {
    fn can_stage(&self, _: &Subject, _: &FileAttributes) -> Result<bool, TransferError> {
        Ok(true)
    }
}

/// Denies staging for everyone
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyStaging;

impl StagePermission for DenyStaging {
    fn can_stage(&self, _: &Subject, _: &FileAttributes) -> Result<bool, TransferError> {
        Ok(false)
    }
}

/// Drops billing records
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBilling;

impl BillingSink for NoBilling {
    fn record(&self, _: BillingRecord) -> Result<(), TransferError> {
        Ok(())
    }
}
