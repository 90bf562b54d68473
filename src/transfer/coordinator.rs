//! Transfer Coordinator
//!
//! Owns the lifecycle of a single upload or download on the door side:
//! namespace lookups, pool selection, mover creation, completion and billing.
//!
//! # Concurrency
//!
//! The calling task drives selection and mover startup, the messaging layer
//! injects completion from its own tasks, and the liveness poller may inject
//! a failure at any time. All mutable state sits behind one mutex which is
//! only held to read or update fields, never across a remote call. Waiters
//! are woken through a `watch` channel that is bumped on every relevant
//! change.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::adapters::{
    AllowStaging, BillingSink, Namespace, NoBilling, PoolClient, PoolManager, StagePermission,
};
use super::error::{ErrorClass, TransferError};
use super::policy::{Deadline, RetryPolicy};
use super::session::SessionIdGenerator;
use super::types::{
    AllowedStates, BillingRecord, Direction, FileAttributes, FileType, MoverId, MoverInfo,
    MoverRequest, PnfsId, Pool, ProtocolInfo, ReadPoolContext, ReadPoolRequest, SessionId,
    Subject, TransferFinished, TransferInfo, WritePoolRequest,
};

/// Timeouts of the individual services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTimeouts {
    pub namespace: Duration,
    pub pool_manager: Duration,
    pub pool: Duration,
}

impl Default for ServiceTimeouts {
    fn default() -> Self {
        Self {
            namespace: Duration::from_secs(60),
            pool_manager: Duration::from_secs(300),
            pool: Duration::from_secs(60),
        }
    }
}

/// Everything a transfer needs to talk to the rest of the system.
///
/// A door builds one of these at startup and clones it into every transfer.
#[derive(Clone)]
pub struct TransferServices {
    pub namespace: Arc<dyn Namespace>,
    pub pool_manager: Arc<dyn PoolManager>,
    pub pool: Arc<dyn PoolClient>,
    pub billing: Arc<dyn BillingSink>,
    pub stage_permission: Arc<dyn StagePermission>,
    pub session_ids: Arc<SessionIdGenerator>,
    pub timeouts: ServiceTimeouts,
}

impl TransferServices {
    pub fn new(
        namespace: Arc<dyn Namespace>,
        pool_manager: Arc<dyn PoolManager>,
        pool: Arc<dyn PoolClient>,
    ) -> Self {
        Self {
            namespace,
            pool_manager,
            pool,
            billing: Arc::new(NoBilling),
            stage_permission: Arc::new(AllowStaging),
            session_ids: Arc::new(SessionIdGenerator::new()),
            timeouts: ServiceTimeouts::default(),
        }
    }

    pub fn with_billing(mut self, billing: Arc<dyn BillingSink>) -> Self {
        self.billing = billing;
        self
    }

    pub fn with_stage_permission(mut self, stage_permission: Arc<dyn StagePermission>) -> Self {
        self.stage_permission = stage_permission;
        self
    }

    pub fn with_session_ids(mut self, session_ids: Arc<SessionIdGenerator>) -> Self {
        self.session_ids = session_ids;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ServiceTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Notified after a transfer's mover finished, outside the transfer lock.
pub trait MoverObserver: Send + Sync {
    fn mover_finished(&self, result: &Result<(), TransferError>);
}

struct TransferInner {
    attributes: FileAttributes,
    direction: Direction,
    /// Set once an upload created its namespace entry
    direction_frozen: bool,
    protocol: Option<ProtocolInfo>,
    pool: Option<Pool>,
    mover_id: Option<MoverId>,
    mover_finished: bool,
    status: Option<String>,
    error: Option<TransferError>,
    billing_notified: bool,
    client_addresses: Vec<SocketAddr>,
    read_pool_context: Option<ReadPoolContext>,
    allowed_states: AllowedStates,
    io_queue: Option<String>,
    allocation: u64,
    maximum_size: Option<u64>,
    excluded_hosts: Vec<String>,
    overwrite_allowed: bool,
}

impl TransferInner {
    fn has_mover(&self) -> bool {
        self.mover_id.is_some() && !self.mover_finished
    }

    /// Preallocation for uploads, defaulting to the known file size
    fn allocation(&self) -> u64 {
        match (self.allocation, self.attributes.size) {
            (0, Some(size)) => size,
            (allocation, _) => allocation,
        }
    }

    fn billing_path(&self, transfer_path: &str) -> String {
        self.attributes
            .storage_info
            .as_ref()
            .and_then(|info| info.billing_path.clone())
            .unwrap_or_else(|| transfer_path.to_string())
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), TransferError> {
        if self.direction_frozen && self.direction != direction {
            return Err(TransferError::IllegalState(
                "direction of an upload cannot change after its entry was created".into(),
            ));
        }
        self.direction = direction;
        Ok(())
    }
}

/// Door-side coordinator of one transfer
pub struct TransferCoordinator {
    session_id: SessionId,
    path: String,
    subject: Subject,
    started_at: DateTime<Utc>,
    started: Instant,
    services: TransferServices,
    inner: Mutex<TransferInner>,
    changed: watch::Sender<()>,
    observer: OnceLock<Weak<dyn MoverObserver>>,
}

impl TransferCoordinator {
    /// Create a coordinator for `path`, initially a download.
    pub fn new(services: TransferServices, subject: Subject, path: impl Into<String>) -> Self {
        let (changed, _) = watch::channel(());
        Self {
            session_id: services.session_ids.next(),
            path: path.into(),
            subject,
            started_at: Utc::now(),
            started: Instant::now(),
            services,
            inner: Mutex::new(TransferInner {
                attributes: FileAttributes::default(),
                direction: Direction::Download,
                direction_frozen: false,
                protocol: None,
                pool: None,
                mover_id: None,
                mover_finished: false,
                status: None,
                error: None,
                billing_notified: false,
                client_addresses: Vec::new(),
                read_pool_context: None,
                allowed_states: AllowedStates::all(),
                io_queue: None,
                allocation: 0,
                maximum_size: None,
                excluded_hosts: Vec::new(),
                overwrite_allowed: false,
            }),
            changed,
            observer: OnceLock::new(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, TransferInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Identity & attributes
    // ========================================================================

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> Option<String> {
        self.inner().status.clone()
    }

    pub fn set_status(&self, status: Option<String>) {
        if let Some(status) = &status {
            debug!(session_id = %self.session_id, "Status: {}", status);
        }
        self.inner().status = status;
    }

    pub fn file_attributes(&self) -> FileAttributes {
        self.inner().attributes.clone()
    }

    pub fn set_file_attributes(&self, attributes: FileAttributes) {
        self.inner().attributes = attributes;
    }

    pub fn pnfs_id(&self) -> Option<PnfsId> {
        self.inner().attributes.pnfs_id.clone()
    }

    pub fn direction(&self) -> Direction {
        self.inner().direction
    }

    pub fn is_write(&self) -> bool {
        self.direction().is_write()
    }

    /// Change the direction. Fails once an upload's entry has been created.
    pub fn set_direction(&self, direction: Direction) -> Result<(), TransferError> {
        self.inner().set_direction(direction)
    }

    pub fn protocol_info(&self) -> Option<ProtocolInfo> {
        self.inner().protocol.clone()
    }

    pub fn set_protocol_info(&self, protocol: ProtocolInfo) {
        self.inner().protocol = Some(protocol);
    }

    pub fn pool(&self) -> Option<Pool> {
        self.inner().pool.clone()
    }

    pub fn set_pool(&self, pool: Option<Pool>) {
        self.inner().pool = pool;
    }

    pub fn mover_id(&self) -> Option<MoverId> {
        self.inner().mover_id
    }

    /// Whether a mover was created and has not reported completion
    pub fn has_mover(&self) -> bool {
        self.inner().has_mover()
    }

    pub fn has_mover_finished(&self) -> bool {
        self.inner().mover_finished
    }

    /// Pool and mover id while a mover is active
    pub fn active_mover(&self) -> Option<(Pool, MoverId)> {
        let inner = self.inner();
        if !inner.has_mover() {
            return None;
        }
        Some((inner.pool.clone()?, inner.mover_id?))
    }

    fn set_mover_id(&self, mover_id: MoverId) {
        self.inner().mover_id = Some(mover_id);
        self.changed.send_replace(());
    }

    pub fn io_queue(&self) -> Option<String> {
        self.inner().io_queue.clone()
    }

    pub fn set_io_queue(&self, queue: Option<String>) {
        self.inner().io_queue = queue;
    }

    /// Preallocation size for uploads. Zero means "use the file size".
    pub fn set_allocation(&self, allocation: u64) {
        self.inner().allocation = allocation;
    }

    /// Declare the size of an upload
    pub fn set_length(&self, length: u64) -> Result<(), TransferError> {
        let mut inner = self.inner();
        if !inner.direction.is_write() {
            return Err(TransferError::IllegalState(
                "can only set length for uploads".into(),
            ));
        }
        if inner.maximum_size.is_some_and(|max| length > max) {
            return Err(TransferError::InvalidArgs(format!(
                "file length {length} exceeds maximum upload size"
            )));
        }
        inner.attributes.size = Some(length);
        Ok(())
    }

    /// Upper bound for an upload of unknown size
    pub fn set_maximum_length(&self, length: u64) -> Result<(), TransferError> {
        let mut inner = self.inner();
        if !inner.direction.is_write() {
            return Err(TransferError::IllegalState(
                "can only set maximum length for uploads".into(),
            ));
        }
        if length == 0 {
            return Err(TransferError::InvalidArgs(
                "maximum length must be positive".into(),
            ));
        }
        if inner.attributes.size.is_some_and(|size| size > length) {
            return Err(TransferError::InvalidArgs(format!(
                "maximum length {length} is smaller than the declared file length"
            )));
        }
        inner.maximum_size = Some(length);
        Ok(())
    }

    /// Hosts the pool manager should avoid
    pub fn set_excluded_hosts(&self, hosts: Vec<String>) {
        self.inner().excluded_hosts = hosts;
    }

    pub fn set_overwrite_allowed(&self, allowed: bool) {
        self.inner().overwrite_allowed = allowed;
    }

    pub fn allowed_states(&self) -> AllowedStates {
        self.inner().allowed_states
    }

    /// Restrict reads to files already online. Has no effect on uploads.
    pub fn set_online_files_only(&self, online_only: bool) {
        self.inner().allowed_states = if online_only {
            AllowedStates::online_only()
        } else {
            AllowedStates::all()
        };
    }

    pub fn set_allow_staging(&self, allowed: bool) {
        self.inner().allowed_states.stage = allowed;
    }

    pub fn set_allow_pool_to_pool(&self, allowed: bool) {
        self.inner().allowed_states.pool_to_pool = allowed;
    }

    pub fn set_client_address(&self, address: SocketAddr) {
        self.inner().client_addresses = vec![address];
    }

    /// Client chain, directly connected client first
    pub fn set_client_addresses(&self, addresses: Vec<SocketAddr>) -> Result<(), TransferError> {
        if addresses.is_empty() {
            return Err(TransferError::InvalidArgs(
                "empty address list is not allowed".into(),
            ));
        }
        self.inner().client_addresses = addresses;
        Ok(())
    }

    pub fn client_address(&self) -> Option<SocketAddr> {
        self.inner().client_addresses.first().copied()
    }

    pub fn billing_path(&self) -> String {
        self.inner().billing_path(&self.path)
    }

    pub fn read_pool_context(&self) -> Option<ReadPoolContext> {
        self.inner().read_pool_context.clone()
    }

    /// Terminal error, if the mover failed
    pub fn error(&self) -> Option<TransferError> {
        self.inner().error.clone()
    }

    /// Snapshot for monitoring
    pub fn info(&self) -> TransferInfo {
        let inner = self.inner();
        TransferInfo {
            session_id: self.session_id,
            pnfs_id: inner.attributes.pnfs_id.clone(),
            path: self.path.clone(),
            subject: self.subject.name.clone(),
            direction: inner.direction,
            pool: inner.pool.as_ref().map(|p| p.name.clone()),
            mover_id: inner.mover_id,
            status: inner.status.clone(),
            started_at: self.started_at,
            client: inner.client_addresses.first().map(|a| a.ip().to_string()),
        }
    }

    /// Register the single observer of mover completion.
    ///
    /// Returns `false` if an observer was already registered.
    pub(crate) fn set_observer(&self, observer: Weak<dyn MoverObserver>) -> bool {
        self.observer.set(observer).is_ok()
    }

    /// Wake every waiter so it re-evaluates its condition
    pub(crate) fn notify_waiters(&self) {
        self.changed.send_replace(());
    }

    /// Wait until `ready` holds or `timeout` expires. Returns the final
    /// value of `ready`.
    pub(crate) async fn wait_until(
        &self,
        timeout: Duration,
        mut ready: impl FnMut() -> bool + Send,
    ) -> bool {
        let deadline = Deadline::after(timeout);
        let mut changes = self.changed.subscribe();
        loop {
            if ready() {
                return true;
            }
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return ready(),
            }
        }
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    /// Create the namespace entry of an upload.
    ///
    /// Marks the transfer as an upload for the rest of its life. With
    /// overwrite allowed, an existing file is deleted and created again.
    pub async fn create_name_space_entry(&self) -> Result<(), TransferError> {
        self.set_status(Some("PnfsManager: Creating name space entry".into()));
        let result = self.create_entry().await;
        self.set_status(None);

        let attributes = result?;
        let mut inner = self.inner();
        inner.attributes = attributes;
        inner.direction = Direction::Upload;
        inner.direction_frozen = true;
        Ok(())
    }

    async fn create_entry(&self) -> Result<FileAttributes, TransferError> {
        let namespace = &self.services.namespace;
        let timeout = self.services.timeouts.namespace;
        let created = bounded(
            "namespace",
            timeout,
            namespace.create_entry(&self.subject, &self.path, timeout),
        )
        .await;
        let overwrite = self.inner().overwrite_allowed;

        match created {
            Err(TransferError::FileExists(_)) if overwrite => {
                info!(session_id = %self.session_id, path = %self.path, "Overwriting existing file");
                bounded(
                    "namespace",
                    timeout,
                    namespace.delete_entry(None, &self.path, timeout),
                )
                .await?;
                bounded(
                    "namespace",
                    timeout,
                    namespace.create_entry(&self.subject, &self.path, timeout),
                )
                .await
            }
            other => other,
        }
    }

    /// Read the namespace entry of the file.
    ///
    /// A complete file turns the transfer into a download. A file that was
    /// created but never written becomes an upload when `allow_write`, and is
    /// rejected with `FileIsNew` otherwise.
    pub async fn read_name_space_entry(&self, allow_write: bool) -> Result<(), TransferError> {
        self.read_entry(allow_write, self.services.timeouts.namespace)
            .await
    }

    async fn read_entry(&self, allow_write: bool, timeout: Duration) -> Result<(), TransferError> {
        let pnfs_id = self.pnfs_id();

        self.set_status(Some("PnfsManager: Fetching storage info".into()));
        let result = bounded(
            "namespace",
            timeout,
            self.services.namespace.read_entry(
                &self.subject,
                pnfs_id.as_ref(),
                &self.path,
                allow_write,
                timeout,
            ),
        )
        .await;
        self.set_status(None);

        let attributes = result?;
        if matches!(
            attributes.file_type,
            Some(FileType::Directory) | Some(FileType::Special)
        ) {
            return Err(TransferError::NotFile);
        }

        let direction = if !attributes.is_created_only() {
            Direction::Download
        } else if allow_write {
            Direction::Upload
        } else {
            return Err(TransferError::FileIsNew);
        };

        let mut inner = self.inner();
        inner.set_direction(direction)?;
        inner.attributes = attributes;
        Ok(())
    }

    /// Remove the entry of a failed upload. Failures are only logged.
    pub async fn delete_name_space_entry(&self) -> Result<(), TransferError> {
        if !self.is_write() {
            return Err(TransferError::IllegalState(
                "can only delete name space entry for uploads".into(),
            ));
        }
        let Some(pnfs_id) = self.pnfs_id() else {
            return Ok(());
        };

        self.set_status(Some("PnfsManager: Deleting name space entry".into()));
        let timeout = self.services.timeouts.namespace;
        let result = bounded(
            "namespace",
            timeout,
            self.services
                .namespace
                .delete_entry(Some(&pnfs_id), &self.path, timeout),
        )
        .await;
        self.set_status(None);

        match result {
            Ok(()) => {}
            Err(e @ TransferError::FileNotFound(_)) => debug!(
                session_id = %self.session_id,
                path = %self.path,
                pnfs_id = %pnfs_id,
                error = %e,
                "Failed to delete file after failed upload"
            ),
            Err(e) => error!(
                session_id = %self.session_id,
                path = %self.path,
                pnfs_id = %pnfs_id,
                error = %e,
                "Failed to delete file after failed upload"
            ),
        }
        Ok(())
    }

    // ========================================================================
    // Pool selection & mover
    // ========================================================================

    /// Ask the pool manager for a pool and record its answer.
    pub async fn select_pool(&self, timeout: Duration) -> Result<(), TransferError> {
        self.set_status(Some("PoolManager: Selecting pool".into()));
        let result = self.request_pool(timeout).await;
        self.set_status(None);
        result
    }

    async fn request_pool(&self, timeout: Duration) -> Result<(), TransferError> {
        let protocol = self.protocol_info().ok_or_else(|| {
            TransferError::IllegalState("protocol info must be set before selecting a pool".into())
        })?;

        if self.is_write() {
            let request = {
                let inner = self.inner();
                WritePoolRequest {
                    session_id: self.session_id,
                    subject: self.subject.clone(),
                    attributes: inner.attributes.clone(),
                    protocol,
                    allocation: inner.allocation(),
                    transfer_path: self.path.clone(),
                    billing_path: inner.billing_path(&self.path),
                    io_queue: inner.io_queue.clone(),
                    excluded_hosts: inner.excluded_hosts.clone(),
                }
            };
            let selection = bounded(
                "PoolManager",
                timeout,
                self.services
                    .pool_manager
                    .select_write_pool(request, timeout),
            )
            .await?;

            let mut inner = self.inner();
            inner.pool = Some(selection.pool);
            inner.attributes = selection.attributes;
        } else {
            let attributes = self.file_attributes();
            let mut allowed_states = self.allowed_states();
            if allowed_states.stage
                && !self
                    .services
                    .stage_permission
                    .can_stage(&self.subject, &attributes)?
            {
                allowed_states = allowed_states.without_stage();
            }
            if attributes.is_created_only() && !allowed_states.stage {
                return Err(TransferError::FileIsNew);
            }

            let request = {
                let inner = self.inner();
                ReadPoolRequest {
                    session_id: self.session_id,
                    subject: self.subject.clone(),
                    attributes,
                    protocol,
                    context: inner.read_pool_context.clone(),
                    allowed_states,
                    transfer_path: self.path.clone(),
                    billing_path: inner.billing_path(&self.path),
                    io_queue: inner.io_queue.clone(),
                    excluded_hosts: inner.excluded_hosts.clone(),
                }
            };
            let selection = bounded(
                "PoolManager",
                timeout,
                self.services.pool_manager.select_read_pool(request, timeout),
            )
            .await?;

            let mut inner = self.inner();
            inner.pool = Some(selection.pool);
            inner.attributes = selection.attributes;
            if selection.context.is_some() {
                inner.read_pool_context = selection.context;
            }
        }

        debug!(
            session_id = %self.session_id,
            pool = ?self.pool().map(|p| p.name),
            "Pool selected"
        );
        Ok(())
    }

    /// Ask the selected pool to create a mover.
    ///
    /// `queue` overrides the configured IO queue.
    pub async fn start_mover(
        &self,
        queue: Option<&str>,
        timeout: Duration,
    ) -> Result<(), TransferError> {
        let request = {
            let inner = self.inner();
            let (Some(pool), Some(_)) = (inner.pool.clone(), inner.attributes.pnfs_id.as_ref())
            else {
                return Err(TransferError::IllegalState(
                    "need file attributes and pool before a mover can be started".into(),
                ));
            };
            let protocol = inner.protocol.clone().ok_or_else(|| {
                TransferError::IllegalState("protocol info must be set before starting a mover".into())
            })?;
            let is_write = inner.direction.is_write();
            MoverRequest {
                session_id: self.session_id,
                pool,
                direction: inner.direction,
                subject: self.subject.clone(),
                protocol,
                attributes: inner.attributes.clone(),
                io_queue: queue.map(str::to_string).or_else(|| inner.io_queue.clone()),
                allocation: is_write.then(|| inner.allocation()),
                maximum_size: if is_write { inner.maximum_size } else { None },
                transfer_path: self.path.clone(),
                billing_path: inner.billing_path(&self.path),
            }
        };
        let pool = request.pool.clone();

        self.set_status(Some(format!("Pool {pool}: Creating mover")));
        let result = bounded(
            &pool.name,
            timeout,
            self.services.pool.create_mover(request, timeout),
        )
        .await;
        self.set_status(None);

        match result {
            Ok(mover_id) => {
                info!(session_id = %self.session_id, pool = %pool, mover_id = %mover_id, "Mover created");
                self.set_mover_id(mover_id);
                Ok(())
            }
            Err(e @ TransferError::NoRoute(_)) => {
                // pool vanished; let the next attempt select again
                self.set_pool(None);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Select a pool and start a mover, retrying as `policy` allows.
    ///
    /// Transient placement errors (stale attributes, disabled pool, file not
    /// yet in the repository) are retried at once and do not count against
    /// the retry budget. A timeout after a pool was obtained for an upload is
    /// never retried: the pool may have created the mover already and a
    /// second attempt could write the file twice.
    pub async fn select_pool_and_start_mover(
        &self,
        queue: Option<&str>,
        policy: &RetryPolicy,
    ) -> Result<(), TransferError> {
        let deadline = Deadline::after(policy.total_timeout());
        let mut retries_left = policy.retry_count();
        let mut refresh = false;

        loop {
            let attempt_started = Instant::now();
            let mut got_pool = false;
            let error = match self
                .attempt(queue, policy, deadline, refresh, &mut got_pool)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            refresh = !self.is_write();

            match error.class() {
                ErrorClass::Timeout if got_pool && self.is_write() => {
                    warn!(
                        session_id = %self.session_id,
                        error = %error,
                        "Mover creation timed out for upload; not retrying"
                    );
                    return Err(error);
                }
                ErrorClass::TransientPlacement => {
                    if deadline.has_expired() {
                        return Err(error);
                    }
                    info!(session_id = %self.session_id, error = %error, "Retrying pool selection");
                    continue;
                }
                ErrorClass::Conflict | ErrorClass::Fatal => {
                    if matches!(error, TransferError::NoPoolConfigured(_)) {
                        error!(session_id = %self.session_id, error = %error, "No pool configured");
                    }
                    return Err(error);
                }
                ErrorClass::Permission => {
                    info!(
                        session_id = %self.session_id,
                        error = %error,
                        "Request rejected due to permission settings"
                    );
                    return Err(error);
                }
                ErrorClass::Timeout => {
                    warn!(session_id = %self.session_id, error = %error, "Pool selection timed out");
                }
                ErrorClass::Retryable => match error {
                    TransferError::NoPoolOnline(_) | TransferError::PoolUnavailable(_) => {
                        warn!(session_id = %self.session_id, error = %error, "Pool selection failed");
                    }
                    _ => {
                        error!(session_id = %self.session_id, error = %error, "Pool selection failed");
                    }
                },
            }

            retries_left = retries_left.saturating_sub(1);
            // spacing is measured from the start of the failed attempt
            let sleep = policy
                .retry_period()
                .saturating_sub(attempt_started.elapsed());
            if retries_left == 0 || deadline.remaining() <= sleep {
                return Err(error);
            }

            if !sleep.is_zero() {
                self.set_status(Some(format!("Sleeping ({error})")));
                tokio::time::sleep(sleep).await;
                self.set_status(None);
            }
        }
    }

    async fn attempt(
        &self,
        queue: Option<&str>,
        policy: &RetryPolicy,
        deadline: Deadline,
        refresh: bool,
        got_pool: &mut bool,
    ) -> Result<(), TransferError> {
        if refresh {
            let timeout = deadline.remaining().min(self.services.timeouts.namespace);
            self.read_entry(false, timeout).await?;
        }
        self.select_pool(deadline.remaining()).await?;
        *got_pool = true;
        self.start_mover(
            queue,
            deadline.remaining().min(policy.mover_start_timeout()),
        )
        .await
    }

    /// Wait for the mover to finish.
    ///
    /// Returns whether it finished within `timeout`; a recorded mover
    /// failure is returned as the error.
    pub async fn wait_for_mover(&self, timeout: Duration) -> Result<bool, TransferError> {
        self.wait_until(timeout, || self.inner().mover_finished).await;

        let inner = self.inner();
        match &inner.error {
            Some(e) => Err(e.clone()),
            None => Ok(inner.mover_finished),
        }
    }

    /// Send a kill for the active mover without waiting. Returns whether a
    /// kill was sent.
    pub fn send_kill(&self, explanation: &str) -> bool {
        let Some((pool, mover_id)) = self.active_mover() else {
            return false;
        };
        match self.services.pool.kill_mover(&pool, mover_id, explanation) {
            Ok(()) => {
                info!(
                    session_id = %self.session_id,
                    pool = %pool,
                    mover_id = %mover_id,
                    explanation,
                    "Kill sent to mover"
                );
                true
            }
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    pool = %pool,
                    mover_id = %mover_id,
                    error = %e,
                    "Failed to kill mover"
                );
                false
            }
        }
    }

    /// Kill the mover and wait up to `timeout` for its completion.
    ///
    /// No-op without an active mover. Failures are logged, never returned:
    /// the transfer is already considered failed by the caller.
    pub async fn kill_mover(&self, timeout: Duration, explanation: &str) {
        let Some((pool, mover_id)) = self.active_mover() else {
            return;
        };

        self.set_status(Some(format!("Mover {pool}/{mover_id}: Killing mover")));
        if self.send_kill(explanation) && !timeout.is_zero() {
            match self.wait_for_mover(timeout).await {
                Ok(true) => {}
                Ok(false) => error!(
                    session_id = %self.session_id,
                    "Failed to kill mover {}/{}: Timeout", pool, mover_id
                ),
                // not surprising for a mover that was just killed
                Err(e) => debug!(
                    session_id = %self.session_id,
                    "Killed mover and pool reported: {}", e
                ),
            }
        }
        self.set_status(None);
    }

    /// Liveness probe of the active mover
    pub async fn query_mover_info(&self) -> Result<MoverInfo, TransferError> {
        let (pool, mover_id) = self
            .active_mover()
            .ok_or_else(|| TransferError::IllegalState("transfer has no mover".into()))?;
        let timeout = self.services.timeouts.pool;
        bounded(
            &pool.name,
            timeout,
            self.services.pool.query_mover(&pool, mover_id, timeout),
        )
        .await
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Record that the mover finished.
    ///
    /// Only the first call has an effect: it clears "has mover", stores the
    /// error (if any), wakes waiters and informs the observer.
    pub fn finished(&self, result: Result<(), TransferError>) {
        self.complete(None, result);
    }

    /// Completion message from a pool; also carries final file attributes.
    pub fn finished_with(&self, message: TransferFinished) {
        self.complete(message.attributes, message.result);
    }

    fn complete(&self, attributes: Option<FileAttributes>, result: Result<(), TransferError>) {
        {
            let mut inner = self.inner();
            if inner.mover_finished {
                debug!(session_id = %self.session_id, "Ignoring duplicate completion");
                return;
            }
            if let Some(attributes) = attributes {
                inner.attributes = attributes;
            }
            inner.mover_finished = true;
            if let Err(e) = &result {
                inner.error = Some(e.clone());
            }
        }
        self.changed.send_replace(());

        if let Some(observer) = self.observer.get().and_then(Weak::upgrade) {
            observer.mover_finished(&result);
        }
    }

    /// Send one billing record for this transfer. Later calls are ignored.
    pub fn notify_billing(&self, result: &Result<(), TransferError>) {
        let record = {
            let mut inner = self.inner();
            if inner.billing_notified {
                return;
            }
            inner.billing_notified = true;

            let (result_code, error) = match result {
                Ok(()) => (0, String::new()),
                Err(e) => (e.rc(), e.to_string()),
            };
            BillingRecord {
                session_id: self.session_id,
                path: inner.billing_path(&self.path),
                pnfs_id: inner.attributes.pnfs_id.clone(),
                file_size: inner.attributes.size,
                duration: self.started.elapsed(),
                client_chain: inner
                    .client_addresses
                    .iter()
                    .map(|a| a.ip().to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                result_code,
                error,
            }
        };

        if let Err(e) = self.services.billing.record(record) {
            error!(session_id = %self.session_id, error = %e, "Failed to register transfer in billing");
            self.inner().billing_notified = false;
        }
    }
}

/// Bound a remote call by `timeout`, mapping expiry to `Timeout`.
async fn bounded<T>(
    target: &str,
    timeout: Duration,
    call: impl Future<Output = Result<T, TransferError>>,
) -> Result<T, TransferError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Timeout(format!(
            "no reply from {target} within {timeout:?}"
        ))),
    }
}
