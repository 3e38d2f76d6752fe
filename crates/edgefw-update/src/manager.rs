//! Firmware manager core
//!
//! A state-machine-driven orchestrator for staged, resumable,
//! integrity-verified firmware updates. The manager owns the global
//! lifecycle state, the single active update context, the staging buffer
//! and the running hash, and drives the selected backend through
//! open/write/post-process/erase/close.
//!
//! # Concurrency
//!
//! Two mutexes guard all shared state. The main-API mutex serializes every
//! lifecycle-changing operation and is only ever *tried*: contention returns
//! [`UpdateError::Busy`] immediately, callers retry. The sub-API mutex
//! serializes [`FirmwareManager::get_info`] against
//! [`FirmwareManager::deinit`] so a read-only query never races a teardown;
//! it is taken blocking, bounded by the brief duration of a query.
//!
//! # Staging hand-off
//!
//! The staging buffer is unmapped/closed strictly before every backend
//! `write` call (ownership of the underlying memory handle transfers
//! transiently to the backend) and re-mapped/re-opened before the running
//! hash reads from it again. This bracketing is the one hard ordering
//! invariant of the write path.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCode, UpdateError, UpdateResult};
use crate::factory_reset::{FactoryResetCause, StatusPattern};
use crate::header::SwArchVersion;
use crate::platform::{Platform, StreamBlockToken};
use crate::staging::StagingBuffer;
use crate::submodule::{
    OpenArgs, ProcessorSubmodule, SensorSubmodule, SlotInfo, Submodule, SubmoduleRegistry, Target,
    UpdateSession, WriteRequest,
};

/// Process-wide lifecycle states of the firmware manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LifecycleState {
    /// Not initialized; only Init is valid
    #[default]
    Uninit,
    /// Initialized, no update in progress
    Idle,
    /// Erase session open
    Erasable,
    /// Write session open
    Writable,
    /// Session finished successfully; awaiting Close
    Done,
    /// Data-path failure; only Close is valid
    Error,
}

/// Opaque handle identifying the active update context.
///
/// Validated by equality against the single active context's token on every
/// call; a stale or forged handle fails precondition checks instead of being
/// dereferenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateHandle(Uuid);

impl UpdateHandle {
    fn issue() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Parameters for opening an update session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Update destination.
    pub target: Target,
    /// Expected SHA-256 over the full firmware stream.
    pub hash: [u8; 32],
    /// Version the caller attributes to the new image.
    pub version: Option<semver::Version>,
    /// Free-form name (e.g. AI model network name).
    pub name: Option<String>,
}

/// Write-prepare parameters; presence selects a write session over erase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PrepareWriteRequest {
    /// Total bytes the caller will supply.
    pub total_size: u64,
    /// Requested staging buffer size.
    pub memory_size: usize,
}

/// Staging geometry granted for a write session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareWriteResponse {
    /// Granted staging buffer size (request clamped to the platform max).
    pub memory_size: usize,
    /// Bytes writable per copy/write round; equals the buffer size.
    pub writable_size: usize,
}

/// Result of a successful open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenResponse {
    /// Handle for all further calls of this session.
    pub handle: UpdateHandle,
    /// Staging geometry, for write sessions.
    pub prepare_write: Option<PrepareWriteResponse>,
}

/// Caller data to place into the staging buffer.
#[derive(Debug)]
pub struct CopyRequest<'a> {
    /// Byte offset into the staging buffer.
    pub offset: usize,
    /// Bytes to copy; the window size is `data.len()`.
    pub data: &'a [u8],
}

/// Slot info query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoRequest {
    /// Target whose slots to describe.
    pub target: Target,
    /// Capacity of the caller's response buffer; responses are truncated to
    /// this many entries.
    pub max_entries: usize,
    /// Free-form name filter (e.g. AI model network name).
    pub name: Option<String>,
}

/// Slot info query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    /// One entry per slot, at most `max_entries`.
    pub entries: Vec<SlotInfo>,
}

/// Binary header introspection result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryHeaderInfoResponse {
    /// Architecture version parsed from the image header, or `Unknown` when
    /// the image has no header (or it is not yet classified).
    pub sw_arch_version: SwArchVersion,
}

/// The active update context. Exactly one exists between a successful open
/// and the matching close.
struct UpdateContext {
    token: UpdateHandle,
    submodule_name: &'static str,
    session: Box<dyn UpdateSession>,
    staging: Option<StagingBuffer>,
    hasher: Option<Sha256>,
    // Finalized digest, kept so a post-process retry after a propagated
    // commit failure re-compares instead of failing on a freed hash context.
    digest: Option<[u8; 32]>,
    expected_hash: [u8; 32],
    total_size: u64,
    remaining: u64,
    stream_block: Option<StreamBlockToken>,
}

#[derive(Default)]
struct CoreState {
    state: LifecycleState,
    registry: Option<Arc<SubmoduleRegistry>>,
    active: Option<UpdateContext>,
}

#[derive(Default)]
struct SubApiState {
    registry: Option<Arc<SubmoduleRegistry>>,
}

/// Firmware update orchestrator. See the module docs for the lifecycle and
/// locking rules.
pub struct FirmwareManager {
    main: Mutex<CoreState>,
    sub: Mutex<SubApiState>,
    platform: Platform,
    submodules: Vec<Arc<dyn Submodule>>,
}

impl FirmwareManager {
    /// Manager with the standard processor + sensor backends.
    pub fn new(platform: Platform) -> Self {
        let submodules: Vec<Arc<dyn Submodule>> = vec![
            Arc::new(ProcessorSubmodule::new(Arc::clone(&platform.slot_control))),
            Arc::new(SensorSubmodule::new(Arc::clone(&platform.stream_blocker))),
        ];
        Self::with_submodules(platform, submodules)
    }

    /// Manager with an explicit backend list, in selection order. Intended
    /// for tests that substitute instrumented backends.
    pub fn with_submodules(platform: Platform, submodules: Vec<Arc<dyn Submodule>>) -> Self {
        Self {
            main: Mutex::new(CoreState::default()),
            sub: Mutex::new(SubApiState::default()),
            platform,
            submodules,
        }
    }

    /// Current lifecycle state. Blocks briefly on the main mutex; intended
    /// for status display and tests, not for the update data path.
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.main.lock().state
    }

    fn lock_main(&self, op: &'static str) -> UpdateResult<parking_lot::MutexGuard<'_, CoreState>> {
        self.main
            .try_lock()
            .ok_or_else(|| Self::fail(op, UpdateError::Busy))
    }

    fn expect_state(core: &CoreState, op: &'static str, allowed: &[LifecycleState]) -> UpdateResult {
        if allowed.contains(&core.state) {
            Ok(())
        } else {
            Err(Self::fail(
                op,
                UpdateError::FailedPrecondition(format!(
                    "{op} not allowed in state {:?}",
                    core.state
                )),
            ))
        }
    }

    fn expect_handle(core: &CoreState, op: &'static str, handle: UpdateHandle) -> UpdateResult {
        match core.active {
            Some(ref ctx) if ctx.token == handle => Ok(()),
            _ => Err(Self::fail(
                op,
                UpdateError::FailedPrecondition(
                    "handle does not identify the active update context".into(),
                ),
            )),
        }
    }

    /// Emit the structured log entry paired with an error return, at the
    /// severity the error's taxonomy assigns.
    fn fail(op: &'static str, err: UpdateError) -> UpdateError {
        let level = err.severity();
        if level == tracing::Level::DEBUG {
            debug!(op, error = %err, "operation failed");
        } else if level == tracing::Level::WARN {
            warn!(op, error = %err, "operation failed");
        } else {
            error!(op, error = %err, "operation failed");
        }
        err
    }

    /// Initialize the manager: build the backend registry, initialize every
    /// backend, and enter Idle.
    ///
    /// # Errors
    ///
    /// `Busy` on main-mutex contention, `FailedPrecondition` outside Uninit,
    /// or the first backend init failure (already-initialized backends are
    /// unwound best-effort).
    pub fn init(&self) -> UpdateResult<()> {
        let mut core = self.lock_main("init")?;
        Self::expect_state(&core, "init", &[LifecycleState::Uninit])?;

        let registry = Arc::new(SubmoduleRegistry::new(self.submodules.clone()));
        registry.init_all().map_err(|err| {
            error!(error = %err, "submodule init failed");
            err
        })?;

        core.registry = Some(Arc::clone(&registry));
        self.sub.lock().registry = Some(registry);
        core.state = LifecycleState::Idle;
        info!("firmware manager initialized");
        Ok(())
    }

    /// Tear the manager down from Idle back to Uninit.
    ///
    /// Takes the sub-API mutex for the duration to exclude concurrent
    /// `get_info` queries. A backend deinit failure aborts the sequence and
    /// leaves the manager initialized.
    ///
    /// # Errors
    ///
    /// `Busy`, `FailedPrecondition` outside Idle, or the failing backend's
    /// error.
    pub fn deinit(&self) -> UpdateResult<()> {
        let mut core = self.lock_main("deinit")?;
        Self::expect_state(&core, "deinit", &[LifecycleState::Idle])?;
        let mut sub = self.sub.lock();

        let registry = core
            .registry
            .clone()
            .ok_or_else(|| UpdateError::Internal("initialized manager without registry".into()))?;
        registry.deinit_all().map_err(|err| {
            error!(error = %err, "submodule deinit failed; manager left initialized");
            err
        })?;

        core.registry = None;
        sub.registry = None;
        core.state = LifecycleState::Uninit;
        info!("firmware manager deinitialized");
        Ok(())
    }

    /// Open a write session (when `prepare_write` is given) or an erase
    /// session for `request.target`.
    ///
    /// On any failure after partial setup the acquired resources (staging
    /// buffer, hash context, streaming block) are released and the state
    /// stays Idle.
    ///
    /// # Errors
    ///
    /// `Busy`, `FailedPrecondition` outside Idle, `InvalidArgument` for
    /// zero sizes, `Unimplemented` when no backend serves the target (or
    /// erase is unsupported), plus allocation/collaborator failures.
    pub fn open(
        &self,
        request: &OpenRequest,
        prepare_write: Option<&PrepareWriteRequest>,
    ) -> UpdateResult<OpenResponse> {
        if let Some(pw) = prepare_write {
            if pw.total_size == 0 || pw.memory_size == 0 {
                return Err(UpdateError::InvalidArgument(
                    "write-prepare sizes must be non-zero".into(),
                ));
            }
        }

        let mut core = self.lock_main("open")?;
        Self::expect_state(&core, "open", &[LifecycleState::Idle])?;
        if core.active.is_some() {
            error!("idle manager holds an active update context");
            return Err(UpdateError::Internal(
                "update context already active".into(),
            ));
        }
        let registry = core
            .registry
            .clone()
            .ok_or_else(|| UpdateError::Internal("initialized manager without registry".into()))?;
        let submodule = Arc::clone(registry.select(request.target).ok_or_else(|| {
            Self::fail(
                "open",
                UpdateError::Unimplemented(format!(
                    "no backend supports target {}",
                    request.target
                )),
            )
        })?);

        let mut stream_block: Option<StreamBlockToken> = None;
        let built = self.open_inner(
            &*submodule,
            request,
            prepare_write,
            &mut stream_block,
        );
        let (staging, hasher, prepare_response, outcome) = match built {
            Ok(parts) => parts,
            Err(err) => {
                // Unwind: the staging buffer and hash context are dropped by
                // open_inner; only the streaming block outlives it.
                if let Some(token) = stream_block.take() {
                    if let Err(undo_err) = self.platform.stream_blocker.cancel(token) {
                        warn!(error = %undo_err, "stream block release during open unwind failed");
                    }
                }
                return Err(Self::fail("open", err));
            }
        };

        if outcome.stream_block_taken_over {
            stream_block = None;
        }

        let token = UpdateHandle::issue();
        let total_size = prepare_write.map_or(0, |pw| pw.total_size);
        core.active = Some(UpdateContext {
            token,
            submodule_name: submodule.name(),
            session: outcome.session,
            staging,
            hasher,
            digest: None,
            expected_hash: request.hash,
            total_size,
            remaining: total_size,
            stream_block,
        });
        core.state = if prepare_write.is_some() {
            LifecycleState::Writable
        } else {
            LifecycleState::Erasable
        };
        info!(
            target = %request.target,
            submodule = submodule.name(),
            session = ?core.state,
            name = request.name.as_deref().unwrap_or(""),
            "update session opened"
        );
        Ok(OpenResponse {
            handle: token,
            prepare_write: prepare_response,
        })
    }

    #[allow(clippy::type_complexity)]
    fn open_inner(
        &self,
        submodule: &dyn Submodule,
        request: &OpenRequest,
        prepare_write: Option<&PrepareWriteRequest>,
        stream_block: &mut Option<StreamBlockToken>,
    ) -> UpdateResult<(
        Option<StagingBuffer>,
        Option<Sha256>,
        Option<PrepareWriteResponse>,
        crate::submodule::OpenOutcome,
    )> {
        if request.target.requires_stream_block() {
            *stream_block = Some(self.platform.stream_blocker.begin_placeholder()?);
        }

        let mut staging = None;
        let mut hasher = None;
        let mut prepare_response = None;
        if let Some(pw) = prepare_write {
            let size = pw.memory_size.min(self.platform.staging.max_staging_size());
            let medium = self.platform.staging.allocate(size)?;
            let mut buffer = StagingBuffer::new(medium);
            buffer.acquire()?;
            debug!(
                size,
                mapped = buffer.is_mapped(),
                mapping = buffer.medium().supports_mapping(),
                "staging buffer allocated"
            );
            staging = Some(buffer);
            hasher = Some(Sha256::new());
            prepare_response = Some(PrepareWriteResponse {
                memory_size: size,
                writable_size: size,
            });
        } else if !submodule.supports_erase(request.target) {
            return Err(UpdateError::Unimplemented(format!(
                "target {} does not support erase",
                request.target
            )));
        }

        let outcome = submodule.open(OpenArgs {
            target: request.target,
            total_size: prepare_write.map(|pw| pw.total_size),
            staging_size: staging.as_ref().map(StagingBuffer::size),
            version: request.version.clone(),
            expected_hash: request.hash,
            stream_block: *stream_block,
        })?;

        Ok((staging, hasher, prepare_response, outcome))
    }

    /// Close the session, releasing every resource regardless of prior
    /// failures (first error remembered and returned). Always returns the
    /// manager to Idle and always clears the active context.
    ///
    /// # Errors
    ///
    /// `Busy`, `FailedPrecondition` for a wrong state or handle, `Internal`
    /// when staging release failed, or the backend's close error. Resource
    /// release still completes in all cases.
    pub fn close(&self, handle: UpdateHandle) -> UpdateResult<()> {
        let mut core = self.lock_main("close")?;
        Self::expect_state(
            &core,
            "close",
            &[
                LifecycleState::Done,
                LifecycleState::Writable,
                LifecycleState::Erasable,
                LifecycleState::Error,
            ],
        )?;
        Self::expect_handle(&core, "close", handle)?;

        let prior_state = core.state;
        let mut ctx = core
            .active
            .take()
            .ok_or_else(|| UpdateError::Internal("validated handle without context".into()))?;
        let mut first_err: Option<UpdateError> = None;

        // Free the hash context; idempotent when post-process already did.
        ctx.hasher = None;

        if let Some(mut staging) = ctx.staging.take() {
            if staging.is_mapped() {
                if let Err(err) = staging.release() {
                    warn!(error = %err, "staging release during close failed");
                    first_err.get_or_insert(UpdateError::Internal(format!(
                        "staging release during close: {err}"
                    )));
                }
            }
        }

        let aborted = prior_state != LifecycleState::Done;
        if let Err(err) = ctx.session.close(aborted) {
            warn!(submodule = ctx.submodule_name, error = %err, "submodule close failed");
            first_err.get_or_insert(err);
        }

        if let Some(token) = ctx.stream_block.take() {
            if let Err(err) = self.platform.stream_blocker.cancel(token) {
                warn!(error = %err, "stream block release during close failed");
                first_err.get_or_insert(err);
            }
        }

        core.state = LifecycleState::Idle;
        info!(
            aborted,
            submodule = ctx.submodule_name,
            total_size = ctx.total_size,
            "update session closed"
        );
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Copy caller data into the staging buffer.
    ///
    /// # Errors
    ///
    /// `Busy`, `FailedPrecondition` outside Writable, `InvalidArgument` for
    /// an out-of-range window; a copy failure is returned as `Aborted` and
    /// forces the Error state.
    pub fn copy_to_internal_buffer(
        &self,
        handle: UpdateHandle,
        request: &CopyRequest<'_>,
    ) -> UpdateResult<()> {
        let mut core = self.lock_main("copy_to_internal_buffer")?;
        Self::expect_state(&core, "copy_to_internal_buffer", &[LifecycleState::Writable])?;
        Self::expect_handle(&core, "copy_to_internal_buffer", handle)?;

        let copy_result = {
            let ctx = core
                .active
                .as_mut()
                .ok_or_else(|| UpdateError::Internal("validated handle without context".into()))?;
            let staging = ctx
                .staging
                .as_mut()
                .ok_or_else(|| UpdateError::Internal("write session without staging".into()))?;
            Self::check_window(request.offset, request.data.len(), staging.size())?;
            staging.copy_in(request.offset, request.data)
        };

        if let Err(err) = copy_result {
            error!(error = %err, "copy into staging buffer failed");
            core.state = LifecycleState::Error;
            return Err(UpdateError::aborted(err));
        }
        Ok(())
    }

    fn check_window(offset: usize, size: usize, buffer_size: usize) -> UpdateResult<()> {
        if size == 0 {
            return Err(UpdateError::InvalidArgument("window size must be non-zero".into()));
        }
        let end = offset
            .checked_add(size)
            .ok_or_else(|| UpdateError::InvalidArgument("window offset overflow".into()))?;
        if end > buffer_size {
            return Err(UpdateError::InvalidArgument(format!(
                "window [{offset}, {end}) exceeds staging buffer size {buffer_size}"
            )));
        }
        Ok(())
    }

    /// Hand `[offset, offset + size)` of the staging buffer to the backend,
    /// then feed the same window into the running hash.
    ///
    /// The staging buffer is released for exactly the duration of the
    /// backend call and re-acquired before hashing.
    ///
    /// # Errors
    ///
    /// `Busy`, `FailedPrecondition`, `InvalidArgument` for a bad window; a
    /// backend write failure propagates without forcing Error, while a
    /// hand-off or hashing failure is returned as `Aborted` and forces the
    /// Error state.
    pub fn write(&self, handle: UpdateHandle, request: &WriteRequest) -> UpdateResult<()> {
        let mut core = self.lock_main("write")?;
        Self::expect_state(&core, "write", &[LifecycleState::Writable])?;
        Self::expect_handle(&core, "write", handle)?;

        let outcome = {
            let ctx = core
                .active
                .as_mut()
                .ok_or_else(|| UpdateError::Internal("validated handle without context".into()))?;
            Self::write_inner(ctx, request)
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(WriteFailure::Abort(err)) => {
                error!(error = %err, "write data path failed");
                core.state = LifecycleState::Error;
                Err(UpdateError::aborted(err))
            }
            Err(WriteFailure::Propagate(err)) => {
                warn!(error = %err, "write did not complete");
                Err(err)
            }
        }
    }

    fn write_inner(ctx: &mut UpdateContext, request: &WriteRequest) -> Result<(), WriteFailure> {
        let UpdateContext {
            session,
            staging,
            hasher,
            remaining,
            ..
        } = ctx;
        let staging = staging
            .as_mut()
            .ok_or_else(|| {
                WriteFailure::Propagate(UpdateError::Internal(
                    "write session without staging".into(),
                ))
            })?;
        let hasher = hasher.as_mut().ok_or_else(|| {
            WriteFailure::Propagate(UpdateError::Internal("hash context already freed".into()))
        })?;
        Self::check_window(request.offset, request.size, staging.size())
            .map_err(WriteFailure::Propagate)?;

        // Hand-off: release the core's view for the duration of the backend
        // write, re-acquire before hashing.
        staging.release().map_err(WriteFailure::Abort)?;
        if let Err(err) = session.write(staging.medium(), request) {
            if let Err(reacquire_err) = staging.acquire() {
                warn!(error = %reacquire_err, "staging re-acquire after backend failure failed");
            }
            return Err(WriteFailure::Propagate(err));
        }
        staging.acquire().map_err(WriteFailure::Abort)?;

        staging
            .hash_window(request.offset, request.size, hasher)
            .map_err(WriteFailure::Abort)?;
        *remaining = remaining.saturating_sub(request.size as u64);
        Ok(())
    }

    /// Finalize and verify the stream hash, then ask the backend to commit.
    ///
    /// # Errors
    ///
    /// `Busy`, `FailedPrecondition` outside Writable; a hash mismatch is
    /// returned as `Aborted` (InvalidData cause) and forces the Error
    /// state; a backend commit failure propagates, forcing Error only when
    /// the backend itself reports an abort.
    pub fn post_process(&self, handle: UpdateHandle) -> UpdateResult<()> {
        let mut core = self.lock_main("post_process")?;
        Self::expect_state(&core, "post_process", &[LifecycleState::Writable])?;
        Self::expect_handle(&core, "post_process", handle)?;

        let (digest, expected, remaining) = {
            let ctx = core
                .active
                .as_mut()
                .ok_or_else(|| UpdateError::Internal("validated handle without context".into()))?;
            let digest = match ctx.digest {
                Some(digest) => digest,
                None => {
                    let hasher = ctx.hasher.take().ok_or_else(|| {
                        UpdateError::Internal("hash context already finalized".into())
                    })?;
                    let digest: [u8; 32] = hasher.finalize().into();
                    ctx.digest = Some(digest);
                    digest
                }
            };
            (digest, ctx.expected_hash, ctx.remaining)
        };

        if digest != expected {
            error!(
                computed = %hex::encode(digest),
                expected = %hex::encode(expected),
                "firmware image hash mismatch"
            );
            core.state = LifecycleState::Error;
            return Err(UpdateError::aborted(UpdateError::InvalidData(
                "firmware image hash mismatch".into(),
            )));
        }
        if remaining != 0 {
            // Not enforced; see the disabled size-remaining check note in
            // DESIGN.md.
            warn!(remaining, "declared bytes not fully written before post-process");
        }

        let commit = {
            let ctx = core
                .active
                .as_mut()
                .ok_or_else(|| UpdateError::Internal("validated handle without context".into()))?;
            ctx.session.post_process()
        };
        match commit {
            Ok(()) => {
                core.state = LifecycleState::Done;
                info!("update committed");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "submodule post-process failed");
                if err.code() == ErrorCode::Aborted {
                    core.state = LifecycleState::Error;
                }
                Err(err)
            }
        }
    }

    /// Erase the target contents, then commit.
    ///
    /// # Errors
    ///
    /// `Busy`, `FailedPrecondition` outside Erasable; a backend erase
    /// failure propagates without forcing Error, while a commit failure is
    /// returned as `Aborted` and forces the Error state.
    pub fn erase(&self, handle: UpdateHandle) -> UpdateResult<()> {
        let mut core = self.lock_main("erase")?;
        Self::expect_state(&core, "erase", &[LifecycleState::Erasable])?;
        Self::expect_handle(&core, "erase", handle)?;

        let erase_result = {
            let ctx = core
                .active
                .as_mut()
                .ok_or_else(|| UpdateError::Internal("validated handle without context".into()))?;
            ctx.session.erase()
        };
        if let Err(err) = erase_result {
            warn!(error = %err, "submodule erase failed");
            return Err(err);
        }

        let commit = {
            let ctx = core
                .active
                .as_mut()
                .ok_or_else(|| UpdateError::Internal("validated handle without context".into()))?;
            ctx.session.post_process()
        };
        match commit {
            Ok(()) => {
                core.state = LifecycleState::Done;
                info!("erase committed");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "post-process after erase failed");
                core.state = LifecycleState::Error;
                Err(UpdateError::aborted(err))
            }
        }
    }

    /// Architecture version parsed from the image's binary header.
    ///
    /// Available in any state while a session is open.
    ///
    /// # Errors
    ///
    /// `Busy`, `FailedPrecondition` for a bad handle, `Unimplemented` when
    /// the backend has no header introspection.
    pub fn get_binary_header_info(
        &self,
        handle: UpdateHandle,
    ) -> UpdateResult<BinaryHeaderInfoResponse> {
        let mut core = self.lock_main("get_binary_header_info")?;
        Self::expect_handle(&core, "get_binary_header_info", handle)?;
        let ctx = core
            .active
            .as_mut()
            .ok_or_else(|| UpdateError::Internal("validated handle without context".into()))?;
        let sw_arch_version = ctx
            .session
            .binary_header_info()
            .map_err(|err| Self::fail("get_binary_header_info", err))?;
        Ok(BinaryHeaderInfoResponse { sw_arch_version })
    }

    /// Slot version/hash/last-update info for a target.
    ///
    /// Read-only; takes only the sub-API mutex (blocking), so it cannot be
    /// starved by a long main-API operation but never races `deinit`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero-capacity query, `FailedPrecondition`
    /// before init, `Unimplemented` for an unserved target.
    pub fn get_info(&self, request: &InfoRequest) -> UpdateResult<InfoResponse> {
        if request.max_entries == 0 {
            return Err(Self::fail(
                "get_info",
                UpdateError::InvalidArgument("max_entries must be non-zero".into()),
            ));
        }
        let sub = self.sub.lock();
        let registry = sub.registry.as_ref().ok_or_else(|| {
            Self::fail(
                "get_info",
                UpdateError::FailedPrecondition("manager not initialized".into()),
            )
        })?;
        let submodule = registry.select(request.target).ok_or_else(|| {
            Self::fail(
                "get_info",
                UpdateError::Unimplemented(format!(
                    "no backend supports target {}",
                    request.target
                )),
            )
        })?;
        let mut entries = submodule.get_info(request.target)?;
        entries.truncate(request.max_entries);
        Ok(InfoResponse { entries })
    }

    /// Request a factory reset. Valid only while Idle; the reset itself is
    /// carried out by the process-lifecycle component.
    ///
    /// # Errors
    ///
    /// `Busy`, `FailedPrecondition` outside Idle, or the notifier's error.
    pub fn start_factory_reset(&self, cause: FactoryResetCause) -> UpdateResult<()> {
        let core = self.lock_main("start_factory_reset")?;
        Self::expect_state(&core, "start_factory_reset", &[LifecycleState::Idle])?;
        self.platform.notifier.request_factory_reset(cause)?;
        self.platform.status.set_pattern(StatusPattern::FactoryReset);
        info!(?cause, "factory reset initiated");
        Ok(())
    }
}

enum WriteFailure {
    /// Forces the Error state; returned as `Aborted`.
    Abort(UpdateError),
    /// Propagates as-is; the session may continue.
    Propagate(UpdateError),
}
