//! Polymorphic update backends
//!
//! Each update target is served by exactly one backend implementing the
//! [`Submodule`] contract. Selection is by [`Submodule::supports`], tried in
//! registry order (processor before sensor); the first match wins. A
//! successful open yields an [`UpdateSession`] that the manager drives
//! through write/erase/post-process/close.

pub mod processor;
pub mod sensor;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{UpdateError, UpdateResult};
use crate::header::SwArchVersion;
use crate::platform::StreamBlockToken;
use crate::staging::StagingMedium;

pub use processor::ProcessorSubmodule;
pub use sensor::SensorSubmodule;

/// An update destination on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// Main processor firmware slot
    ProcessorFirmware,
    /// Main processor bootloader
    ProcessorLoader,
    /// Sensor module loader
    SensorLoader,
    /// Sensor module firmware
    SensorFirmware,
    /// AI model slot on the sensor module
    AiModel(u8),
}

impl Target {
    /// Whether updating this target must block external camera streaming.
    ///
    /// Sensor-family targets share hardware access with the streaming path;
    /// processor-family targets do not.
    pub fn requires_stream_block(self) -> bool {
        matches!(
            self,
            Target::SensorLoader | Target::SensorFirmware | Target::AiModel(_)
        )
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::ProcessorFirmware => write!(f, "processor-firmware"),
            Target::ProcessorLoader => write!(f, "processor-loader"),
            Target::SensorLoader => write!(f, "sensor-loader"),
            Target::SensorFirmware => write!(f, "sensor-firmware"),
            Target::AiModel(slot) => write!(f, "ai-model-{slot}"),
        }
    }
}

/// Per-slot version information returned by `get_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotInfo {
    /// Slot this entry describes.
    pub target: Target,
    /// Installed firmware version, if any.
    pub version: Option<semver::Version>,
    /// SHA-256 of the installed image.
    pub hash: [u8; 32],
    /// When the slot was last updated.
    pub last_update: Option<DateTime<Utc>>,
}

impl SlotInfo {
    /// Empty slot entry for a target that has never been written.
    pub fn empty(target: Target) -> Self {
        Self {
            target,
            version: None,
            hash: [0u8; 32],
            last_update: None,
        }
    }
}

/// Arguments handed to a backend open call.
#[derive(Debug)]
pub struct OpenArgs {
    /// Update destination.
    pub target: Target,
    /// Total bytes the caller declared it will supply (write sessions only).
    pub total_size: Option<u64>,
    /// Size of the staging buffer the core allocated (write sessions only).
    pub staging_size: Option<usize>,
    /// Version the caller attributes to the new image.
    pub version: Option<semver::Version>,
    /// Expected SHA-256 of the full stream, for slot bookkeeping at commit.
    pub expected_hash: [u8; 32],
    /// Placeholder streaming block the core holds, if the target needs one.
    /// A backend that itself requires the shared streaming resource cancels
    /// this and reports the takeover.
    pub stream_block: Option<StreamBlockToken>,
}

/// Result of a backend open call.
pub struct OpenOutcome {
    /// Session driving this update.
    pub session: Box<dyn UpdateSession>,
    /// True when the backend cancelled the core's placeholder stream block
    /// and manages the shared resource itself; the core must not cancel the
    /// placeholder again at close.
    pub stream_block_taken_over: bool,
}

/// Window of the staging buffer to consume, as placed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Byte offset into the staging buffer.
    pub offset: usize,
    /// Number of bytes to consume.
    pub size: usize,
}

/// A backend serving one or more update targets.
pub trait Submodule: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// One-time backend initialization.
    fn init(&self) -> UpdateResult<()>;

    /// Backend teardown; the inverse of [`Submodule::init`].
    fn deinit(&self) -> UpdateResult<()>;

    /// Whether this backend serves `target`.
    fn supports(&self, target: Target) -> bool;

    /// Whether this backend can erase `target` without a write session.
    fn supports_erase(&self, target: Target) -> bool;

    /// Open an update session for `target`.
    fn open(&self, args: OpenArgs) -> UpdateResult<OpenOutcome>;

    /// Fill slot version/hash/last-update info for `target`.
    fn get_info(&self, target: Target) -> UpdateResult<Vec<SlotInfo>>;
}

/// An in-flight update driven by the manager.
///
/// The staging medium handed to [`UpdateSession::write`] is released by the
/// core for the duration of the call; the session accesses it through
/// handle-level reads only.
pub trait UpdateSession: Send {
    /// Consume `[offset, offset + size)` of the staging buffer.
    fn write(&mut self, staging: &dyn StagingMedium, req: &WriteRequest) -> UpdateResult<()>;

    /// Erase the target contents (erase sessions only).
    fn erase(&mut self) -> UpdateResult<()>;

    /// Commit the update (e.g. switch the firmware slot).
    fn post_process(&mut self) -> UpdateResult<()>;

    /// Architecture version parsed from the image's binary header.
    ///
    /// # Errors
    ///
    /// `Unimplemented` for backends without header introspection.
    fn binary_header_info(&self) -> UpdateResult<SwArchVersion> {
        Err(UpdateError::Unimplemented(
            "backend has no binary header introspection".into(),
        ))
    }

    /// Release session resources. `aborted` is true unless the session
    /// reached a successful commit; backends discard partial writes then.
    fn close(&mut self, aborted: bool) -> UpdateResult<()>;
}

/// Immutable, ordered set of backends built at manager init.
pub struct SubmoduleRegistry {
    modules: Vec<Arc<dyn Submodule>>,
}

impl SubmoduleRegistry {
    /// Registry preserving the given backend order for selection.
    pub fn new(modules: Vec<Arc<dyn Submodule>>) -> Self {
        Self { modules }
    }

    /// First backend supporting `target`, in registry order.
    pub fn select(&self, target: Target) -> Option<&Arc<dyn Submodule>> {
        self.modules.iter().find(|m| m.supports(target))
    }

    /// Registered backends in order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Submodule>> {
        self.modules.iter()
    }

    /// Initialize every backend. On failure, already-initialized backends
    /// are deinitialized best-effort (warnings only) and the original error
    /// is reported.
    pub fn init_all(&self) -> UpdateResult<()> {
        for (idx, module) in self.modules.iter().enumerate() {
            if let Err(err) = module.init() {
                for done in self.modules.iter().take(idx) {
                    if let Err(undo_err) = done.deinit() {
                        warn!(
                            submodule = done.name(),
                            error = %undo_err,
                            "deinit during init unwind failed"
                        );
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Deinitialize every backend. The first failure aborts the sequence and
    /// leaves the remaining backends untouched.
    pub fn deinit_all(&self) -> UpdateResult<()> {
        for module in &self.modules {
            module.deinit()?;
        }
        Ok(())
    }
}
