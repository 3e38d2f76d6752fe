//! Platform collaborator interfaces
//!
//! The manager consumes a small set of platform services: the streaming
//! block primitive (a placeholder operation on the shared hardware-access
//! library that keeps other consumers from starting camera streaming during
//! an update), slot control for committing processor images, and the
//! factory-reset notification path. Host implementations back tests and
//! development builds; device builds supply their own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{UpdateError, UpdateResult};
use crate::factory_reset::{HostLifecycleNotifier, HostStatusIndicator};
use crate::factory_reset::{LifecycleNotifier, StatusIndicator};
use crate::staging::{HeapStagingAllocator, StagingAllocator};
use crate::submodule::Target;

/// Token identifying a held streaming block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamBlockToken(u64);

/// Streaming block primitive. The underlying library permits exactly one
/// held token at a time.
pub trait StreamBlocker: Send + Sync {
    /// Begin a placeholder (dummy) update, excluding streaming consumers.
    fn begin_placeholder(&self) -> UpdateResult<StreamBlockToken>;

    /// Cancel a held placeholder, releasing the shared resource.
    fn cancel(&self, token: StreamBlockToken) -> UpdateResult<()>;
}

/// How a processor image was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitKind {
    /// Full partition switch to the freshly written slot
    SlotSwitch,
    /// Switch-free commit; the bootloader picks the slot itself
    InPlace,
}

/// Slot-switch / commit primitive for processor images.
pub trait SlotControl: Send + Sync {
    /// Commit `target` with the given mechanism.
    fn commit(&self, target: Target, kind: CommitKind) -> UpdateResult<()>;
}

/// Bundle of platform services handed to the manager at construction.
#[derive(Clone)]
pub struct Platform {
    /// Large-heap staging allocator.
    pub staging: Arc<dyn StagingAllocator>,
    /// Streaming block primitive.
    pub stream_blocker: Arc<dyn StreamBlocker>,
    /// Processor slot control.
    pub slot_control: Arc<dyn SlotControl>,
    /// Factory-reset message path to the process-lifecycle component.
    pub notifier: Arc<dyn LifecycleNotifier>,
    /// LED/status indication.
    pub status: Arc<dyn StatusIndicator>,
}

impl Platform {
    /// Host platform: heap staging with mapping support, in-process
    /// collaborators. Suitable for tests and development.
    pub fn host() -> Self {
        Self {
            staging: Arc::new(HeapStagingAllocator::default()),
            stream_blocker: Arc::new(HostStreamBlocker::new()),
            slot_control: Arc::new(HostSlotControl::default()),
            notifier: Arc::new(HostLifecycleNotifier::default()),
            status: Arc::new(HostStatusIndicator::default()),
        }
    }

    /// Host platform with a custom staging allocator (e.g. file-backed to
    /// exercise the no-mapping path).
    pub fn host_with_staging(staging: Arc<dyn StagingAllocator>) -> Self {
        Self {
            staging,
            ..Self::host()
        }
    }
}

/// In-process streaming block enforcing the single-token rule.
pub struct HostStreamBlocker {
    next: AtomicU64,
    held: Mutex<Option<u64>>,
}

impl HostStreamBlocker {
    /// Blocker with no token held.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            held: Mutex::new(None),
        }
    }

    /// Whether a block is currently held.
    pub fn is_blocked(&self) -> bool {
        self.held.lock().is_some()
    }
}

impl Default for HostStreamBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBlocker for HostStreamBlocker {
    fn begin_placeholder(&self) -> UpdateResult<StreamBlockToken> {
        let mut held = self.held.lock();
        if held.is_some() {
            return Err(UpdateError::Unavailable(
                "streaming block already held".into(),
            ));
        }
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        *held = Some(id);
        info!(token = id, "streaming blocked for firmware update");
        Ok(StreamBlockToken(id))
    }

    fn cancel(&self, token: StreamBlockToken) -> UpdateResult<()> {
        let mut held = self.held.lock();
        match *held {
            Some(id) if id == token.0 => {
                *held = None;
                info!(token = id, "streaming block released");
                Ok(())
            }
            _ => Err(UpdateError::Internal(
                "cancel of a streaming block that is not held".into(),
            )),
        }
    }
}

/// In-process slot control recording commits for inspection.
#[derive(Default)]
pub struct HostSlotControl {
    commits: Mutex<Vec<(Target, CommitKind)>>,
}

impl HostSlotControl {
    /// Commits recorded so far, in order.
    pub fn commits(&self) -> Vec<(Target, CommitKind)> {
        self.commits.lock().clone()
    }
}

impl SlotControl for HostSlotControl {
    fn commit(&self, target: Target, kind: CommitKind) -> UpdateResult<()> {
        info!(%target, ?kind, "committing processor image");
        self.commits.lock().push((target, kind));
        Ok(())
    }
}
