//! Firmware update management for EdgeFW camera devices
//!
//! This crate provides staged, resumable, integrity-verified firmware
//! updates for a memory-constrained embedded camera platform:
//! - A global lifecycle state machine with a single active update session
//! - A large-heap staging buffer with an explicit hand-off discipline
//!   between the core and the device backends
//! - Chunk-boundary-independent binary header parsing with a self-hashed
//!   64-byte header
//! - SHA-256 verification of the full firmware stream before commit
//! - Heterogeneous update targets (processor firmware/loader, sensor
//!   loader/firmware, AI model slots) behind a common backend trait
//! - A factory-reset side channel for recovery paths
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`manager`]: Core firmware manager and lifecycle state machine
//! - [`staging`]: Staging buffer media, allocators and hashing
//! - [`header`]: Binary header format and incremental parser
//! - [`submodule`]: Update backend trait and the device backends
//! - [`platform`]: Platform collaborator interfaces and host implementations
//! - [`factory_reset`]: Factory-reset request path and status indication
//! - [`error`]: Error types
//!
//! # Safety
//!
//! The sensor hardware shares its access path with camera streaming. While
//! a sensor-family update session is open, streaming is excluded through a
//! blocking token; the manager and the sensor backend coordinate ownership
//! of that token so it is held for exactly the lifetime of the session.
//!
//! # Example
//!
//! ```ignore
//! use edgefw_update::prelude::*;
//!
//! let manager = FirmwareManager::new(Platform::host());
//! manager.init()?;
//!
//! let request = OpenRequest {
//!     target: Target::ProcessorFirmware,
//!     hash: expected_sha256,
//!     version: Some(semver::Version::new(2, 1, 0)),
//!     name: None,
//! };
//! let prepare = PrepareWriteRequest {
//!     total_size: image.len() as u64,
//!     memory_size: 512 * 1024,
//! };
//! let opened = manager.open(&request, Some(&prepare))?;
//!
//! for (offset, chunk) in chunks(&image) {
//!     manager.copy_to_internal_buffer(opened.handle, &CopyRequest { offset, data: chunk })?;
//!     manager.write(opened.handle, &WriteRequest { offset, size: chunk.len() })?;
//! }
//!
//! manager.post_process(opened.handle)?;
//! manager.close(opened.handle)?;
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod factory_reset;
pub mod header;
pub mod manager;
pub mod platform;
pub mod prelude;
pub mod staging;
pub mod submodule;

pub use error::{ErrorCode, UpdateError, UpdateResult};
pub use factory_reset::{
    FactoryResetCause, LifecycleNotifier, StatusIndicator, StatusPattern,
};
pub use header::{
    BINARY_HEADER_MAGIC, BINARY_HEADER_SIZE, BinaryHeaderInfo, BinaryHeaderParser, FeedOutcome,
    SwArchVersion,
};
pub use manager::{
    BinaryHeaderInfoResponse, CopyRequest, FirmwareManager, InfoRequest, InfoResponse,
    LifecycleState, OpenRequest, OpenResponse, PrepareWriteRequest, PrepareWriteResponse,
    UpdateHandle,
};
pub use platform::{CommitKind, Platform, SlotControl, StreamBlockToken, StreamBlocker};
pub use staging::{
    SCRATCH_CHUNK_SIZE, StagingAllocator, StagingBuffer, StagingMedium,
};
pub use submodule::{
    OpenArgs, OpenOutcome, SlotInfo, Submodule, SubmoduleRegistry, Target, UpdateSession,
    WriteRequest,
};
