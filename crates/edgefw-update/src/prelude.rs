//! Convenience re-exports for common firmware update types

pub use crate::error::{ErrorCode, UpdateError, UpdateResult};
pub use crate::factory_reset::{FactoryResetCause, StatusPattern};
pub use crate::header::{BinaryHeaderInfo, BinaryHeaderParser, SwArchVersion};
pub use crate::manager::{
    BinaryHeaderInfoResponse, CopyRequest, FirmwareManager, InfoRequest, InfoResponse,
    LifecycleState, OpenRequest, OpenResponse, PrepareWriteRequest, PrepareWriteResponse,
    UpdateHandle,
};
pub use crate::platform::{CommitKind, Platform, SlotControl, StreamBlockToken, StreamBlocker};
pub use crate::staging::{StagingAllocator, StagingBuffer, StagingMedium};
pub use crate::submodule::{
    OpenArgs, OpenOutcome, SlotInfo, Submodule, SubmoduleRegistry, Target, UpdateSession,
    WriteRequest,
};
