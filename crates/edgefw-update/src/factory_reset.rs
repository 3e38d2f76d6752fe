//! Factory-reset side channel
//!
//! Triggered by the manager on specific causes while idle. The reset itself
//! is carried out by a separate process-lifecycle component; this module only
//! posts the request and updates the status indication.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::UpdateResult;

/// Why a factory reset was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactoryResetCause {
    /// Explicit user request (e.g. button sequence)
    UserRequest,
    /// Persistent configuration failed integrity checks
    CorruptedConfiguration,
    /// An update left the device in an unrecoverable state
    UpdateFailure,
}

/// Message path to the process-lifecycle component.
pub trait LifecycleNotifier: Send + Sync {
    /// Post a factory-reset request with its cause.
    fn request_factory_reset(&self, cause: FactoryResetCause) -> UpdateResult<()>;
}

/// Status indication patterns shown on the device LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusPattern {
    /// Normal operation
    Idle,
    /// Firmware update in progress
    Updating,
    /// Factory reset pending
    FactoryReset,
    /// Unrecoverable fault
    Fault,
}

/// LED/status indicator.
pub trait StatusIndicator: Send + Sync {
    /// Switch the indicated pattern.
    fn set_pattern(&self, pattern: StatusPattern);
}

/// Host notifier that records posted requests.
#[derive(Default)]
pub struct HostLifecycleNotifier {
    requests: Mutex<Vec<FactoryResetCause>>,
}

impl HostLifecycleNotifier {
    /// Factory-reset requests posted so far.
    pub fn requests(&self) -> Vec<FactoryResetCause> {
        self.requests.lock().clone()
    }
}

impl LifecycleNotifier for HostLifecycleNotifier {
    fn request_factory_reset(&self, cause: FactoryResetCause) -> UpdateResult<()> {
        info!(?cause, "factory reset requested");
        self.requests.lock().push(cause);
        Ok(())
    }
}

/// Host indicator remembering the last shown pattern.
pub struct HostStatusIndicator {
    pattern: Mutex<StatusPattern>,
}

impl Default for HostStatusIndicator {
    fn default() -> Self {
        Self {
            pattern: Mutex::new(StatusPattern::Idle),
        }
    }
}

impl HostStatusIndicator {
    /// Currently indicated pattern.
    pub fn pattern(&self) -> StatusPattern {
        *self.pattern.lock()
    }
}

impl StatusIndicator for HostStatusIndicator {
    fn set_pattern(&self, pattern: StatusPattern) {
        *self.pattern.lock() = pattern;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_records_causes() -> anyhow::Result<()> {
        let notifier = HostLifecycleNotifier::default();
        notifier.request_factory_reset(FactoryResetCause::UserRequest)?;
        notifier.request_factory_reset(FactoryResetCause::UpdateFailure)?;
        assert_eq!(
            notifier.requests(),
            vec![
                FactoryResetCause::UserRequest,
                FactoryResetCause::UpdateFailure
            ]
        );
        Ok(())
    }

    #[test]
    fn indicator_tracks_last_pattern() {
        let indicator = HostStatusIndicator::default();
        assert_eq!(indicator.pattern(), StatusPattern::Idle);
        indicator.set_pattern(StatusPattern::FactoryReset);
        assert_eq!(indicator.pattern(), StatusPattern::FactoryReset);
    }
}
