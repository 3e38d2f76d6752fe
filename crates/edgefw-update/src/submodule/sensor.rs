//! Sensor module update backend
//!
//! Serves the sensor loader, sensor firmware, and AI model slots, for both
//! write and erase sessions. The sensor hardware shares its access path with
//! camera streaming, so this backend needs the streaming block itself: at
//! open it cancels the core's placeholder token (the underlying library
//! permits only one held token) and acquires its own, reporting the takeover
//! so the core does not double-cancel at close.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::platform::{StreamBlockToken, StreamBlocker};
use crate::staging::{SCRATCH_CHUNK_SIZE, StagingMedium};
use crate::submodule::{
    OpenArgs, OpenOutcome, SlotInfo, Submodule, Target, UpdateSession, WriteRequest,
};

/// Backend for sensor-family targets.
pub struct SensorSubmodule {
    stream_blocker: Arc<dyn StreamBlocker>,
    slots: Arc<Mutex<HashMap<Target, SlotInfo>>>,
    initialized: AtomicBool,
}

impl SensorSubmodule {
    /// Backend holding the streaming block through the given primitive.
    pub fn new(stream_blocker: Arc<dyn StreamBlocker>) -> Self {
        Self {
            stream_blocker,
            slots: Arc::new(Mutex::new(HashMap::new())),
            initialized: AtomicBool::new(false),
        }
    }
}

impl Submodule for SensorSubmodule {
    fn name(&self) -> &'static str {
        "sensor"
    }

    fn init(&self) -> UpdateResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(UpdateError::Internal(
                "sensor submodule already initialized".into(),
            ));
        }
        debug!("sensor submodule initialized");
        Ok(())
    }

    fn deinit(&self) -> UpdateResult<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Err(UpdateError::Internal(
                "sensor submodule not initialized".into(),
            ));
        }
        debug!("sensor submodule deinitialized");
        Ok(())
    }

    fn supports(&self, target: Target) -> bool {
        matches!(
            target,
            Target::SensorLoader | Target::SensorFirmware | Target::AiModel(_)
        )
    }

    fn supports_erase(&self, target: Target) -> bool {
        self.supports(target)
    }

    fn open(&self, args: OpenArgs) -> UpdateResult<OpenOutcome> {
        if !self.supports(args.target) {
            return Err(UpdateError::Internal(format!(
                "sensor backend opened for {}",
                args.target
            )));
        }

        // Take over the shared streaming resource from the core.
        let mut own_block = None;
        let mut taken_over = false;
        if let Some(token) = args.stream_block {
            self.stream_blocker.cancel(token)?;
            taken_over = true;
            own_block = Some(self.stream_blocker.begin_placeholder()?);
        }

        info!(
            target = %args.target,
            total_size = args.total_size,
            erase = args.total_size.is_none(),
            "sensor update session opened"
        );
        Ok(OpenOutcome {
            session: Box::new(SensorSession {
                target: args.target,
                is_erase: args.total_size.is_none(),
                buf: Vec::new(),
                erase_requested: false,
                version: args.version,
                expected_hash: args.expected_hash,
                slots: Arc::clone(&self.slots),
                stream_blocker: Arc::clone(&self.stream_blocker),
                own_block,
            }),
            stream_block_taken_over: taken_over,
        })
    }

    fn get_info(&self, target: Target) -> UpdateResult<Vec<SlotInfo>> {
        if !self.supports(target) {
            return Err(UpdateError::Internal(format!("sensor get_info for {target}")));
        }
        let slots = self.slots.lock();
        Ok(vec![
            slots
                .get(&target)
                .cloned()
                .unwrap_or_else(|| SlotInfo::empty(target)),
        ])
    }
}

struct SensorSession {
    target: Target,
    is_erase: bool,
    buf: Vec<u8>,
    erase_requested: bool,
    version: Option<semver::Version>,
    expected_hash: [u8; 32],
    slots: Arc<Mutex<HashMap<Target, SlotInfo>>>,
    stream_blocker: Arc<dyn StreamBlocker>,
    own_block: Option<StreamBlockToken>,
}

impl UpdateSession for SensorSession {
    fn write(&mut self, staging: &dyn StagingMedium, req: &WriteRequest) -> UpdateResult<()> {
        if self.is_erase {
            return Err(UpdateError::FailedPrecondition(
                "write on an erase session".into(),
            ));
        }
        let mut chunk = vec![0u8; req.size.min(SCRATCH_CHUNK_SIZE)];
        let mut pos = req.offset;
        let end = req
            .offset
            .checked_add(req.size)
            .ok_or_else(|| UpdateError::InvalidArgument("write window overflow".into()))?;
        while pos < end {
            let take = (end - pos).min(chunk.len());
            let window = chunk
                .get_mut(..take)
                .ok_or_else(|| UpdateError::Internal("chunk window out of range".into()))?;
            staging.read_at(pos, window)?;
            self.buf.extend_from_slice(window);
            pos += take;
        }
        Ok(())
    }

    fn erase(&mut self) -> UpdateResult<()> {
        if !self.is_erase {
            return Err(UpdateError::FailedPrecondition(
                "erase on a write session".into(),
            ));
        }
        self.erase_requested = true;
        debug!(target = %self.target, "sensor area erase staged");
        Ok(())
    }

    fn post_process(&mut self) -> UpdateResult<()> {
        let mut slots = self.slots.lock();
        if self.is_erase {
            if !self.erase_requested {
                return Err(UpdateError::Internal(
                    "post-process of an erase session without erase".into(),
                ));
            }
            slots.remove(&self.target);
            info!(target = %self.target, "sensor area erased");
        } else {
            slots.insert(
                self.target,
                SlotInfo {
                    target: self.target,
                    version: self.version.clone(),
                    hash: self.expected_hash,
                    last_update: Some(Utc::now()),
                },
            );
            info!(target = %self.target, bytes = self.buf.len(), "sensor image committed");
        }
        Ok(())
    }

    fn close(&mut self, aborted: bool) -> UpdateResult<()> {
        if aborted && !self.buf.is_empty() {
            debug!(
                target = %self.target,
                discarded = self.buf.len(),
                "sensor session aborted; discarding partial image"
            );
            self.buf = Vec::new();
        }
        if let Some(token) = self.own_block.take() {
            if let Err(err) = self.stream_blocker.cancel(token) {
                warn!(error = %err, "releasing sensor streaming block failed");
                return Err(err);
            }
        }
        Ok(())
    }
}
