//! Processor update backend
//!
//! Serves the main processor firmware and loader targets. Processor images
//! may open with a binary header; header bytes are stripped from the stream
//! before programming, and the parsed architecture version decides the
//! commit mechanism (full slot switch vs. switch-free).
//!
//! This backend is write-only: erase sessions are rejected at open.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{UpdateError, UpdateResult};
use crate::header::{BinaryHeaderParser, FeedOutcome, SwArchVersion};
use crate::platform::{CommitKind, SlotControl};
use crate::staging::{SCRATCH_CHUNK_SIZE, StagingMedium};
use crate::submodule::{
    OpenArgs, OpenOutcome, SlotInfo, Submodule, Target, UpdateSession, WriteRequest,
};

/// Backend for processor-family targets.
pub struct ProcessorSubmodule {
    slot_control: Arc<dyn SlotControl>,
    slots: Arc<Mutex<HashMap<Target, SlotInfo>>>,
    initialized: AtomicBool,
}

impl ProcessorSubmodule {
    /// Backend committing through the given slot control.
    pub fn new(slot_control: Arc<dyn SlotControl>) -> Self {
        Self {
            slot_control,
            slots: Arc::new(Mutex::new(HashMap::new())),
            initialized: AtomicBool::new(false),
        }
    }
}

impl Submodule for ProcessorSubmodule {
    fn name(&self) -> &'static str {
        "processor"
    }

    fn init(&self) -> UpdateResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(UpdateError::Internal(
                "processor submodule already initialized".into(),
            ));
        }
        debug!("processor submodule initialized");
        Ok(())
    }

    fn deinit(&self) -> UpdateResult<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Err(UpdateError::Internal(
                "processor submodule not initialized".into(),
            ));
        }
        debug!("processor submodule deinitialized");
        Ok(())
    }

    fn supports(&self, target: Target) -> bool {
        matches!(target, Target::ProcessorFirmware | Target::ProcessorLoader)
    }

    fn supports_erase(&self, _target: Target) -> bool {
        false
    }

    fn open(&self, args: OpenArgs) -> UpdateResult<OpenOutcome> {
        let total_size = args.total_size.ok_or_else(|| {
            UpdateError::InvalidArgument(
                "processor backend requires a write-prepare request".into(),
            )
        })?;
        if !self.supports(args.target) {
            return Err(UpdateError::Internal(format!(
                "processor backend opened for {}",
                args.target
            )));
        }
        info!(target = %args.target, total_size, "processor update session opened");
        Ok(OpenOutcome {
            session: Box::new(ProcessorSession {
                target: args.target,
                total_size,
                parser: BinaryHeaderParser::new(),
                image: Vec::new(),
                version: args.version,
                expected_hash: args.expected_hash,
                slot_control: Arc::clone(&self.slot_control),
                slots: Arc::clone(&self.slots),
                committed: false,
            }),
            stream_block_taken_over: false,
        })
    }

    fn get_info(&self, target: Target) -> UpdateResult<Vec<SlotInfo>> {
        if !self.supports(target) {
            return Err(UpdateError::Internal(format!(
                "processor get_info for {target}"
            )));
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

struct ProcessorSession {
    target: Target,
    total_size: u64,
    parser: BinaryHeaderParser,
    image: Vec<u8>,
    version: Option<semver::Version>,
    expected_hash: [u8; 32],
    slot_control: Arc<dyn SlotControl>,
    slots: Arc<Mutex<HashMap<Target, SlotInfo>>>,
    committed: bool,
}

impl ProcessorSession {
    /// Route stream bytes: header candidates disappear into the parser,
    /// everything else is programmed.
    fn consume(&mut self, bytes: &[u8]) -> UpdateResult<()> {
        if self.parser.is_completed() {
            self.image.extend_from_slice(bytes);
            return Ok(());
        }
        match self.parser.feed(bytes)? {
            FeedOutcome::Pending => Ok(()),
            FeedOutcome::Completed { consumed, replay } => {
                self.image.extend_from_slice(&replay);
                if let Some(rest) = bytes.get(consumed..) {
                    self.image.extend_from_slice(rest);
                }
                Ok(())
            }
        }
    }
}

impl UpdateSession for ProcessorSession {
    fn write(&mut self, staging: &dyn StagingMedium, req: &WriteRequest) -> UpdateResult<()> {
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
            self.consume(window)?;
            pos += take;
        }
        Ok(())
    }

    fn erase(&mut self) -> UpdateResult<()> {
        Err(UpdateError::Unimplemented(
            "processor backend does not support erase".into(),
        ))
    }

    fn post_process(&mut self) -> UpdateResult<()> {
        if !self.parser.is_completed() {
            // Not enough stream bytes arrived to classify the first bytes as
            // header or payload; the session cannot be committed.
            return Err(UpdateError::aborted(UpdateError::InvalidData(
                "stream ended before header classification".into(),
            )));
        }
        let header_size = self.parser.info().map_or(0, |i| i.header_size);
        let expected_payload = self.total_size.saturating_sub(header_size as u64);
        if self.image.len() as u64 != expected_payload {
            warn!(
                declared = expected_payload,
                programmed = self.image.len(),
                "programmed size differs from declared size"
            );
        }

        let arch = self
            .parser
            .info()
            .map_or(SwArchVersion::Unknown, |i| i.sw_arch_version);
        let kind = match arch {
            SwArchVersion::V2 => CommitKind::InPlace,
            SwArchVersion::V1 | SwArchVersion::Unknown => CommitKind::SlotSwitch,
        };
        self.slot_control.commit(self.target, kind)?;

        self.slots.lock().insert(
            self.target,
            SlotInfo {
                target: self.target,
                version: self.version.clone(),
                hash: self.expected_hash,
                last_update: Some(Utc::now()),
            },
        );
        self.committed = true;
        info!(target = %self.target, ?kind, bytes = self.image.len(), "processor image committed");
        Ok(())
    }

    fn binary_header_info(&self) -> UpdateResult<SwArchVersion> {
        Ok(self
            .parser
            .info()
            .map_or(SwArchVersion::Unknown, |i| i.sw_arch_version))
    }

    fn close(&mut self, aborted: bool) -> UpdateResult<()> {
        if aborted {
            debug!(
                target = %self.target,
                discarded = self.image.len(),
                "processor session aborted; discarding partial image"
            );
            self.image = Vec::new();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{BINARY_HEADER_SIZE, build_header};
    use crate::platform::HostSlotControl;
    use crate::staging::HeapMedium;

    fn open_session(
        control: &Arc<HostSlotControl>,
        total_size: u64,
    ) -> UpdateResult<Box<dyn UpdateSession>> {
        let module = ProcessorSubmodule::new(Arc::clone(control) as Arc<dyn SlotControl>);
        module.init()?;
        let outcome = module.open(OpenArgs {
            target: Target::ProcessorFirmware,
            total_size: Some(total_size),
            staging_size: Some(total_size as usize),
            version: Some(semver::Version::new(1, 2, 3)),
            expected_hash: [0u8; 32],
            stream_block: None,
        })?;
        assert!(!outcome.stream_block_taken_over);
        Ok(outcome.session)
    }

    fn staged(data: &[u8]) -> UpdateResult<HeapMedium> {
        let mut medium = HeapMedium::new(data.len());
        medium.map()?;
        medium.write_at(0, data)?;
        medium.unmap()?;
        Ok(medium)
    }

    #[test]
    fn headered_image_commits_in_place_for_v2() -> anyhow::Result<()> {
        let control = Arc::new(HostSlotControl::default());
        let header = build_header(SwArchVersion::V2, 1, 0);
        let mut stream = header.to_vec();
        stream.extend_from_slice(&[0x55; 256]);

        let mut session = open_session(&control, stream.len() as u64)?;
        let medium = staged(&stream)?;
        session.write(
            &medium,
            &WriteRequest {
                offset: 0,
                size: stream.len(),
            },
        )?;
        assert_eq!(session.binary_header_info()?, SwArchVersion::V2);
        session.post_process()?;
        session.close(false)?;

        assert_eq!(
            control.commits(),
            vec![(Target::ProcessorFirmware, CommitKind::InPlace)]
        );
        Ok(())
    }

    #[test]
    fn headerless_image_switches_slot() -> anyhow::Result<()> {
        let control = Arc::new(HostSlotControl::default());
        let stream = vec![0x10u8; 300];

        let mut session = open_session(&control, stream.len() as u64)?;
        let medium = staged(&stream)?;
        // Two windows, exercising incremental consumption.
        session.write(&medium, &WriteRequest { offset: 0, size: 100 })?;
        session.write(
            &medium,
            &WriteRequest {
                offset: 100,
                size: 200,
            },
        )?;
        assert_eq!(session.binary_header_info()?, SwArchVersion::Unknown);
        session.post_process()?;

        assert_eq!(
            control.commits(),
            vec![(Target::ProcessorFirmware, CommitKind::SlotSwitch)]
        );
        Ok(())
    }

    #[test]
    fn open_without_prepare_write_is_rejected() {
        let control: Arc<dyn SlotControl> = Arc::new(HostSlotControl::default());
        let module = ProcessorSubmodule::new(control);
        let err = match module.open(OpenArgs {
            target: Target::ProcessorFirmware,
            total_size: None,
            staging_size: None,
            version: None,
            expected_hash: [0u8; 32],
            stream_block: None,
        }) {
            Err(e) => e,
            Ok(_) => panic!("expected InvalidArgument"),
        };
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn undecided_header_blocks_commit() -> anyhow::Result<()> {
        let control = Arc::new(HostSlotControl::default());
        // Fewer bytes than the magic size: classification can never finish.
        let stream = vec![0xEEu8; 4];
        let mut session = open_session(&control, BINARY_HEADER_SIZE as u64)?;
        let medium = staged(&stream)?;
        session.write(&medium, &WriteRequest { offset: 0, size: 4 })?;

        let err = match session.post_process() {
            Err(e) => e,
            Ok(()) => panic!("expected Aborted"),
        };
        assert_eq!(err.code(), crate::error::ErrorCode::Aborted);
        assert!(control.commits().is_empty());
        Ok(())
    }
}
