//! Unit tests for the firmware update crate

mod target_tests {
    use edgefw_update::prelude::*;

    #[test]
    fn test_target_display() {
        assert_eq!(format!("{}", Target::ProcessorFirmware), "processor-firmware");
        assert_eq!(format!("{}", Target::ProcessorLoader), "processor-loader");
        assert_eq!(format!("{}", Target::SensorLoader), "sensor-loader");
        assert_eq!(format!("{}", Target::SensorFirmware), "sensor-firmware");
        assert_eq!(format!("{}", Target::AiModel(3)), "ai-model-3");
    }

    #[test]
    fn test_stream_block_requirement_follows_target_family() {
        assert!(!Target::ProcessorFirmware.requires_stream_block());
        assert!(!Target::ProcessorLoader.requires_stream_block());
        assert!(Target::SensorLoader.requires_stream_block());
        assert!(Target::SensorFirmware.requires_stream_block());
        assert!(Target::AiModel(0).requires_stream_block());
    }

    #[test]
    fn test_slot_info_empty() {
        let info = SlotInfo::empty(Target::AiModel(1));
        assert_eq!(info.target, Target::AiModel(1));
        assert!(info.version.is_none());
        assert_eq!(info.hash, [0u8; 32]);
        assert!(info.last_update.is_none());
    }
}

mod error_tests {
    use edgefw_update::prelude::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            UpdateError::InvalidArgument("x".into()).code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(UpdateError::Busy.code(), ErrorCode::Busy);
        assert_eq!(
            UpdateError::Unimplemented("x".into()).code(),
            ErrorCode::Unimplemented
        );
    }

    #[test]
    fn test_aborted_preserves_root_cause() {
        let err = UpdateError::aborted(UpdateError::InvalidData("hash mismatch".into()));
        assert_eq!(err.code(), ErrorCode::Aborted);
        assert_eq!(err.root_code(), ErrorCode::InvalidData);

        // Nested aborts still unwrap to the innermost cause.
        let nested = UpdateError::aborted(err);
        assert_eq!(nested.root_code(), ErrorCode::InvalidData);
    }

    #[test]
    fn test_plain_error_is_its_own_root() {
        let err = UpdateError::Unavailable("device gone".into());
        assert_eq!(err.root_code(), ErrorCode::Unavailable);
    }
}

mod header_tests {
    use edgefw_update::header::build_header;
    use edgefw_update::prelude::*;
    use edgefw_update::{BINARY_HEADER_SIZE, FeedOutcome};

    #[test]
    fn test_headered_stream_strips_header() -> anyhow::Result<()> {
        let header = build_header(SwArchVersion::V2, 7, 1);
        let mut parser = BinaryHeaderParser::new();
        let outcome = parser.feed(&header)?;
        match outcome {
            FeedOutcome::Completed { consumed, replay } => {
                assert_eq!(consumed, BINARY_HEADER_SIZE);
                assert!(replay.is_empty());
            }
            FeedOutcome::Pending => panic!("expected completion after a full header"),
        }
        let info = parser.info().ok_or_else(|| anyhow::anyhow!("no info"))?;
        assert_eq!(info.header_size, BINARY_HEADER_SIZE);
        assert_eq!(info.sw_arch_version, SwArchVersion::V2);
        assert_eq!(info.device_type, 7);
        assert_eq!(info.device_variant, 1);
        Ok(())
    }

    #[test]
    fn test_headerless_stream_replays_prefix_as_payload() -> anyhow::Result<()> {
        // First bytes do not match the magic, so the whole accumulated
        // prefix is payload.
        let stream = [0xA5u8; 16];
        let mut parser = BinaryHeaderParser::new();
        let outcome = parser.feed(&stream)?;
        match outcome {
            FeedOutcome::Completed { consumed, replay } => {
                assert_eq!(consumed + replay.len(), 16);
            }
            FeedOutcome::Pending => panic!("expected headerless classification"),
        }
        let info = parser.info().ok_or_else(|| anyhow::anyhow!("no info"))?;
        assert_eq!(info.header_size, 0);
        assert_eq!(info.sw_arch_version, SwArchVersion::Unknown);
        Ok(())
    }

    #[test]
    fn test_corrupted_header_hash_is_invalid_data() {
        let mut header = build_header(SwArchVersion::V1, 0, 0);
        header[20] ^= 0xFF;
        let mut parser = BinaryHeaderParser::new();
        let err = match parser.feed(&header) {
            Err(e) => e,
            Ok(_) => panic!("expected InvalidData"),
        };
        assert_eq!(err.code(), ErrorCode::InvalidData);
    }
}

mod staging_tests {
    use edgefw_update::staging::{HeapMedium, HeapStagingAllocator};
    use edgefw_update::prelude::*;
    use sha2::{Digest, Sha256};

    #[test]
    fn test_allocator_bounds() -> anyhow::Result<()> {
        let alloc = HeapStagingAllocator::new(4096);
        assert_eq!(alloc.max_staging_size(), 4096);
        assert!(alloc.allocate(0).is_err());
        assert!(alloc.allocate(4097).is_err());
        assert_eq!(alloc.allocate(4096)?.len(), 4096);
        Ok(())
    }

    #[test]
    fn test_buffer_hash_matches_direct_hash() -> anyhow::Result<()> {
        let payload: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        let mut direct = Sha256::new();
        direct.update(&payload);
        let expected: [u8; 32] = direct.finalize().into();

        let mut buffer = StagingBuffer::new(Box::new(HeapMedium::new(payload.len())));
        buffer.acquire()?;
        buffer.copy_in(0, &payload)?;
        let mut hasher = Sha256::new();
        buffer.hash_window(0, payload.len(), &mut hasher)?;
        let got: [u8; 32] = hasher.finalize().into();
        assert_eq!(got, expected);
        Ok(())
    }
}

mod lifecycle_tests {
    use edgefw_update::prelude::*;

    #[test]
    fn test_operations_rejected_before_init() {
        let manager = FirmwareManager::new(Platform::host());
        assert_eq!(manager.lifecycle_state(), LifecycleState::Uninit);

        let err = match manager.deinit() {
            Err(e) => e,
            Ok(()) => panic!("expected FailedPrecondition"),
        };
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);

        let err = match manager.get_info(&InfoRequest {
            target: Target::ProcessorFirmware,
            max_entries: 4,
            name: None,
        }) {
            Err(e) => e,
            Ok(_) => panic!("expected FailedPrecondition"),
        };
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }

    #[test]
    fn test_init_deinit_round_trip() -> anyhow::Result<()> {
        let manager = FirmwareManager::new(Platform::host());
        manager.init()?;
        assert_eq!(manager.lifecycle_state(), LifecycleState::Idle);

        // Double init is a precondition failure, not a crash.
        assert!(manager.init().is_err());

        manager.deinit()?;
        assert_eq!(manager.lifecycle_state(), LifecycleState::Uninit);
        manager.init()?;
        assert_eq!(manager.lifecycle_state(), LifecycleState::Idle);
        Ok(())
    }

    #[test]
    fn test_get_info_validates_capacity() -> anyhow::Result<()> {
        let manager = FirmwareManager::new(Platform::host());
        manager.init()?;
        let err = match manager.get_info(&InfoRequest {
            target: Target::ProcessorFirmware,
            max_entries: 0,
            name: None,
        }) {
            Err(e) => e,
            Ok(_) => panic!("expected InvalidArgument"),
        };
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        Ok(())
    }

    #[test]
    fn test_get_info_reports_empty_slot() -> anyhow::Result<()> {
        let manager = FirmwareManager::new(Platform::host());
        manager.init()?;
        let info = manager.get_info(&InfoRequest {
            target: Target::SensorFirmware,
            max_entries: 4,
            name: None,
        })?;
        assert_eq!(info.entries.len(), 1);
        assert!(info.entries[0].version.is_none());
        Ok(())
    }
}
