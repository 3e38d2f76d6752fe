//! Property-based tests for the firmware update system

use edgefw_update::header::build_header;
use edgefw_update::prelude::*;
use edgefw_update::{BINARY_HEADER_MAGIC, BINARY_HEADER_SIZE, FeedOutcome};
use proptest::prelude::*;
use sha2::{Digest, Sha256};

fn sha(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 64..2048)
}

fn run_update(payload: &[u8], expected_hash: [u8; 32], window: usize) -> UpdateResult<()> {
    let manager = FirmwareManager::new(Platform::host());
    manager.init()?;
    let opened = manager.open(
        &OpenRequest {
            target: Target::ProcessorFirmware,
            hash: expected_hash,
            version: None,
            name: None,
        },
        Some(&PrepareWriteRequest {
            total_size: payload.len() as u64,
            memory_size: payload.len(),
        }),
    )?;
    for (i, chunk) in payload.chunks(window).enumerate() {
        let offset = i * window;
        manager.copy_to_internal_buffer(opened.handle, &CopyRequest { offset, data: chunk })?;
        manager.write(
            opened.handle,
            &WriteRequest {
                offset,
                size: chunk.len(),
            },
        )?;
    }
    let committed = manager.post_process(opened.handle);
    let closed = manager.close(opened.handle);
    committed?;
    closed
}

/// Parse a stream fed in fixed-size windows, returning the payload after
/// header stripping.
fn parse_windowed(stream: &[u8], window: usize) -> UpdateResult<(SwArchVersion, Vec<u8>)> {
    let mut parser = BinaryHeaderParser::new();
    let mut payload = Vec::new();
    for chunk in stream.chunks(window) {
        if parser.is_completed() {
            payload.extend_from_slice(chunk);
            continue;
        }
        match parser.feed(chunk)? {
            FeedOutcome::Pending => {}
            FeedOutcome::Completed { consumed, replay } => {
                payload.extend_from_slice(&replay);
                payload.extend_from_slice(&chunk[consumed..]);
            }
        }
    }
    let arch = parser
        .info()
        .map_or(SwArchVersion::Unknown, |i| i.sw_arch_version);
    Ok((arch, payload))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_update_succeeds_for_any_chunking(
        payload in arb_payload(),
        window in 1usize..512,
    ) {
        let result = run_update(&payload, sha(&payload), window);
        prop_assert!(result.is_ok(), "update failed: {result:?}");
    }

    #[test]
    fn prop_corrupted_stream_is_always_rejected(
        payload in arb_payload(),
        window in 1usize..512,
        flip in any::<prop::sample::Index>(),
    ) {
        let mut corrupted = payload.clone();
        let idx = flip.index(corrupted.len());
        corrupted[idx] ^= 0x01;

        // Hash computed over the original, stream carries the corruption.
        let result = run_update(&corrupted, sha(&payload), window);
        let err = match result {
            Err(e) => e,
            Ok(()) => return Err(TestCaseError::fail("corrupted stream committed")),
        };
        prop_assert_eq!(err.code(), ErrorCode::Aborted);
        prop_assert_eq!(err.root_code(), ErrorCode::InvalidData);
    }

    #[test]
    fn prop_header_parse_is_window_independent(
        body in prop::collection::vec(any::<u8>(), 0..512),
        window in 1usize..128,
        arch in prop::sample::select(vec![SwArchVersion::V1, SwArchVersion::V2]),
    ) {
        let mut stream = build_header(arch, 1, 2).to_vec();
        stream.extend_from_slice(&body);

        let (got_arch, payload) = parse_windowed(&stream, window)
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        prop_assert_eq!(got_arch, arch);
        prop_assert_eq!(payload, body);
    }

    #[test]
    fn prop_headerless_parse_preserves_stream(
        stream in prop::collection::vec(any::<u8>(), 8..512),
        window in 1usize..64,
    ) {
        // Force a magic mismatch so the stream counts as headerless.
        prop_assume!(stream[..8] != BINARY_HEADER_MAGIC[..]);

        let (arch, payload) = parse_windowed(&stream, window)
            .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
        prop_assert_eq!(arch, SwArchVersion::Unknown);
        prop_assert_eq!(payload, stream);
    }

    #[test]
    fn prop_truncated_header_never_completes(
        cut in 8usize..BINARY_HEADER_SIZE,
        window in 1usize..16,
    ) {
        let header = build_header(SwArchVersion::V1, 0, 0);
        let mut parser = BinaryHeaderParser::new();
        for chunk in header[..cut].chunks(window) {
            let outcome = parser.feed(chunk)
                .map_err(|e| TestCaseError::fail(format!("parse failed: {e}")))?;
            prop_assert!(matches!(outcome, FeedOutcome::Pending));
        }
        prop_assert!(!parser.is_completed());
        prop_assert!(parser.magic_loaded());
    }
}
