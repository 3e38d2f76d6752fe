//! Incremental binary header parsing for processor firmware streams
//!
//! A processor image may carry a fixed-size, magic-prefixed, self-hashed
//! metadata block in its first bytes. The header arrives through the same
//! chunked write path as the payload, so parsing must be chunk-boundary
//! independent: bytes are accumulated across write calls until either the
//! magic is ruled out (the whole stream is payload) or the full header has
//! been seen and its embedded hash verified.
//!
//! Layout (all integers little-endian, [`BINARY_HEADER_SIZE`] bytes total):
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 8    | magic                                   |
//! | 8      | 4    | header_version (must be 1)              |
//! | 12     | 4    | sw_arch_version                         |
//! | 16     | 4    | device_type                             |
//! | 20     | 4    | device_variant                          |
//! | 24     | 8    | reserved                                |
//! | 32     | 32   | SHA-256 over bytes `[0, 32)`            |

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{UpdateError, UpdateResult};

/// Magic value opening a binary header.
pub const BINARY_HEADER_MAGIC: [u8; 8] = *b"EFWHDR1\n";

/// Total size of the fixed-format header.
pub const BINARY_HEADER_SIZE: usize = 64;

/// Size of the magic prefix; the header-or-payload decision needs this many
/// bytes.
pub const BINARY_HEADER_MAGIC_SIZE: usize = 8;

const HASHED_REGION: usize = 32;
const SUPPORTED_HEADER_VERSION: u32 = 1;

/// Software architecture version declared by a binary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwArchVersion {
    /// No header present, or header not yet classified
    Unknown,
    /// First-generation images; commit performs a full slot switch
    V1,
    /// Second-generation images; the bootloader manages the switch itself
    V2,
}

impl SwArchVersion {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(SwArchVersion::V1),
            2 => Some(SwArchVersion::V2),
            _ => None,
        }
    }
}

/// Parsed header fields exposed once classification completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryHeaderInfo {
    /// Number of stream bytes occupied by the header (0 = no header).
    pub header_size: usize,
    /// Declared architecture version.
    pub sw_arch_version: SwArchVersion,
    /// Target device type field.
    pub device_type: u32,
    /// Target device variant field.
    pub device_variant: u32,
}

impl BinaryHeaderInfo {
    fn no_header() -> Self {
        Self {
            header_size: 0,
            sw_arch_version: SwArchVersion::Unknown,
            device_type: 0,
            device_variant: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    NoBytesSeen,
    MagicPending,
    MagicVerified,
    Completed,
}

/// Result of feeding stream bytes into the parser.
#[derive(Debug)]
pub enum FeedOutcome {
    /// All offered bytes were absorbed into the accumulation buffer;
    /// classification is still pending.
    Pending,
    /// Classification finished during this feed. `consumed` bytes of the
    /// offered slice were taken; `replay` holds previously absorbed bytes
    /// that turned out to be payload (no-header case) and must be written
    /// ahead of the rest of the stream.
    Completed {
        /// Bytes of this feed call absorbed by the parser.
        consumed: usize,
        /// Earlier-absorbed bytes reclassified as payload.
        replay: Vec<u8>,
    },
}

/// Incremental parser for the optional binary header.
///
/// `total_loaded_size` only increases; once completed the accumulation
/// buffer is freed and never touched again.
pub struct BinaryHeaderParser {
    state: ParseState,
    accum: Vec<u8>,
    total_loaded: usize,
    info: Option<BinaryHeaderInfo>,
}

impl Default for BinaryHeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryHeaderParser {
    /// Parser in the initial no-bytes-seen state.
    pub fn new() -> Self {
        Self {
            state: ParseState::NoBytesSeen,
            accum: Vec::with_capacity(BINARY_HEADER_SIZE),
            total_loaded: 0,
            info: None,
        }
    }

    /// Whether the header-or-payload decision has been made.
    pub fn is_completed(&self) -> bool {
        self.state == ParseState::Completed
    }

    /// Whether the magic prefix has been verified.
    pub fn magic_loaded(&self) -> bool {
        matches!(
            self.state,
            ParseState::MagicVerified | ParseState::Completed
        )
    }

    /// Total header-candidate bytes absorbed so far.
    pub fn total_loaded_size(&self) -> usize {
        self.total_loaded
    }

    /// Parsed header info, available once completed.
    pub fn info(&self) -> Option<&BinaryHeaderInfo> {
        self.info.as_ref()
    }

    /// Absorb the next bytes of the firmware stream.
    ///
    /// Completed parsers absorb nothing and report zero consumption, so the
    /// caller can feed every write window unconditionally.
    ///
    /// # Errors
    ///
    /// `InvalidData` for a header hash mismatch, an unsupported header
    /// version, or an unknown architecture version. These are fatal for the
    /// update session.
    pub fn feed(&mut self, bytes: &[u8]) -> UpdateResult<FeedOutcome> {
        if self.state == ParseState::Completed {
            return Ok(FeedOutcome::Completed {
                consumed: 0,
                replay: Vec::new(),
            });
        }
        if bytes.is_empty() {
            return Ok(FeedOutcome::Pending);
        }

        let mut consumed = 0usize;

        // Phase 1: accumulate up to the magic size, then decide.
        if self.accum.len() < BINARY_HEADER_MAGIC_SIZE {
            self.state = ParseState::MagicPending;
            let need = BINARY_HEADER_MAGIC_SIZE - self.accum.len();
            let take = need.min(bytes.len());
            self.absorb(bytes, 0, take);
            consumed += take;

            if self.accum.len() < BINARY_HEADER_MAGIC_SIZE {
                return Ok(FeedOutcome::Pending);
            }

            if self.accum.as_slice() != BINARY_HEADER_MAGIC {
                // Not an error: this image simply has no header. Everything
                // absorbed so far is payload and must be replayed.
                debug!("no binary header magic; treating full stream as payload");
                let replay = std::mem::take(&mut self.accum);
                self.state = ParseState::Completed;
                self.info = Some(BinaryHeaderInfo::no_header());
                return Ok(FeedOutcome::Completed { consumed, replay });
            }
            self.state = ParseState::MagicVerified;
        }

        // Phase 2: accumulate the remainder of the fixed-size header.
        let need = BINARY_HEADER_SIZE - self.accum.len();
        let take = need.min(bytes.len() - consumed);
        self.absorb(bytes, consumed, take);
        consumed += take;

        if self.accum.len() < BINARY_HEADER_SIZE {
            return Ok(FeedOutcome::Pending);
        }

        let info = self.verify_and_parse()?;
        debug!(
            header_size = info.header_size,
            arch = ?info.sw_arch_version,
            "binary header verified"
        );
        self.info = Some(info);
        self.state = ParseState::Completed;
        self.accum = Vec::new();
        Ok(FeedOutcome::Completed {
            consumed,
            replay: Vec::new(),
        })
    }

    fn absorb(&mut self, bytes: &[u8], from: usize, len: usize) {
        if let Some(src) = bytes.get(from..from + len) {
            self.accum.extend_from_slice(src);
            self.total_loaded += len;
        }
    }

    fn verify_and_parse(&self) -> UpdateResult<BinaryHeaderInfo> {
        let hashed = self
            .accum
            .get(..HASHED_REGION)
            .ok_or_else(|| UpdateError::Internal("header accumulation short".into()))?;
        let stored = self
            .accum
            .get(HASHED_REGION..BINARY_HEADER_SIZE)
            .ok_or_else(|| UpdateError::Internal("header accumulation short".into()))?;

        let mut hasher = Sha256::new();
        hasher.update(hashed);
        let computed: [u8; 32] = hasher.finalize().into();
        if computed != stored {
            warn!(
                computed = %hex::encode(computed),
                stored = %hex::encode(stored),
                "binary header hash mismatch"
            );
            return Err(UpdateError::InvalidData(
                "binary header hash mismatch".into(),
            ));
        }

        let header_version = read_u32(&self.accum, 8)?;
        if header_version != SUPPORTED_HEADER_VERSION {
            return Err(UpdateError::InvalidData(format!(
                "unsupported binary header version {header_version}"
            )));
        }

        let raw_arch = read_u32(&self.accum, 12)?;
        let sw_arch_version = SwArchVersion::from_raw(raw_arch).ok_or_else(|| {
            UpdateError::InvalidData(format!("unknown sw architecture version {raw_arch}"))
        })?;

        Ok(BinaryHeaderInfo {
            header_size: BINARY_HEADER_SIZE,
            sw_arch_version,
            device_type: read_u32(&self.accum, 16)?,
            device_variant: read_u32(&self.accum, 20)?,
        })
    }
}

fn read_u32(buf: &[u8], offset: usize) -> UpdateResult<u32> {
    let slice = buf
        .get(offset..offset + 4)
        .ok_or_else(|| UpdateError::Internal("header field out of range".into()))?;
    let arr: [u8; 4] = slice
        .try_into()
        .map_err(|_| UpdateError::Internal("header field width".into()))?;
    Ok(u32::from_le_bytes(arr))
}

/// Build a valid header image for the given fields. Used by device-side
/// image tooling and by tests.
pub fn build_header(
    sw_arch_version: SwArchVersion,
    device_type: u32,
    device_variant: u32,
) -> [u8; BINARY_HEADER_SIZE] {
    let mut out = [0u8; BINARY_HEADER_SIZE];
    out[..8].copy_from_slice(&BINARY_HEADER_MAGIC);
    out[8..12].copy_from_slice(&SUPPORTED_HEADER_VERSION.to_le_bytes());
    let raw_arch: u32 = match sw_arch_version {
        SwArchVersion::Unknown => 0,
        SwArchVersion::V1 => 1,
        SwArchVersion::V2 => 2,
    };
    out[12..16].copy_from_slice(&raw_arch.to_le_bytes());
    out[16..20].copy_from_slice(&device_type.to_le_bytes());
    out[20..24].copy_from_slice(&device_variant.to_le_bytes());
    let mut hasher = Sha256::new();
    hasher.update(&out[..HASHED_REGION]);
    let digest: [u8; 32] = hasher.finalize().into();
    out[HASHED_REGION..].copy_from_slice(&digest);
    out
}
