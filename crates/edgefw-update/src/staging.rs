//! Staging buffer abstraction over large-heap memory
//!
//! Firmware bytes are copied into a staging buffer before a backend commits
//! them. Depending on platform capability the buffer is either memory-mapped
//! (zero-copy access while mapped) or file-I/O backed (seek + read/write).
//! The capability is decided once at allocation time and fixed for the life
//! of the buffer.
//!
//! The one hard ordering invariant lives here: the buffer must be
//! unmapped/closed before ownership transiently passes to a backend `write`
//! call, and re-mapped/re-opened before the core reads it again for hashing.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{UpdateError, UpdateResult};

/// Scratch buffer size for chunked copy-through-temp-buffer hashing on
/// platforms without mapping support.
pub const SCRATCH_CHUNK_SIZE: usize = 32 * 1024;

/// Default upper bound on a single staging allocation.
pub const DEFAULT_MAX_STAGING_SIZE: usize = 4 * 1024 * 1024;

/// A large-heap memory region holding firmware bytes in transit.
///
/// `map`/`unmap` gate the core-owned access phase (`write_at`,
/// `mapped_slice`). `read_at` is handle-level access and works regardless of
/// map state; it is what a backend uses while the core has released its view.
pub trait StagingMedium: Send {
    /// Total capacity of the staging area in bytes.
    fn len(&self) -> usize;

    /// Whether this region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the platform supports memory mapping for this region.
    fn supports_mapping(&self) -> bool;

    /// Map (or open) the region for core-owned access.
    fn map(&mut self) -> UpdateResult<()>;

    /// Unmap (or close) the region, releasing the core's view.
    fn unmap(&mut self) -> UpdateResult<()>;

    /// Whether the region is currently mapped/open.
    fn is_mapped(&self) -> bool;

    /// Copy `data` into the region at `offset`. Requires a mapped region.
    fn write_at(&mut self, offset: usize, data: &[u8]) -> UpdateResult<()>;

    /// Handle-level read into `buf`, valid in any map state.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> UpdateResult<()>;

    /// Zero-copy view of `[offset, offset + len)`. Mapped regions only;
    /// file-backed media return `Unimplemented`.
    fn mapped_slice(&self, offset: usize, len: usize) -> UpdateResult<&[u8]>;
}

fn check_window(region_len: usize, offset: usize, len: usize) -> UpdateResult<()> {
    if len == 0 {
        return Err(UpdateError::InvalidArgument("zero-length window".into()));
    }
    let end = offset
        .checked_add(len)
        .ok_or_else(|| UpdateError::InvalidArgument("window offset overflow".into()))?;
    if end > region_len {
        return Err(UpdateError::InvalidArgument(format!(
            "window [{offset}, {end}) exceeds staging size {region_len}"
        )));
    }
    Ok(())
}

/// Heap-backed staging medium with mapping support.
pub struct HeapMedium {
    data: Vec<u8>,
    mapped: bool,
}

impl HeapMedium {
    /// Allocate a zero-filled heap region of `size` bytes, unmapped.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            mapped: false,
        }
    }
}

impl StagingMedium for HeapMedium {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn supports_mapping(&self) -> bool {
        true
    }

    fn map(&mut self) -> UpdateResult<()> {
        if self.mapped {
            return Err(UpdateError::Internal("staging already mapped".into()));
        }
        self.mapped = true;
        Ok(())
    }

    fn unmap(&mut self) -> UpdateResult<()> {
        if !self.mapped {
            return Err(UpdateError::Internal("staging not mapped".into()));
        }
        self.mapped = false;
        Ok(())
    }

    fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> UpdateResult<()> {
        if !self.mapped {
            return Err(UpdateError::Internal("write to unmapped staging".into()));
        }
        check_window(self.data.len(), offset, data.len())?;
        if let Some(dst) = self.data.get_mut(offset..offset + data.len()) {
            dst.copy_from_slice(data);
        }
        Ok(())
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> UpdateResult<()> {
        check_window(self.data.len(), offset, buf.len())?;
        if let Some(src) = self.data.get(offset..offset + buf.len()) {
            buf.copy_from_slice(src);
        }
        Ok(())
    }

    fn mapped_slice(&self, offset: usize, len: usize) -> UpdateResult<&[u8]> {
        if !self.mapped {
            return Err(UpdateError::Internal("slice of unmapped staging".into()));
        }
        check_window(self.data.len(), offset, len)?;
        self.data
            .get(offset..offset + len)
            .ok_or_else(|| UpdateError::Internal("staging window out of range".into()))
    }
}

/// File-I/O backed staging medium for platforms without mapping support.
///
/// `map`/`unmap` translate to open/close of the backing file handle. Reads
/// while closed open a short-lived handle of their own, which models the
/// backend borrowing the underlying memory handle during a write call.
pub struct FileMedium {
    path: PathBuf,
    size: usize,
    handle: Option<File>,
}

impl FileMedium {
    /// Create a zero-filled backing file of `size` bytes at `path`, closed.
    pub fn create(path: PathBuf, size: usize) -> UpdateResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| UpdateError::Unavailable(format!("staging file create: {e}")))?;
        file.set_len(size as u64)
            .map_err(|e| UpdateError::Unavailable(format!("staging file resize: {e}")))?;
        drop(file);
        Ok(Self {
            path,
            size,
            handle: None,
        })
    }
}

impl Drop for FileMedium {
    fn drop(&mut self) {
        // Free the backing storage with the medium. Best-effort: a leftover
        // file is logged, not escalated.
        self.handle = None;
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(
                path = %self.path.display(),
                error = %err,
                "removing staging backing file failed"
            );
        }
    }
}

impl StagingMedium for FileMedium {
    fn len(&self) -> usize {
        self.size
    }

    fn supports_mapping(&self) -> bool {
        false
    }

    fn map(&mut self) -> UpdateResult<()> {
        if self.handle.is_some() {
            return Err(UpdateError::Internal("staging file already open".into()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| UpdateError::Unavailable(format!("staging file open: {e}")))?;
        self.handle = Some(file);
        Ok(())
    }

    fn unmap(&mut self) -> UpdateResult<()> {
        if self.handle.take().is_none() {
            return Err(UpdateError::Internal("staging file not open".into()));
        }
        Ok(())
    }

    fn is_mapped(&self) -> bool {
        self.handle.is_some()
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) -> UpdateResult<()> {
        check_window(self.size, offset, data.len())?;
        let file = self
            .handle
            .as_mut()
            .ok_or_else(|| UpdateError::Internal("write to closed staging file".into()))?;
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| UpdateError::Unavailable(format!("staging seek: {e}")))?;
        file.write_all(data)
            .map_err(|e| UpdateError::Unavailable(format!("staging write: {e}")))?;
        Ok(())
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> UpdateResult<()> {
        check_window(self.size, offset, buf.len())?;
        let mut file = File::open(&self.path)
            .map_err(|e| UpdateError::Unavailable(format!("staging read open: {e}")))?;
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|e| UpdateError::Unavailable(format!("staging seek: {e}")))?;
        file.read_exact(buf)
            .map_err(|e| UpdateError::Unavailable(format!("staging read: {e}")))?;
        Ok(())
    }

    fn mapped_slice(&self, _offset: usize, _len: usize) -> UpdateResult<&[u8]> {
        Err(UpdateError::Unimplemented(
            "file-backed staging has no mapped view".into(),
        ))
    }
}

/// Large-heap memory manager boundary: hands out staging media clamped to
/// the platform maximum.
pub trait StagingAllocator: Send + Sync {
    /// Largest staging allocation the platform supports.
    fn max_staging_size(&self) -> usize;

    /// Allocate a staging medium of exactly `size` bytes, unmapped/closed.
    fn allocate(&self, size: usize) -> UpdateResult<Box<dyn StagingMedium>>;
}

/// Heap allocator used on platforms with mapping support.
pub struct HeapStagingAllocator {
    max_size: usize,
}

impl HeapStagingAllocator {
    /// Allocator with an explicit upper bound per staging buffer.
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for HeapStagingAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STAGING_SIZE)
    }
}

impl StagingAllocator for HeapStagingAllocator {
    fn max_staging_size(&self) -> usize {
        self.max_size
    }

    fn allocate(&self, size: usize) -> UpdateResult<Box<dyn StagingMedium>> {
        if size == 0 || size > self.max_size {
            return Err(UpdateError::ResourceExhausted(format!(
                "staging size {size} outside (0, {}]",
                self.max_size
            )));
        }
        Ok(Box::new(HeapMedium::new(size)))
    }
}

/// File-backed allocator for platforms without mapping support.
pub struct FileStagingAllocator {
    dir: PathBuf,
    max_size: usize,
    counter: std::sync::atomic::AtomicU64,
}

impl FileStagingAllocator {
    /// Allocator placing backing files under `dir`.
    pub fn new(dir: PathBuf, max_size: usize) -> Self {
        Self {
            dir,
            max_size,
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl StagingAllocator for FileStagingAllocator {
    fn max_staging_size(&self) -> usize {
        self.max_size
    }

    fn allocate(&self, size: usize) -> UpdateResult<Box<dyn StagingMedium>> {
        if size == 0 || size > self.max_size {
            return Err(UpdateError::ResourceExhausted(format!(
                "staging size {size} outside (0, {}]",
                self.max_size
            )));
        }
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let path = self.dir.join(format!("staging-{n}.bin"));
        Ok(Box::new(FileMedium::create(path, size)?))
    }
}

/// Core-owned staging buffer: a medium plus the scratch buffer used for
/// chunked hashing when the medium has no mapped view.
pub struct StagingBuffer {
    medium: Box<dyn StagingMedium>,
    scratch: Option<Vec<u8>>,
}

impl StagingBuffer {
    /// Wrap a freshly allocated medium. The scratch buffer is allocated up
    /// front when mapping is unsupported, so the write path never allocates.
    pub fn new(medium: Box<dyn StagingMedium>) -> Self {
        let scratch = if medium.supports_mapping() {
            None
        } else {
            Some(vec![0u8; SCRATCH_CHUNK_SIZE])
        };
        Self { medium, scratch }
    }

    /// Capacity in bytes.
    pub fn size(&self) -> usize {
        self.medium.len()
    }

    /// Whether the core currently holds its view.
    pub fn is_mapped(&self) -> bool {
        self.medium.is_mapped()
    }

    /// Map/open the buffer for core-owned access.
    pub fn acquire(&mut self) -> UpdateResult<()> {
        self.medium.map()
    }

    /// Unmap/close the buffer before handing it to a backend.
    pub fn release(&mut self) -> UpdateResult<()> {
        self.medium.unmap()
    }

    /// Handle passed to a backend while the core's view is released.
    pub fn medium(&self) -> &dyn StagingMedium {
        self.medium.as_ref()
    }

    /// Copy caller data into the buffer (direct copy when mapped, seek+write
    /// when file-backed).
    pub fn copy_in(&mut self, offset: usize, data: &[u8]) -> UpdateResult<()> {
        self.medium.write_at(offset, data)
    }

    /// Feed `[offset, offset + len)` into a running hash: a direct update
    /// over the mapped slice, or seek + chunked reads through the scratch
    /// buffer for file-backed media.
    pub fn hash_window(
        &mut self,
        offset: usize,
        len: usize,
        hasher: &mut Sha256,
    ) -> UpdateResult<()> {
        check_window(self.medium.len(), offset, len)?;
        if self.medium.supports_mapping() {
            hasher.update(self.medium.mapped_slice(offset, len)?);
            return Ok(());
        }
        let scratch = self
            .scratch
            .as_mut()
            .ok_or_else(|| UpdateError::Internal("scratch buffer missing".into()))?;
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let take = (end - pos).min(scratch.len());
            let chunk = scratch
                .get_mut(..take)
                .ok_or_else(|| UpdateError::Internal("scratch window out of range".into()))?;
            self.medium.read_at(pos, chunk)?;
            hasher.update(&*chunk);
            pos += take;
        }
        debug!(offset, len, "hashed staging window through scratch buffer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(data: &[u8]) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(data);
        h.finalize().into()
    }

    #[test]
    fn heap_medium_gates_access_on_map_state() -> anyhow::Result<()> {
        let mut m = HeapMedium::new(128);
        assert!(m.supports_mapping());
        assert!(!m.is_mapped());
        assert!(m.write_at(0, &[1, 2, 3]).is_err());

        m.map()?;
        m.write_at(4, &[9, 9])?;
        assert_eq!(m.mapped_slice(4, 2)?, &[9, 9]);

        m.unmap()?;
        // Handle-level reads still work while unmapped.
        let mut buf = [0u8; 2];
        m.read_at(4, &mut buf)?;
        assert_eq!(buf, [9, 9]);
        assert!(m.mapped_slice(4, 2).is_err());
        Ok(())
    }

    #[test]
    fn heap_medium_rejects_double_map() -> anyhow::Result<()> {
        let mut m = HeapMedium::new(16);
        m.map()?;
        assert!(m.map().is_err());
        m.unmap()?;
        assert!(m.unmap().is_err());
        Ok(())
    }

    #[test]
    fn window_bounds_are_checked() -> anyhow::Result<()> {
        let mut m = HeapMedium::new(16);
        m.map()?;
        assert!(m.write_at(15, &[0, 0]).is_err());
        assert!(m.write_at(0, &[]).is_err());
        assert!(m.mapped_slice(usize::MAX, 2).is_err());
        Ok(())
    }

    #[test]
    fn file_medium_round_trips_through_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut m = FileMedium::create(dir.path().join("stage.bin"), 64)?;
        assert!(!m.supports_mapping());

        m.map()?;
        m.write_at(10, b"edgefw")?;
        m.unmap()?;

        // Closed handle: read goes through a short-lived reopen.
        let mut buf = [0u8; 6];
        m.read_at(10, &mut buf)?;
        assert_eq!(&buf, b"edgefw");
        Ok(())
    }

    #[test]
    fn file_medium_frees_backing_file_on_drop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stage.bin");
        let mut m = FileMedium::create(path.clone(), 32)?;
        m.map()?;
        m.write_at(0, &[1, 2, 3])?;
        m.unmap()?;
        assert!(path.exists());

        drop(m);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn hash_window_matches_for_both_backends() -> anyhow::Result<()> {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = digest(&payload);

        let mut heap = StagingBuffer::new(Box::new(HeapMedium::new(payload.len())));
        heap.acquire()?;
        heap.copy_in(0, &payload)?;
        let mut hasher = Sha256::new();
        heap.hash_window(0, payload.len(), &mut hasher)?;
        let got: [u8; 32] = hasher.finalize().into();
        assert_eq!(got, expected);

        let dir = tempfile::tempdir()?;
        let medium = FileMedium::create(dir.path().join("stage.bin"), payload.len())?;
        let mut file = StagingBuffer::new(Box::new(medium));
        file.acquire()?;
        file.copy_in(0, &payload)?;
        let mut hasher = Sha256::new();
        // Larger than one scratch chunk, exercising the chunked path.
        file.hash_window(0, payload.len(), &mut hasher)?;
        let got: [u8; 32] = hasher.finalize().into();
        assert_eq!(got, expected);
        Ok(())
    }

    #[test]
    fn allocator_clamps_to_max() -> anyhow::Result<()> {
        let alloc = HeapStagingAllocator::new(1024);
        assert!(alloc.allocate(0).is_err());
        assert!(alloc.allocate(2048).is_err());
        assert_eq!(alloc.allocate(1024)?.len(), 1024);
        Ok(())
    }
}
