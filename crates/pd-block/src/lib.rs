#![forbid(unsafe_code)]
//! Block I/O layer with a write-through LRU block cache.
//!
//! Provides the `BlockDevice` trait the transaction manager reads and
//! writes metadata blocks through, a file-backed implementation, an
//! in-memory device for scratch metadata and tests, and a cached wrapper.

use pd_error::{PdError, Result};
use pd_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only when the image is not writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

fn checked_end(offset: u64, len: usize, op: &str) -> Result<u64> {
    offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| PdError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| PdError::Format(format!("{op} range overflows u64")))
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(PdError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(PdError::Format("metadata image is read-only".to_owned()));
        }
        let end = checked_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(PdError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        let block_size = BlockSize::new(block_size)
            .map_err(|e| PdError::Format(format!("invalid block_size={block_size}: {e}")))?;

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size.get());
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(PdError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size_u64;
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(PdError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        self.block_size
            .block_to_byte(block)
            .ok_or_else(|| PdError::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size.get()).map_err(|_| {
                PdError::Format("block_size does not fit usize".to_owned())
            })?
        ];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.block_size.get())
            .map_err(|_| PdError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(PdError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// In-memory block device.
///
/// Unwritten blocks read back as zeroes. Individual blocks can be marked
/// unreadable to simulate media errors.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    unreadable: Mutex<Vec<u64>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
            unreadable: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent reads of `block` fail with an I/O error.
    pub fn fail_reads(&self, block: BlockNumber) {
        self.unreadable.lock().push(block.0);
    }

    /// Overwrite the stored bytes of `block` directly, bypassing validation.
    pub fn poke(&self, block: BlockNumber, offset: usize, bytes: &[u8]) {
        let size = self.block_size as usize;
        let mut blocks = self.blocks.lock();
        let data = blocks.entry(block.0).or_insert_with(|| vec![0_u8; size]);
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Number of blocks that have been written at least once.
    #[must_use]
    pub fn blocks_written(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(PdError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        if self.unreadable.lock().contains(&block.0) {
            return Err(PdError::Io(std::io::Error::other(format!(
                "simulated read failure at block {}",
                block.0
            ))));
        }
        let blocks = self.blocks.lock();
        let bytes = blocks
            .get(&block.0)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; self.block_size as usize]);
        drop(blocks);
        Ok(BlockBuf::new(bytes))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(PdError::Format(format!(
                "write_block data size mismatch: got={} expected={}",
                data.len(),
                self.block_size
            )));
        }
        if block.0 >= self.block_count {
            return Err(PdError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        self.blocks.lock().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for &T {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

// ── Block cache ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct CachedBlock {
    data: Vec<u8>,
    last_use: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    blocks: HashMap<BlockNumber, CachedBlock>,
    /// Resident blocks keyed by last use, oldest first.
    by_use: BTreeMap<u64, BlockNumber>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn hit(&mut self, block: BlockNumber) -> Option<Vec<u8>> {
        let now = self.tick();
        let entry = self.blocks.get_mut(&block)?;
        self.by_use.remove(&entry.last_use);
        entry.last_use = now;
        self.by_use.insert(now, block);
        self.hits += 1;
        Some(entry.data.clone())
    }

    fn put(&mut self, block: BlockNumber, data: Vec<u8>, capacity: usize) {
        let now = self.tick();
        if let Some(old) = self.blocks.insert(block, CachedBlock { data, last_use: now }) {
            self.by_use.remove(&old.last_use);
        }
        self.by_use.insert(now, block);

        while self.blocks.len() > capacity {
            let Some((_, victim)) = self.by_use.pop_first() else {
                break;
            };
            self.blocks.remove(&victim);
            self.evictions += 1;
            trace!(block = victim.0, "block_cache_evict");
        }
    }
}

/// Counters of a [`BlockCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resident: usize,
}

/// Write-through LRU cache of whole metadata blocks.
///
/// Writes reach the device before the cached copy is replaced, so a failed
/// write leaves the cache as it was.
#[derive(Debug)]
pub struct BlockCache<D: BlockDevice> {
    inner: D,
    capacity: usize,
    state: Mutex<CacheState>,
}

impl<D: BlockDevice> BlockCache<D> {
    pub fn new(inner: D, capacity_blocks: usize) -> Result<Self> {
        if capacity_blocks == 0 {
            return Err(PdError::Format(
                "block cache capacity must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            inner,
            capacity: capacity_blocks,
            state: Mutex::new(CacheState::default()),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            resident: state.blocks.len(),
        }
    }
}

impl<D: BlockDevice> BlockDevice for BlockCache<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if let Some(data) = self.state.lock().hit(block) {
            return Ok(BlockBuf::new(data));
        }

        let buf = self.inner.read_block(block)?;
        let mut state = self.state.lock();
        state.misses += 1;
        state.put(block, buf.as_slice().to_vec(), self.capacity);
        drop(state);
        trace!(block = block.0, "block_cache_fill");
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        self.inner.write_block(block, data)?;
        self.state.lock().put(block, data.to_vec(), self.capacity);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
