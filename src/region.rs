//! Shared region manager.
//!
//! Owns the memory mapping behind a filter and is the only code that touches
//! the mapped bytes. Layout (all integers little-endian):
//!
//! ```text
//! offset 0:  capacity   u64
//! offset 8:  bit_length u64
//! offset 16: hash_count u32
//! offset 20: count      u64
//! offset 28: bit array, ceil(bit_length / 8) bytes, bit i = byte[i / 8] bit (i % 8)
//! ```
//!
//! Other handles, in this process or another, write the same bytes at any
//! time, so every access goes through `AtomicU8`. `count` sits at an offset
//! that is not 8-aligned and is therefore read and written byte by byte; the
//! counter as a whole is not atomic.

use crate::config::{BloomParams, FilterConfig};
use crate::error::{Result, ShmBloomError};
use bitvec::{order::Lsb0, slice::BitSlice};
use byteorder::{ByteOrder, LittleEndian};
use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions, MmapRaw};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub(crate) const OFF_CAPACITY: usize = 0;
pub(crate) const OFF_BIT_LENGTH: usize = 8;
pub(crate) const OFF_HASH_COUNT: usize = 16;
pub(crate) const OFF_COUNT: usize = 20;
pub const HEADER_SIZE: usize = 28;

/// Where a region's bytes live.
#[derive(Debug)]
pub enum Locator {
    /// A file path, created if missing.
    Path(PathBuf),
    /// An already-open file, read-write. The region keeps it open.
    File(File),
    /// Process-private anonymous memory, never shared.
    Anonymous,
}

impl From<PathBuf> for Locator {
    fn from(path: PathBuf) -> Self {
        Locator::Path(path)
    }
}

impl From<&PathBuf> for Locator {
    fn from(path: &PathBuf) -> Self {
        Locator::Path(path.clone())
    }
}

impl From<&Path> for Locator {
    fn from(path: &Path) -> Self {
        Locator::Path(path.to_path_buf())
    }
}

impl From<&str> for Locator {
    fn from(path: &str) -> Self {
        Locator::Path(PathBuf::from(path))
    }
}

impl From<String> for Locator {
    fn from(path: String) -> Self {
        Locator::Path(PathBuf::from(path))
    }
}

impl From<File> for Locator {
    fn from(file: File) -> Self {
        Locator::File(file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionOrigin {
    /// This handle initialized the header and bit array.
    Created,
    /// This handle joined a region that was already initialized.
    Attached,
}

/// Fixed-size header at the start of every region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionHeader {
    pub capacity: u64,
    pub bit_length: u64,
    pub hash_count: u32,
    pub count: u64,
}

impl RegionHeader {
    pub fn new(capacity: u64, params: BloomParams) -> Self {
        Self {
            capacity,
            bit_length: params.bit_length,
            hash_count: params.hash_count,
            count: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u64(
            &mut buf[OFF_CAPACITY..OFF_BIT_LENGTH],
            self.capacity,
        );
        LittleEndian::write_u64(
            &mut buf[OFF_BIT_LENGTH..OFF_HASH_COUNT],
            self.bit_length,
        );
        LittleEndian::write_u32(
            &mut buf[OFF_HASH_COUNT..OFF_COUNT],
            self.hash_count,
        );
        LittleEndian::write_u64(&mut buf[OFF_COUNT..HEADER_SIZE], self.count);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            capacity: LittleEndian::read_u64(&buf[OFF_CAPACITY..OFF_BIT_LENGTH]),
            bit_length: LittleEndian::read_u64(
                &buf[OFF_BIT_LENGTH..OFF_HASH_COUNT],
            ),
            hash_count: LittleEndian::read_u32(&buf[OFF_HASH_COUNT..OFF_COUNT]),
            count: LittleEndian::read_u64(&buf[OFF_COUNT..HEADER_SIZE]),
        }
    }

    /// Total region size this header describes, `None` on overflow.
    pub fn region_size(&self) -> Option<u64> {
        (HEADER_SIZE as u64).checked_add(self.bit_length.div_ceil(8))
    }

    /// A stored header may be attached to only if it describes exactly the
    /// storage it was read from.
    pub fn check_against(&self, actual_size: u64) -> Result<()> {
        if self.capacity == 0 {
            return Err(ShmBloomError::CorruptState(
                "stored capacity is 0".into(),
            ));
        }
        if self.bit_length == 0 {
            return Err(ShmBloomError::CorruptState(
                "stored bit length is 0".into(),
            ));
        }
        if self.hash_count == 0 {
            return Err(ShmBloomError::CorruptState(
                "stored hash count is 0".into(),
            ));
        }
        match self.region_size() {
            Some(expected) if expected == actual_size => Ok(()),
            Some(expected) => Err(ShmBloomError::CorruptState(format!(
                "backing storage is {actual_size} bytes but its header \
                 (bit length {}) describes {expected} bytes",
                self.bit_length
            ))),
            None => Err(ShmBloomError::CorruptState(format!(
                "stored bit length {} overflows the region size",
                self.bit_length
            ))),
        }
    }
}

/// Exclusive advisory lock on a backing file, released on drop.
pub(crate) struct FileLockGuard<'a> {
    file: &'a File,
}

impl<'a> FileLockGuard<'a> {
    pub(crate) fn acquire(file: &'a File) -> Result<Self> {
        FileExt::lock_exclusive(file)
            .map_err(ShmBloomError::storage("locking backing file"))?;
        Ok(Self { file })
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            warn!("Failed to unlock backing file: {}", e);
        }
    }
}

/// Held for the whole add or clear sequence when writers are serialized.
/// The file lock is released before the mutex.
pub(crate) struct WriteGuard<'a> {
    _file: Option<FileLockGuard<'a>>,
    _local: MutexGuard<'a, ()>,
}

/// Process-local handle on a mapped region.
pub struct SharedRegion {
    mmap: Option<MmapRaw>,
    // flock is per open file description, so threads sharing this handle
    // need their own exclusion.
    writers: Mutex<()>,
    file: Option<File>,
    path: Option<PathBuf>,
    capacity: u64,
    bit_length: u64,
    hash_count: u32,
    size: u64,
    origin: RegionOrigin,
}

impl SharedRegion {
    /// Create or attach to the region at `locator`.
    ///
    /// Storage that is missing or smaller than `config` requires gets resized
    /// and initialized from `config`. Storage that is large enough is
    /// attached to as-is, provided its header describes exactly its size;
    /// `config`'s capacity and error rate are then ignored.
    pub fn open(
        locator: impl Into<Locator>,
        config: &FilterConfig,
    ) -> Result<Self> {
        let params = config.params()?;
        let header = RegionHeader::new(config.capacity, params);
        let required = header.region_size().ok_or_else(|| {
            ShmBloomError::InvalidConfig(format!(
                "bit length {} overflows the region size",
                params.bit_length
            ))
        })?;

        match locator.into() {
            Locator::Anonymous => {
                Self::open_anonymous(header, required, config.advise_random)
            }
            Locator::Path(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .map_err(ShmBloomError::storage(format!(
                        "opening {}",
                        path.display()
                    )))?;
                Self::open_file(file, Some(path), header, required, config)
            }
            Locator::File(file) => {
                Self::open_file(file, None, header, required, config)
            }
        }
    }

    fn open_anonymous(
        header: RegionHeader,
        required: u64,
        advise_random: bool,
    ) -> Result<Self> {
        let len = mapping_len(required)?;
        let mmap = MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(ShmBloomError::storage("mapping anonymous memory"))?;
        advise(&mmap, advise_random);

        let region = Self {
            mmap: Some(MmapRaw::from(mmap)),
            writers: Mutex::new(()),
            file: None,
            path: None,
            capacity: header.capacity,
            bit_length: header.bit_length,
            hash_count: header.hash_count,
            size: required,
            origin: RegionOrigin::Created,
        };
        // Anonymous memory starts zeroed; only the header needs writing.
        region.write_header(&header)?;

        debug!(
            capacity = header.capacity,
            bit_length = header.bit_length,
            hash_count = header.hash_count,
            "Created private bloom region"
        );
        Ok(region)
    }

    fn open_file(
        file: File,
        path: Option<PathBuf>,
        header: RegionHeader,
        required: u64,
        config: &FilterConfig,
    ) -> Result<Self> {
        // Decide create-vs-attach under the lock so two openers racing on a
        // fresh file cannot both initialize it.
        let (mmap, stored, size, origin) = {
            let _lock = FileLockGuard::acquire(&file)?;
            let actual = file
                .metadata()
                .map_err(ShmBloomError::storage("reading backing file size"))?
                .len();

            if actual < required {
                file.set_len(required).map_err(ShmBloomError::storage(
                    "resizing backing file",
                ))?;
                let mmap = map_file(&file, required, config.advise_random)?;
                let cells = raw_view(&mmap);
                // set_len keeps any bytes an undersized file already had.
                for cell in &cells[HEADER_SIZE..] {
                    cell.store(0, Ordering::Relaxed);
                }
                store_bytes(cells, 0, &header.encode());
                (mmap, header, required, RegionOrigin::Created)
            } else {
                let mmap = map_file(&file, actual, config.advise_random)?;
                let mut buf = [0u8; HEADER_SIZE];
                load_bytes(raw_view(&mmap), 0, &mut buf);
                let stored = RegionHeader::decode(&buf);
                stored.check_against(actual)?;
                (mmap, stored, actual, RegionOrigin::Attached)
            }
        };

        match origin {
            RegionOrigin::Created => info!(
                path = ?path,
                capacity = stored.capacity,
                bit_length = stored.bit_length,
                hash_count = stored.hash_count,
                size,
                "Created shared bloom region"
            ),
            RegionOrigin::Attached => {
                if stored.capacity != config.capacity {
                    debug!(
                        requested = config.capacity,
                        stored = stored.capacity,
                        "Requested capacity ignored, region already initialized"
                    );
                }
                info!(
                    path = ?path,
                    capacity = stored.capacity,
                    bit_length = stored.bit_length,
                    hash_count = stored.hash_count,
                    count = stored.count,
                    "Attached to shared bloom region"
                )
            }
        }

        Ok(Self {
            mmap: Some(mmap),
            writers: Mutex::new(()),
            file: Some(file),
            path,
            capacity: stored.capacity,
            bit_length: stored.bit_length,
            hash_count: stored.hash_count,
            size,
            origin,
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn bit_length(&self) -> u64 {
        self.bit_length
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn origin(&self) -> RegionOrigin {
        self.origin
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_file_backed(&self) -> bool {
        self.file.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.mmap.is_none()
    }

    fn cells(&self) -> Result<&[AtomicU8]> {
        let mmap = self.mmap.as_ref().ok_or(ShmBloomError::Released)?;
        Ok(raw_view(mmap))
    }

    fn bits(&self) -> Result<&BitSlice<AtomicU8, Lsb0>> {
        let cells = self.cells()?;
        BitSlice::try_from_slice(&cells[HEADER_SIZE..]).map_err(|_| {
            ShmBloomError::CorruptState(
                "bit array exceeds the addressable bit range".into(),
            )
        })
    }

    /// Snapshot of the header with the live count.
    pub fn header(&self) -> Result<RegionHeader> {
        Ok(RegionHeader {
            capacity: self.capacity,
            bit_length: self.bit_length,
            hash_count: self.hash_count,
            count: self.count()?,
        })
    }

    pub fn count(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        load_bytes(self.cells()?, OFF_COUNT, &mut buf);
        Ok(LittleEndian::read_u64(&buf))
    }

    pub(crate) fn set_count(&self, count: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, count);
        store_bytes(self.cells()?, OFF_COUNT, &buf);
        Ok(())
    }

    fn write_header(&self, header: &RegionHeader) -> Result<()> {
        store_bytes(self.cells()?, 0, &header.encode());
        Ok(())
    }

    pub fn get_bit(&self, index: u64) -> Result<bool> {
        let bits = self.bits()?;
        Ok(bits[self.bit_index(index)?])
    }

    /// Sets one bit with an atomic OR; concurrent setters never lose bits.
    pub(crate) fn set_bit(&self, index: u64) -> Result<()> {
        let bits = self.bits()?;
        bits.set_aliased(self.bit_index(index)?, true);
        Ok(())
    }

    fn bit_index(&self, index: u64) -> Result<usize> {
        if index >= self.bit_length {
            return Err(ShmBloomError::CorruptState(format!(
                "bit {index} is outside the {}-bit array",
                self.bit_length
            )));
        }
        // bit_length bits are mapped, so the index fits in usize.
        Ok(index as usize)
    }

    /// Zero the whole bit array. The count is left alone.
    pub(crate) fn clear_bits(&self) -> Result<()> {
        let cells = self.cells()?;
        for cell in &cells[HEADER_SIZE..] {
            cell.store(0, Ordering::Release);
        }
        Ok(())
    }

    /// Number of set bits.
    pub fn population(&self) -> Result<u64> {
        Ok(self.bits()?.count_ones() as u64)
    }

    /// Exclude other writers on this handle, then on the backing file.
    /// Anonymous regions only take the in-process lock.
    pub(crate) fn lock_writers(&self) -> Result<WriteGuard<'_>> {
        if self.mmap.is_none() {
            return Err(ShmBloomError::Released);
        }
        let local = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        let file = self.file.as_ref().map(FileLockGuard::acquire).transpose()?;
        Ok(WriteGuard {
            _file: file,
            _local: local,
        })
    }

    /// Write dirty pages back to the backing file. Other handles see writes
    /// without this; it only matters for durability.
    pub fn flush(&self) -> Result<()> {
        let mmap = self.mmap.as_ref().ok_or(ShmBloomError::Released)?;
        if self.file.is_some() {
            mmap.flush()
                .map_err(ShmBloomError::storage("flushing mapped region"))?;
        }
        Ok(())
    }

    /// Unmap the region and drop the file handle. The backing file is left
    /// untouched. Calling this twice is harmless.
    pub(crate) fn release(&mut self) {
        if self.mmap.take().is_some() {
            debug!(path = ?self.path, "Released bloom region");
        }
        self.file = None;
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("bit_length", &self.bit_length)
            .field("hash_count", &self.hash_count)
            .field("size", &self.size)
            .field("origin", &self.origin)
            .field("released", &self.mmap.is_none())
            .finish()
    }
}

fn mapping_len(size: u64) -> Result<usize> {
    usize::try_from(size).map_err(|_| {
        ShmBloomError::InvalidConfig(format!(
            "region of {size} bytes cannot be mapped on this platform"
        ))
    })
}

fn map_file(file: &File, size: u64, advise_random: bool) -> Result<MmapRaw> {
    let len = mapping_len(size)?;
    // SAFETY: the mapping is shared with other handles by design; all access
    // to it goes through atomics (see `raw_view`). Truncating the file while
    // it is mapped is the caller's responsibility to avoid.
    let mmap = unsafe { MmapOptions::new().len(len).map_mut(file) }
        .map_err(ShmBloomError::storage("mapping backing file"))?;
    advise(&mmap, advise_random);
    Ok(MmapRaw::from(mmap))
}

#[cfg(unix)]
fn advise(mmap: &MmapMut, advise_random: bool) {
    if advise_random {
        if let Err(e) = mmap.advise(memmap2::Advice::Random) {
            warn!("madvise(MADV_RANDOM) failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn advise(_mmap: &MmapMut, _advise_random: bool) {}

fn raw_view(mmap: &MmapRaw) -> &[AtomicU8] {
    // SAFETY: the mapping is valid and writable for `len` bytes while `mmap`
    // lives, and AtomicU8 has the size and alignment of u8.
    unsafe {
        std::slice::from_raw_parts(
            mmap.as_mut_ptr().cast::<AtomicU8>(),
            mmap.len(),
        )
    }
}

fn load_bytes(cells: &[AtomicU8], offset: usize, out: &mut [u8]) {
    for (byte, cell) in out.iter_mut().zip(&cells[offset..]) {
        *byte = cell.load(Ordering::Acquire);
    }
}

fn store_bytes(cells: &[AtomicU8], offset: usize, bytes: &[u8]) {
    for (cell, byte) in cells[offset..].iter().zip(bytes) {
        cell.store(*byte, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfigBuilder;

    fn private_region(capacity: u64, error_rate: f64) -> SharedRegion {
        let config = FilterConfigBuilder::default()
            .capacity(capacity)
            .error_rate(error_rate)
            .build()
            .unwrap();
        SharedRegion::open(Locator::Anonymous, &config).unwrap()
    }

    #[test]
    fn test_header_field_offsets() {
        let header = RegionHeader {
            capacity: 0x0102030405060708,
            bit_length: 719,
            hash_count: 10,
            count: 3,
        };
        let buf = header.encode();
        assert_eq!(buf[0], 0x08);
        assert_eq!(buf[7], 0x01);
        assert_eq!(&buf[8..16], &719u64.to_le_bytes());
        assert_eq!(&buf[16..20], &10u32.to_le_bytes());
        assert_eq!(&buf[20..28], &3u64.to_le_bytes());
        assert_eq!(RegionHeader::decode(&buf), header);
    }

    #[test]
    fn test_region_size_rounds_up_bits() {
        let header = RegionHeader {
            capacity: 50,
            bit_length: 719,
            hash_count: 10,
            count: 0,
        };
        assert_eq!(header.region_size(), Some(28 + 90));
        assert!(header.check_against(118).is_ok());
        assert!(matches!(
            header.check_against(119),
            Err(ShmBloomError::CorruptState(_))
        ));
    }

    #[test]
    fn test_zeroed_header_is_corrupt() {
        let header = RegionHeader::decode(&[0u8; HEADER_SIZE]);
        assert!(matches!(
            header.check_against(HEADER_SIZE as u64),
            Err(ShmBloomError::CorruptState(_))
        ));
    }

    #[test]
    fn test_private_region_starts_empty() {
        let region = private_region(50, 0.001);
        assert_eq!(region.origin(), RegionOrigin::Created);
        assert_eq!(region.capacity(), 50);
        assert_eq!(region.bit_length(), 719);
        assert_eq!(region.hash_count(), 10);
        assert_eq!(region.size(), 118);
        assert_eq!(region.count().unwrap(), 0);
        assert_eq!(region.population().unwrap(), 0);
        assert!(!region.is_file_backed());
        let guard = region.lock_writers().unwrap();
        assert!(guard._file.is_none());
        assert!(region.writers.try_lock().is_err());
        drop(guard);
        assert!(region.writers.try_lock().is_ok());
    }

    #[test]
    fn test_bit_addressing() {
        let region = private_region(50, 0.001);
        region.set_bit(0).unwrap();
        region.set_bit(9).unwrap();
        region.set_bit(718).unwrap();
        region.set_bit(9).unwrap();

        assert!(region.get_bit(0).unwrap());
        assert!(region.get_bit(9).unwrap());
        assert!(region.get_bit(718).unwrap());
        assert!(!region.get_bit(8).unwrap());
        assert_eq!(region.population().unwrap(), 3);

        let cells = region.cells().unwrap();
        // bit i lives in byte i / 8 at offset i % 8
        assert_eq!(cells[HEADER_SIZE].load(Ordering::Relaxed), 0b0000_0001);
        assert_eq!(cells[HEADER_SIZE + 1].load(Ordering::Relaxed), 0b0000_0010);
        assert_eq!(
            cells[HEADER_SIZE + 89].load(Ordering::Relaxed),
            0b0100_0000
        );

        assert!(region.set_bit(719).is_err());
        assert!(region.get_bit(719).is_err());
    }

    #[test]
    fn test_count_and_clear() {
        let region = private_region(50, 0.001);
        region.set_count(42).unwrap();
        region.set_bit(100).unwrap();
        assert_eq!(region.count().unwrap(), 42);
        assert_eq!(region.header().unwrap().count, 42);

        region.clear_bits().unwrap();
        assert_eq!(region.population().unwrap(), 0);
        assert_eq!(region.count().unwrap(), 42);
        assert_eq!(region.capacity(), 50);
    }

    #[test]
    fn test_released_region_rejects_access() {
        let mut region = private_region(50, 0.001);
        region.release();
        region.release();
        assert!(region.is_released());
        assert!(matches!(region.count(), Err(ShmBloomError::Released)));
        assert!(matches!(region.set_bit(1), Err(ShmBloomError::Released)));
        assert!(matches!(region.clear_bits(), Err(ShmBloomError::Released)));
        assert!(matches!(region.flush(), Err(ShmBloomError::Released)));
        assert!(matches!(
            region.lock_writers(),
            Err(ShmBloomError::Released)
        ));
        // Fixed header fields stay readable.
        assert_eq!(region.capacity(), 50);
    }
}
