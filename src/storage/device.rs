// # Storage Devices
//
// Block-device abstraction behind the log allocator and the AOF. The file
// implementation splits the address space across fixed-size segment files
// so front truncation can drop whole segments.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;

/// Append-oriented block device addressed by absolute log offsets.
pub trait StorageDevice: Send + Sync {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Read exactly `buf.len()` bytes at `offset`. Reading a truncated
    /// region is an I/O error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Durably persist all prior writes.
    fn flush(&self) -> Result<()>;

    /// Drop storage wholly below `offset`. Partial segments survive.
    fn truncate_until(&self, offset: u64) -> Result<()>;

    /// Lowest offset still readable.
    fn begin_offset(&self) -> u64;
}

/// Segmented file device: offset `o` lives in segment `o / segment_size`,
/// stored as `<dir>/<base>.<segment>` and pre-sized on creation.
pub struct SegmentedFileDevice {
    dir: PathBuf,
    base: String,
    segment_size: u64,
    segments: RwLock<BTreeMap<u64, Arc<File>>>,
    begin: AtomicU64,
}

impl SegmentedFileDevice {
    pub fn open(dir: impl Into<PathBuf>, base: &str, segment_size: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug_assert!(segment_size > 0);

        let device = Self {
            dir,
            base: base.to_string(),
            segment_size,
            segments: RwLock::new(BTreeMap::new()),
            begin: AtomicU64::new(0),
        };
        device.scan_existing()?;
        Ok(device)
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.dir.join(format!("{}.{:05}", self.base, segment))
    }

    /// Pick up segments left by a previous run so reads after restart
    /// resolve, and set `begin` to the lowest surviving segment.
    fn scan_existing(&self) -> Result<()> {
        let prefix = format!("{}.", self.base);
        let mut lowest: Option<u64> = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(index) = name.strip_prefix(&prefix) {
                if let Ok(segment) = index.parse::<u64>() {
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(entry.path())?;
                    self.segments.write().insert(segment, Arc::new(file));
                    lowest = Some(lowest.map_or(segment, |l: u64| l.min(segment)));
                }
            }
        }
        if let Some(lowest) = lowest {
            self.begin
                .store(lowest * self.segment_size, Ordering::Release);
        }
        Ok(())
    }

    fn segment_file(&self, segment: u64) -> Result<Arc<File>> {
        if let Some(file) = self.segments.read().get(&segment) {
            return Ok(Arc::clone(file));
        }
        let mut segments = self.segments.write();
        if let Some(file) = segments.get(&segment) {
            return Ok(Arc::clone(file));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.segment_path(segment))?;
        file.set_len(self.segment_size)?;
        let file = Arc::new(file);
        segments.insert(segment, Arc::clone(&file));
        Ok(file)
    }

    /// Split `[offset, offset + len)` into per-segment chunks.
    fn chunks(&self, offset: u64, len: usize) -> Vec<(u64, u64, usize, usize)> {
        // (segment, in-segment offset, data offset, chunk len)
        let mut out = Vec::new();
        let mut remaining = len;
        let mut position = offset;
        let mut consumed = 0usize;
        while remaining > 0 {
            let segment = position / self.segment_size;
            let in_segment = position % self.segment_size;
            let chunk = remaining.min((self.segment_size - in_segment) as usize);
            out.push((segment, in_segment, consumed, chunk));
            position += chunk as u64;
            consumed += chunk;
            remaining -= chunk;
        }
        out
    }
}

impl StorageDevice for SegmentedFileDevice {
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        for (segment, in_segment, data_offset, len) in self.chunks(offset, data.len()) {
            let file = self.segment_file(segment)?;
            file.write_all_at(&data[data_offset..data_offset + len], in_segment)?;
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset < self.begin.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("offset {offset} was truncated"),
            )
            .into());
        }
        for (segment, in_segment, data_offset, len) in self.chunks(offset, buf.len()) {
            let file = {
                let segments = self.segments.read();
                segments.get(&segment).cloned()
            };
            let file = file.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("segment {segment} does not exist"),
                )
            })?;
            file.read_exact_at(&mut buf[data_offset..data_offset + len], in_segment)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let files: Vec<Arc<File>> = self.segments.read().values().cloned().collect();
        for file in files {
            file.sync_all()?;
        }
        Ok(())
    }

    fn truncate_until(&self, offset: u64) -> Result<()> {
        let last_dead = offset / self.segment_size; // segments strictly below remain partial
        let mut segments = self.segments.write();
        let dead: Vec<u64> = segments.range(..last_dead).map(|(s, _)| *s).collect();
        for segment in dead {
            segments.remove(&segment);
            std::fs::remove_file(self.segment_path(segment))?;
            debug!(segment, base = %self.base, "truncated log segment");
        }
        self.begin.fetch_max(
            segments
                .keys()
                .next()
                .map(|s| s * self.segment_size)
                .unwrap_or(offset),
            Ordering::AcqRel,
        );
        Ok(())
    }

    fn begin_offset(&self) -> u64 {
        self.begin.load(Ordering::Acquire)
    }
}
