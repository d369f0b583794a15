//! Backing-device collaborator contract.
//!
//! The engine talks to its persistent backing store through these traits:
//! a named device that can be claimed and opened, and a per-channel handle
//! accepting asynchronous block reads, writes and flushes whose completions
//! are drained by the poller. A file-backed implementation ships here so the
//! engine runs stand-alone; production embeddings supply their own.

use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::UbiError;
use crate::io::aligned_buf::AlignedBuf;

/// A completed backing operation. `buf` returns the buffer lent to a read.
pub struct BackingCompletion {
    pub tag: u64,
    pub error: Option<std::io::Error>,
    pub buf: Option<AlignedBuf>,
}

impl BackingCompletion {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A named persistent block device that can back a ubi bdev.
pub trait BackingDev: Send + Sync {
    fn name(&self) -> &str;
    fn block_len(&self) -> u32;
    fn block_count(&self) -> u64;

    /// Take exclusive ownership. Fails if another device already claimed it.
    fn claim(&self) -> Result<(), UbiError>;
    fn release(&self);

    /// Close the underlying descriptor. Must run on the thread that opened
    /// the device; the caller enforces that.
    fn close(&self);

    fn open_channel(&self) -> Result<Box<dyn BackingChannel>, UbiError>;
}

/// Per-channel submission interface to a backing device.
///
/// Submissions return as soon as the operation is queued; results surface
/// through [`poll_completions`](BackingChannel::poll_completions) with the
/// caller's tag. Write data is consumed before `write_blocks` returns, so
/// the borrow does not outlive the call.
pub trait BackingChannel {
    fn read_blocks(
        &mut self,
        block_offset: u64,
        num_blocks: u64,
        buf: AlignedBuf,
        tag: u64,
    ) -> Result<(), UbiError>;

    fn write_blocks(
        &mut self,
        block_offset: u64,
        num_blocks: u64,
        data: &[u8],
        tag: u64,
    ) -> Result<(), UbiError>;

    fn flush_blocks(
        &mut self,
        block_offset: u64,
        num_blocks: u64,
        tag: u64,
    ) -> Result<(), UbiError>;

    /// Drain pending completions into `out`, returning how many were added.
    fn poll_completions(&mut self, out: &mut Vec<BackingCompletion>) -> usize;
}

/// Opens backing devices by name.
pub trait BackingStore {
    fn open(&self, name: &str) -> Result<Arc<dyn BackingDev>, UbiError>;
}

// ---- File-backed implementation ----

struct BaseEntry {
    path: PathBuf,
    block_len: u32,
    claimed: Arc<AtomicBool>,
}

/// A registry of plain files standing in for block devices.
pub struct FileBackingStore {
    entries: Mutex<HashMap<String, BaseEntry>>,
}

impl FileBackingStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register `path` (an existing, sized file) as backing device `name`.
    pub fn add_file(&self, name: &str, path: &Path, block_len: u32) {
        let mut entries = self.entries.lock().expect("backing store lock");
        entries.insert(
            name.to_string(),
            BaseEntry {
                path: path.to_path_buf(),
                block_len,
                claimed: Arc::new(AtomicBool::new(false)),
            },
        );
    }
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingStore for FileBackingStore {
    fn open(&self, name: &str) -> Result<Arc<dyn BackingDev>, UbiError> {
        let entries = self.entries.lock().expect("backing store lock");
        let entry = entries
            .get(name)
            .ok_or_else(|| UbiError::NotFound(name.to_string()))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&entry.path)
            .map_err(UbiError::BackingIo)?;
        let len = file.metadata().map_err(UbiError::BackingIo)?.len();

        Ok(Arc::new(FileBackingDev {
            name: name.to_string(),
            block_len: entry.block_len,
            block_count: len / entry.block_len as u64,
            claimed: Arc::clone(&entry.claimed),
            file: Mutex::new(Some(Arc::new(file))),
        }))
    }
}

/// A backing device implemented over a plain file.
pub struct FileBackingDev {
    name: String,
    block_len: u32,
    block_count: u64,
    claimed: Arc<AtomicBool>,
    file: Mutex<Option<Arc<std::fs::File>>>,
}

impl FileBackingDev {
    fn file(&self) -> Result<Arc<std::fs::File>, UbiError> {
        self.file
            .lock()
            .expect("backing file lock")
            .clone()
            .ok_or_else(|| {
                UbiError::BackingIo(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "backing device is closed",
                ))
            })
    }
}

impl BackingDev for FileBackingDev {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_len(&self) -> u32 {
        self.block_len
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn claim(&self) -> Result<(), UbiError> {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UbiError::InvalidConfig(format!(
                "backing device {} is already claimed",
                self.name
            )));
        }
        Ok(())
    }

    fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    fn close(&self) {
        *self.file.lock().expect("backing file lock") = None;
    }

    fn open_channel(&self) -> Result<Box<dyn BackingChannel>, UbiError> {
        Ok(Box::new(FileBackingChannel {
            file: self.file()?,
            block_len: self.block_len,
            completions: VecDeque::new(),
        }))
    }
}

/// Channel over a [`FileBackingDev`]. Operations execute at submission time;
/// completions are delivered on the next poll, preserving the asynchronous
/// call shape the engine expects.
struct FileBackingChannel {
    file: Arc<std::fs::File>,
    block_len: u32,
    completions: VecDeque<BackingCompletion>,
}

impl FileBackingChannel {
    fn push(&mut self, tag: u64, result: std::io::Result<()>, buf: Option<AlignedBuf>) {
        self.completions.push_back(BackingCompletion {
            tag,
            error: result.err(),
            buf,
        });
    }
}

impl BackingChannel for FileBackingChannel {
    fn read_blocks(
        &mut self,
        block_offset: u64,
        num_blocks: u64,
        mut buf: AlignedBuf,
        tag: u64,
    ) -> Result<(), UbiError> {
        let len = (num_blocks * self.block_len as u64) as usize;
        let offset = block_offset * self.block_len as u64;
        let result = self.file.read_exact_at(&mut buf[..len], offset);
        self.push(tag, result, Some(buf));
        Ok(())
    }

    fn write_blocks(
        &mut self,
        block_offset: u64,
        num_blocks: u64,
        data: &[u8],
        tag: u64,
    ) -> Result<(), UbiError> {
        let len = (num_blocks * self.block_len as u64) as usize;
        let offset = block_offset * self.block_len as u64;
        let result = self.file.write_all_at(&data[..len], offset);
        self.push(tag, result, None);
        Ok(())
    }

    fn flush_blocks(
        &mut self,
        _block_offset: u64,
        _num_blocks: u64,
        tag: u64,
    ) -> Result<(), UbiError> {
        // Files have no ranged flush; sync everything.
        let result = self.file.sync_data();
        self.push(tag, result, None);
        Ok(())
    }

    fn poll_completions(&mut self, out: &mut Vec<BackingCompletion>) -> usize {
        let n = self.completions.len();
        out.extend(self.completions.drain(..));
        n
    }
}
