//! Shared fixture: a patterned image file and a file-backed base device,
//! plus a harness that drives a channel's poller to completion.
#![allow(dead_code)]

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use ubi_bdev::io::aligned_buf::{alloc_aligned, empty_buf};
use ubi_bdev::metadata::UBI_METADATA_SIZE;
use ubi_bdev::{
    CompletedIo, FileBackingStore, IoType, PollStatus, UbiBdev, UbiBdevOpts, UbiChannel, UbiIo,
    UbiRegistry, create_ubi_bdev,
};

pub const BLOCK_LEN: u32 = 512;
pub const BASE_NAME: &str = "base0";

/// Deterministic image content: byte at `offset` is `offset % 251`.
pub fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

pub fn image_bytes(start: u64, len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| pattern_byte(start + i)).collect()
}

pub struct TestBed {
    pub dir: TempDir,
    pub store: FileBackingStore,
    pub registry: UbiRegistry,
    pub image_path: PathBuf,
    pub image_size: u64,
    pub base_path: PathBuf,
}

impl TestBed {
    /// Build an image of `image_size` bytes and a base device big enough for
    /// it, the metadata region, and `base_extra` spare bytes.
    pub fn new(image_size: u64, base_extra: u64) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");

        let image_path = dir.path().join("image.raw");
        write_pattern_file(&image_path, image_size);

        let base_path = dir.path().join("base.raw");
        let base = File::create(&base_path).expect("create base file");
        base.set_len(UBI_METADATA_SIZE as u64 + image_size + base_extra)
            .expect("size base file");

        let store = FileBackingStore::new();
        store.add_file(BASE_NAME, &base_path, BLOCK_LEN);

        Self {
            dir,
            store,
            registry: UbiRegistry::new(),
            image_path,
            image_size,
            base_path,
        }
    }

    /// Register another base device file of `bytes` bytes under `name`.
    pub fn add_base(&self, name: &str, bytes: u64) -> PathBuf {
        let path = self.dir.path().join(format!("{name}.raw"));
        let f = File::create(&path).expect("create base file");
        f.set_len(bytes).expect("size base file");
        self.store.add_file(name, &path, BLOCK_LEN);
        path
    }

    /// Options for this bed's image and default base. Direct I/O is off so
    /// the tests run on any filesystem.
    pub fn opts(&self, name: &str, stripe_size_kb: u32) -> UbiBdevOpts {
        let mut opts = UbiBdevOpts::new(
            name,
            &self.image_path.to_string_lossy(),
            BASE_NAME,
        );
        opts.stripe_size_kb = stripe_size_kb;
        opts.directio = false;
        opts
    }

    pub fn create(&self, name: &str, stripe_size_kb: u32) -> Arc<UbiBdev> {
        create_ubi_bdev(&self.opts(name, stripe_size_kb), &self.store, &self.registry)
            .expect("create should succeed")
    }
}

fn write_pattern_file(path: &Path, size: u64) {
    let mut f = File::create(path).expect("create image file");
    let mut chunk = vec![0u8; 64 * 1024];
    let mut offset = 0u64;
    while offset < size {
        let n = chunk.len().min((size - offset) as usize);
        for (i, b) in chunk[..n].iter_mut().enumerate() {
            *b = pattern_byte(offset + i as u64);
        }
        f.write_all(&chunk[..n]).expect("write image file");
        offset += n as u64;
    }
    f.sync_all().expect("sync image file");
}

/// Drives a channel and correlates completions by token.
pub struct Harness {
    pub ch: UbiChannel,
    next_token: u64,
}

const MAX_POLLS: usize = 1_000_000;

impl Harness {
    pub fn new(bdev: &Arc<UbiBdev>) -> Self {
        Self {
            ch: UbiChannel::new(Arc::clone(bdev)).expect("channel create should succeed"),
            next_token: 1,
        }
    }

    fn submit_and_wait(&mut self, io: UbiIo) -> CompletedIo {
        let token = io.token;
        self.ch.submit(io);
        for _ in 0..MAX_POLLS {
            self.ch.poll();
            for done in self.ch.take_completions() {
                if done.io.token == token {
                    return done;
                }
            }
        }
        panic!("request {token} did not complete");
    }

    pub fn try_read(&mut self, block: u64, count: u64) -> (bool, Vec<u8>) {
        let token = self.next_token;
        self.next_token += 1;
        let done = self.submit_and_wait(UbiIo {
            kind: IoType::Read,
            block_offset: block,
            num_blocks: count,
            buf: empty_buf(),
            token,
        });
        let len = (count * BLOCK_LEN as u64) as usize;
        let data = done.io.buf.get(..len).map(<[u8]>::to_vec).unwrap_or_default();
        (done.success, data)
    }

    pub fn read(&mut self, block: u64, count: u64) -> Vec<u8> {
        let (ok, data) = self.try_read(block, count);
        assert!(ok, "read of block {block} (+{count}) failed");
        data
    }

    pub fn try_write(&mut self, block: u64, data: &[u8]) -> bool {
        assert_eq!(data.len() % BLOCK_LEN as usize, 0);
        let count = (data.len() / BLOCK_LEN as usize) as u64;
        let mut buf = alloc_aligned(data.len());
        buf.copy_from_slice(data);
        let token = self.next_token;
        self.next_token += 1;
        self.submit_and_wait(UbiIo {
            kind: IoType::Write,
            block_offset: block,
            num_blocks: count,
            buf,
            token,
        })
        .success
    }

    pub fn write(&mut self, block: u64, data: &[u8]) {
        assert!(self.try_write(block, data), "write of block {block} failed");
    }

    pub fn try_flush(&mut self, block: u64, count: u64) -> bool {
        let token = self.next_token;
        self.next_token += 1;
        self.submit_and_wait(UbiIo {
            kind: IoType::Flush,
            block_offset: block,
            num_blocks: count,
            buf: empty_buf(),
            token,
        })
        .success
    }

    pub fn flush(&mut self, block: u64, count: u64) {
        assert!(self.try_flush(block, count), "flush of block {block} failed");
    }

    /// Poll until the channel reports idle.
    pub fn quiesce(&mut self) {
        for _ in 0..MAX_POLLS {
            if self.ch.poll() == PollStatus::Idle {
                return;
            }
        }
        panic!("channel did not quiesce");
    }
}
