//! Per-channel I/O engine: the request FIFO, the pending-operation table,
//! and the cooperative poller that drains image and backing completions and
//! services queued requests in arrival order.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use tracing::{error, info};

use crate::backing::{BackingChannel, BackingCompletion};
use crate::device::UbiBdev;
use crate::error::UbiError;
use crate::fetch::FetchEngine;
use crate::io::aligned_buf::{AlignedBuf, alloc_aligned, empty_buf};
use crate::io::image::{ImageCompletion, ImageFile};
use crate::request::{CompletedIo, IoType, UbiIo};
use crate::stripe::StripeStatus;
use crate::testing::{self, FailPoint};

/// Cap on reads being serviced at once; at the cap the dispatcher pauses
/// draining for the rest of the iteration.
pub const UBI_MAX_CONCURRENT_READS: u32 = 64;

/// Completions drained from the image ring per poll iteration.
const IMAGE_COMPLETION_BATCH: usize = 64;

/// What a poll iteration accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Work moved, or fetches are still outstanding.
    Busy,
    /// Nothing to do.
    Idle,
}

/// An operation in flight against the backing device or the image file. The
/// completion tag indexes into [`PendingTable`]; matching on the variant
/// replaces the pointer-tagged user data of callback-style frameworks.
pub(crate) enum PendingOp {
    /// Backing read servicing a request; the request travels with the op.
    BackingRead(UbiIo),
    /// Backing write servicing a request.
    BackingWrite(UbiIo),
    /// Write-back of a fetched stripe held in the given fetch slot.
    FetchWrite { slot: usize },
    /// Flush step A: backing data flush.
    FlushData(UbiIo),
    /// Flush step B: metadata region write, with the fetched-count snapshot.
    MetadataWrite { io: UbiIo, snapshot: u64 },
    /// Flush step C: metadata region flush.
    MetadataFlush { io: UbiIo, snapshot: u64 },
    /// Direct image read into the request's buffer (copy-on-read disabled).
    ImageRead(UbiIo),
}

impl PendingOp {
    fn into_io(self) -> Option<UbiIo> {
        match self {
            PendingOp::BackingRead(io)
            | PendingOp::BackingWrite(io)
            | PendingOp::FlushData(io)
            | PendingOp::MetadataWrite { io, .. }
            | PendingOp::MetadataFlush { io, .. }
            | PendingOp::ImageRead(io) => Some(io),
            PendingOp::FetchWrite { .. } => None,
        }
    }
}

/// Slot table for in-flight operations. Tags are slot indices; freed slots
/// are reused, so the table stays as small as the channel's concurrency.
pub(crate) struct PendingTable {
    slots: Vec<Option<PendingOp>>,
    free: Vec<usize>,
    len: usize,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, op: PendingOp) -> u64 {
        self.len += 1;
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(op);
                idx as u64
            }
            None => {
                self.slots.push(Some(op));
                (self.slots.len() - 1) as u64
            }
        }
    }

    pub(crate) fn remove(&mut self, tag: u64) -> Option<PendingOp> {
        let idx = tag as usize;
        let op = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.len -= 1;
        Some(op)
    }

    pub(crate) fn get_mut(&mut self, tag: u64) -> Option<&mut PendingOp> {
        self.slots.get_mut(tag as usize)?.as_mut()
    }

    /// Buffer of the request held at `tag`, for handing to a backing write.
    pub(crate) fn io_data(&self, tag: u64) -> &[u8] {
        match self.slots.get(tag as usize).and_then(|s| s.as_ref()) {
            Some(PendingOp::BackingWrite(io)) => &io.buf[..],
            _ => &[],
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Image-ring tags: fetch completions carry the slot index, direct reads the
/// pending-table tag with a kind bit in the upper half.
const IMAGE_TAG_DIRECT: u64 = 1 << 32;

pub(crate) fn fetch_tag(slot: usize) -> u64 {
    slot as u64
}

fn direct_tag(pending: u64) -> u64 {
    IMAGE_TAG_DIRECT | pending
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelStats {
    pub blocks_read: u64,
    pub blocks_written: u64,
    pub stripes_fetched: u64,
}

/// Per-execution-context state for a ubi bdev: fetch slots, request FIFO,
/// image file handle and the backing channel. Driven by [`poll`](Self::poll).
pub struct UbiChannel {
    pub(crate) bdev: Arc<UbiBdev>,
    pub(crate) base: Box<dyn BackingChannel>,
    pub(crate) image: ImageFile,
    pub(crate) fetch: FetchEngine,
    pub(crate) queue: VecDeque<UbiIo>,
    pub(crate) pending: PendingTable,
    pub(crate) completed: Vec<CompletedIo>,
    pub(crate) active_reads: u32,
    /// Direct image reads prepared this iteration, submitted as one batch.
    prepared_reads: u32,
    /// Lazily-allocated staging buffer for metadata region writes.
    pub(crate) meta_buf: Option<AlignedBuf>,
    pub(crate) stats: ChannelStats,
    image_events: Vec<ImageCompletion>,
    backing_events: Vec<BackingCompletion>,
}

impl UbiChannel {
    pub fn new(bdev: Arc<UbiBdev>) -> Result<Self, UbiError> {
        if testing::should_fail(FailPoint::PollerRegister) {
            return Err(UbiError::ResourceExhausted("poller registration"));
        }
        if testing::should_fail(FailPoint::BaseChannel) {
            return Err(UbiError::ResourceExhausted("backing channel"));
        }
        let base = bdev.base().open_channel()?;
        let image = ImageFile::open(bdev.image_path(), bdev.directio())?;
        let fetch = FetchEngine::new(bdev.stripe_size_bytes() as usize);

        Ok(Self {
            bdev,
            base,
            image,
            fetch,
            queue: VecDeque::new(),
            pending: PendingTable::new(),
            completed: Vec::new(),
            active_reads: 0,
            prepared_reads: 0,
            meta_buf: None,
            stats: ChannelStats::default(),
            image_events: Vec::with_capacity(IMAGE_COMPLETION_BATCH),
            backing_events: Vec::new(),
        })
    }

    pub fn bdev(&self) -> &Arc<UbiBdev> {
        &self.bdev
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Accept a block request. Writes (and reads, when copy-on-read is on)
    /// touching an unfetched image stripe enqueue a fetch for it; the request
    /// itself is queued and serviced by the poller once the stripe is ready.
    pub fn submit(&mut self, io: UbiIo) {
        let bdev = Arc::clone(&self.bdev);
        if matches!(io.kind, IoType::Read | IoType::Write) {
            let start_block = io.block_offset;
            let end_block = start_block + io.num_blocks.saturating_sub(1);
            let start_stripe = bdev.stripe_of_block(start_block);
            if start_stripe != bdev.stripe_of_block(end_block) {
                // The host is configured to split on the stripe boundary.
                error!(
                    bdev = bdev.name(),
                    "BUG: I/O ({start_block}+{}) cannot span stripe boundary",
                    io.num_blocks
                );
                self.complete_request(io, false);
                return;
            }
            if io.kind == IoType::Write
                && io.buf.len() < (io.num_blocks * bdev.block_len() as u64) as usize
            {
                error!(bdev = bdev.name(), "write buffer shorter than the request");
                self.complete_request(io, false);
                return;
            }

            if (io.kind == IoType::Write || bdev.copy_on_read())
                && start_block < bdev.image_block_count()
                && bdev.stripe_status(start_stripe) == StripeStatus::NotFetched
            {
                self.fetch.queue.enqueue(start_stripe as u32);
                bdev.set_stripe_status(start_stripe, StripeStatus::InFlight);
            }
        }

        self.queue.push_back(io);
    }

    /// One poller iteration: drain completions, assign fetch slots, service
    /// queued requests, submit batched image reads.
    pub fn poll(&mut self) -> PollStatus {
        let queues_empty = self.queue.is_empty() && self.fetch.queue.is_empty();
        let completed = self.complete_image_io() + self.complete_backing_io();

        if queues_empty && completed == 0 {
            if self.pending.is_empty() && !self.fetch.any_active() {
                return PollStatus::Idle;
            }
            // Nothing queued, but in-flight operations still owe completions.
            return PollStatus::Busy;
        }

        self.start_queued_fetches();
        self.drain_requests();

        if self.prepared_reads > 0 {
            match self.image.submit() {
                Ok(_) => self.prepared_reads = 0,
                // Keep prepared_reads so the submit is retried next iteration.
                Err(e) => error!(bdev = self.bdev.name(), "image submit failed: {e}"),
            }
        }

        PollStatus::Busy
    }

    /// Hand back every request finished since the last call.
    pub fn take_completions(&mut self) -> Vec<CompletedIo> {
        mem::take(&mut self.completed)
    }

    pub(crate) fn complete_request(&mut self, io: UbiIo, success: bool) {
        self.completed.push(CompletedIo { io, success });
    }

    fn complete_image_io(&mut self) -> usize {
        let mut events = mem::take(&mut self.image_events);
        events.clear();
        self.image
            .peek_completions(&mut events, IMAGE_COMPLETION_BATCH);
        let n = events.len();
        for ev in events.drain(..) {
            if ev.user_data & IMAGE_TAG_DIRECT != 0 {
                self.complete_direct_read(ev.user_data & !IMAGE_TAG_DIRECT, ev.result);
            } else {
                self.complete_fetch_read(ev.user_data as usize, ev.result);
            }
        }
        self.image_events = events;
        n
    }

    fn complete_backing_io(&mut self) -> usize {
        let mut events = mem::take(&mut self.backing_events);
        events.clear();
        self.base.poll_completions(&mut events);
        let n = events.len();
        for ev in events.drain(..) {
            let ok = ev.ok();
            if let Some(err) = &ev.error {
                error!(bdev = self.bdev.name(), "backing I/O failed: {err}");
            }
            match self.pending.remove(ev.tag) {
                Some(PendingOp::BackingRead(mut io)) => {
                    if let Some(buf) = ev.buf {
                        io.buf = buf;
                    }
                    self.active_reads = self.active_reads.saturating_sub(1);
                    self.complete_request(io, ok);
                }
                Some(PendingOp::BackingWrite(io)) => self.complete_request(io, ok),
                Some(PendingOp::FetchWrite { slot }) => self.finish_fetch_write(slot, ok),
                Some(PendingOp::FlushData(io)) => self.flush_data_done(io, ok),
                Some(PendingOp::MetadataWrite { io, snapshot }) => {
                    self.metadata_write_done(io, snapshot, ok)
                }
                Some(PendingOp::MetadataFlush { io, snapshot }) => {
                    self.metadata_flush_done(io, snapshot, ok)
                }
                Some(PendingOp::ImageRead(_)) | None => {
                    error!(
                        bdev = self.bdev.name(),
                        "BUG: stray backing completion (tag {})", ev.tag
                    );
                }
            }
        }
        self.backing_events = events;
        n
    }

    /// Service queued requests in arrival order. A request blocked on an
    /// in-flight stripe halts the drain so requests behind it keep their
    /// ordering; failed stripes fail their requests on the spot.
    fn drain_requests(&mut self) {
        while let Some(front) = self.queue.front() {
            if front.kind == IoType::Read && self.active_reads >= UBI_MAX_CONCURRENT_READS {
                break;
            }

            let start_block = front.block_offset;
            if front.kind != IoType::Flush && start_block < self.bdev.image_block_count() {
                let stripe = self.bdev.stripe_of_block(start_block);
                match self.bdev.stripe_status(stripe) {
                    StripeStatus::Failed => {
                        // The fetch for this stripe did not succeed.
                        let io = self.pop_front();
                        self.complete_request(io, false);
                        continue;
                    }
                    StripeStatus::InFlight => break,
                    StripeStatus::NotFetched
                        if front.kind != IoType::Read || self.bdev.copy_on_read() =>
                    {
                        // submit() enqueues the fetch before queueing the
                        // request, so this state is unreachable.
                        error!(
                            bdev = self.bdev.name(),
                            "BUG: I/O for block {start_block} enqueued, but stripe {stripe} isn't",
                        );
                        let io = self.pop_front();
                        self.complete_request(io, false);
                        continue;
                    }
                    StripeStatus::NotFetched | StripeStatus::Fetched => {}
                }
            }

            let io = self.pop_front();
            match io.kind {
                IoType::Read => self.dispatch_read(io),
                IoType::Write => self.dispatch_write(io),
                IoType::Flush => self.start_flush(io),
                _ => self.complete_request(io, false),
            }
        }
    }

    fn pop_front(&mut self) -> UbiIo {
        match self.queue.pop_front() {
            Some(io) => io,
            // drain_requests only pops after inspecting front().
            None => unreachable!("request queue drained concurrently"),
        }
    }

    fn dispatch_read(&mut self, mut io: UbiIo) {
        let len = (io.num_blocks * self.bdev.block_len() as u64) as usize;
        if io.buf.len() < len {
            // Acquire the data buffer on the host's behalf.
            io.buf = alloc_aligned(len);
        }
        self.stats.blocks_read += io.num_blocks;
        self.active_reads += 1;

        let start_block = io.block_offset;
        let in_image = start_block < self.bdev.image_block_count();
        if !in_image
            || self.bdev.stripe_status(self.bdev.stripe_of_block(start_block))
                == StripeStatus::Fetched
        {
            let offset = start_block + self.bdev.data_offset_blocks();
            let num_blocks = io.num_blocks;
            let buf = mem::replace(&mut io.buf, empty_buf());
            let tag = self.pending.insert(PendingOp::BackingRead(io));
            if let Err(e) = self.base.read_blocks(offset, num_blocks, buf, tag) {
                error!(bdev = self.bdev.name(), "backing read submit failed: {e}");
                self.fail_pending(tag);
            }
        } else {
            self.start_direct_read(io, len);
        }
    }

    /// Serve a read of an unfetched stripe straight from the image file,
    /// without promoting the stripe.
    fn start_direct_read(&mut self, io: UbiIo, len: usize) {
        let offset = io.block_offset * self.bdev.block_len() as u64;
        let tag = self.pending.insert(PendingOp::ImageRead(io));
        let ptr = match self.pending.get_mut(tag) {
            Some(PendingOp::ImageRead(io)) => io.buf.as_mut_ptr(),
            _ => {
                self.fail_pending(tag);
                return;
            }
        };

        // SAFETY: the request (and its buffer) stays in the pending table
        // until this tag's completion is observed; the buffer storage is
        // heap-allocated and does not move when the table grows.
        let prep = unsafe { self.image.prep_read(ptr, len as u32, offset, direct_tag(tag)) };
        match prep {
            Ok(()) => self.prepared_reads += 1,
            Err(e) => {
                error!(bdev = self.bdev.name(), "image read submit failed: {e}");
                self.fail_pending(tag);
            }
        }
    }

    fn complete_direct_read(&mut self, tag: u64, result: i32) {
        match self.pending.remove(tag) {
            Some(PendingOp::ImageRead(io)) => {
                if result < 0 {
                    error!(
                        bdev = self.bdev.name(),
                        "image read for block {} failed: {}",
                        io.block_offset,
                        std::io::Error::from_raw_os_error(-result)
                    );
                }
                self.active_reads = self.active_reads.saturating_sub(1);
                self.complete_request(io, result >= 0);
            }
            _ => error!(bdev = self.bdev.name(), "BUG: stray image completion"),
        }
    }

    fn dispatch_write(&mut self, io: UbiIo) {
        self.stats.blocks_written += io.num_blocks;
        let offset = io.block_offset + self.bdev.data_offset_blocks();
        let num_blocks = io.num_blocks;
        let tag = self.pending.insert(PendingOp::BackingWrite(io));
        if let Err(e) = self
            .base
            .write_blocks(offset, num_blocks, self.pending.io_data(tag), tag)
        {
            error!(bdev = self.bdev.name(), "backing write submit failed: {e}");
            self.fail_pending(tag);
        }
    }

    /// Fail and complete whatever request is parked at `tag`.
    pub(crate) fn fail_pending(&mut self, tag: u64) {
        if let Some(op) = self.pending.remove(tag) {
            let was_read = matches!(op, PendingOp::BackingRead(_) | PendingOp::ImageRead(_));
            if let Some(io) = op.into_io() {
                if was_read {
                    self.active_reads = self.active_reads.saturating_sub(1);
                }
                self.complete_request(io, false);
            }
        }
    }
}

impl Drop for UbiChannel {
    fn drop(&mut self) {
        info!(
            "stats for {}: blocks read: {}, blocks written: {}, stripes fetched: {}",
            self.bdev.name(),
            self.stats.blocks_read,
            self.stats.blocks_written,
            self.stats.stripes_fetched
        );
    }
}
