//! Stripe fetch engine: a bounded pool of in-flight fetches per channel.
//! Each fetch reads one stripe from the image file and writes it back to the
//! backing device's data region before the stripe is marked fetched.

use tracing::error;

use crate::channel::{PendingOp, UbiChannel, fetch_tag};
use crate::io::aligned_buf::{AlignedBuf, alloc_aligned};
use crate::stripe::{StripeQueue, StripeStatus};

/// Concurrent stripe fetches per channel.
pub const UBI_MAX_ACTIVE_STRIPE_FETCHES: usize = 8;

/// One fetch in flight: the stripe being fetched and the buffer its image
/// bytes land in. The buffer is allocated once, aligned for direct I/O.
pub(crate) struct FetchSlot {
    pub(crate) active: bool,
    pub(crate) stripe_idx: u32,
    pub(crate) buf: AlignedBuf,
}

pub(crate) struct FetchEngine {
    pub(crate) slots: Vec<FetchSlot>,
    pub(crate) queue: StripeQueue,
}

impl FetchEngine {
    pub(crate) fn new(stripe_size_bytes: usize) -> Self {
        Self {
            slots: (0..UBI_MAX_ACTIVE_STRIPE_FETCHES)
                .map(|_| FetchSlot {
                    active: false,
                    stripe_idx: 0,
                    buf: alloc_aligned(stripe_size_bytes),
                })
                .collect(),
            queue: StripeQueue::new(),
        }
    }

    pub(crate) fn next_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.active)
    }

    pub(crate) fn any_active(&self) -> bool {
        self.slots.iter().any(|s| s.active)
    }
}

impl UbiChannel {
    /// Hand queued stripes to free fetch slots until either runs out.
    pub(crate) fn start_queued_fetches(&mut self) {
        loop {
            let Some(slot) = self.fetch.next_free() else {
                break;
            };
            let Some(stripe) = self.fetch.queue.dequeue() else {
                break;
            };
            let s = &mut self.fetch.slots[slot];
            s.active = true;
            s.stripe_idx = stripe;
            self.stats.stripes_fetched += 1;
            self.start_fetch_read(slot);
        }
    }

    /// Submit the image read for the stripe assigned to `slot`.
    fn start_fetch_read(&mut self, slot: usize) {
        let stripe = self.fetch.slots[slot].stripe_idx;
        let nbytes = self.bdev.stripe_size_bytes();
        let offset = nbytes * stripe as u64;
        let ptr = self.fetch.slots[slot].buf.as_mut_ptr();

        // SAFETY: the slot buffer is owned by the slot and untouched until
        // this tag's completion frees it.
        let result = unsafe { self.image.prep_read(ptr, nbytes as u32, offset, fetch_tag(slot)) }
            .and_then(|_| self.image.submit().map(drop));
        if let Err(e) = result {
            error!(
                bdev = self.bdev.name(),
                "fetching stripe {stripe} failed, submit error: {e}"
            );
            self.fail_stripe_fetch(slot);
        }
    }

    /// The image read for `slot` finished; write the stripe to the backing
    /// device's data region.
    pub(crate) fn complete_fetch_read(&mut self, slot: usize, result: i32) {
        let stripe = self.fetch.slots[slot].stripe_idx;
        if result < 0 {
            error!(
                bdev = self.bdev.name(),
                "fetching stripe {stripe} failed: {}",
                std::io::Error::from_raw_os_error(-result)
            );
            self.fail_stripe_fetch(slot);
            return;
        }

        let offset =
            self.bdev.data_offset_blocks() + stripe as u64 * self.bdev.stripe_block_count() as u64;
        let num_blocks = self.bdev.stripe_block_count() as u64;
        let tag = self.pending.insert(PendingOp::FetchWrite { slot });
        if let Err(e) =
            self.base
                .write_blocks(offset, num_blocks, &self.fetch.slots[slot].buf, tag)
        {
            error!(
                bdev = self.bdev.name(),
                "fetching stripe {stripe} failed, backing write error: {e}"
            );
            self.pending.remove(tag);
            self.fail_stripe_fetch(slot);
        }
    }

    /// The backing write-back for `slot` finished: the stripe is now
    /// materialized (or the fetch failed).
    pub(crate) fn finish_fetch_write(&mut self, slot: usize, success: bool) {
        if !success {
            let stripe = self.fetch.slots[slot].stripe_idx;
            error!(
                bdev = self.bdev.name(),
                "write-back of stripe {stripe} failed"
            );
            self.fail_stripe_fetch(slot);
            return;
        }
        let stripe = self.fetch.slots[slot].stripe_idx as u64;
        self.bdev.set_stripe_status(stripe, StripeStatus::Fetched);
        self.bdev.stripes().count_fetched();
        self.fetch.slots[slot].active = false;
    }

    pub(crate) fn fail_stripe_fetch(&mut self, slot: usize) {
        let stripe = self.fetch.slots[slot].stripe_idx as u64;
        self.bdev.set_stripe_status(stripe, StripeStatus::Failed);
        self.fetch.slots[slot].active = false;
    }
}
