//! Two-phase flush protocol.
//!
//! A flush request first flushes the backing data range. If stripes were
//! fetched since the last metadata flush, the full metadata region is then
//! written and flushed; only after that does `stripes_flushed` advance to
//! the snapshot taken before the write. Any step's failure fails the
//! request; previously-fetched stripes stay valid.

use tracing::error;

use crate::channel::{PendingOp, UbiChannel};
use crate::error::UbiError;
use crate::io::aligned_buf::alloc_aligned;
use crate::metadata::UBI_METADATA_SIZE;
use crate::request::UbiIo;

impl UbiChannel {
    /// Step A: flush the data range on the backing device.
    pub(crate) fn start_flush(&mut self, io: UbiIo) {
        if self.bdev.no_sync() {
            self.complete_request(io, true);
            return;
        }

        let start = io.block_offset + self.bdev.data_offset_blocks();
        let num_blocks = io.num_blocks;
        let tag = self.pending.insert(PendingOp::FlushData(io));
        if let Err(e) = self.base.flush_blocks(start, num_blocks, tag) {
            error!(
                bdev = self.bdev.name(),
                "flush (start: {start}, len: {num_blocks}) failed, data flush error: {e}"
            );
            self.fail_pending(tag);
        }
    }

    /// Step A finished. Complete if the metadata is clean, else begin step B:
    /// write the metadata region against a snapshot of the fetched count.
    pub(crate) fn flush_data_done(&mut self, io: UbiIo, success: bool) {
        if !success {
            error!(
                bdev = self.bdev.name(),
                "flush (start: {}, len: {}) failed (data flush failure)",
                io.block_offset,
                io.num_blocks
            );
            self.complete_request(io, false);
            return;
        }

        let stripes = self.bdev.stripes();
        if stripes.stripes_fetched() == stripes.stripes_flushed() {
            self.complete_request(io, true);
            return;
        }

        // Fetch completions that land after this snapshot are persisted by
        // the next flush, not this one.
        let snapshot = stripes.stripes_fetched();
        {
            let buf = self
                .meta_buf
                .get_or_insert_with(|| alloc_aligned(UBI_METADATA_SIZE));
            self.bdev.metadata().encode_into(buf);
        }

        let num_blocks = self.bdev.metadata_block_count();
        let tag = self.pending.insert(PendingOp::MetadataWrite { io, snapshot });
        let write_result = match &self.meta_buf {
            Some(meta) => self.base.write_blocks(0, num_blocks, meta, tag),
            None => Err(UbiError::InternalError("metadata staging buffer missing")),
        };
        if let Err(e) = write_result {
            error!(
                bdev = self.bdev.name(),
                "flush failed, metadata write error: {e}"
            );
            self.fail_pending(tag);
        }
    }

    /// Step B finished; step C flushes the metadata blocks.
    pub(crate) fn metadata_write_done(&mut self, io: UbiIo, snapshot: u64, success: bool) {
        if !success {
            error!(
                bdev = self.bdev.name(),
                "flush (start: {}, len: {}) failed (metadata write failure)",
                io.block_offset,
                io.num_blocks
            );
            self.complete_request(io, false);
            return;
        }

        let num_blocks = self.bdev.metadata_block_count();
        let tag = self.pending.insert(PendingOp::MetadataFlush { io, snapshot });
        if let Err(e) = self.base.flush_blocks(0, num_blocks, tag) {
            error!(
                bdev = self.bdev.name(),
                "flush failed, metadata flush error: {e}"
            );
            self.fail_pending(tag);
        }
    }

    /// Step C finished: the fetched bits written in step B are durable.
    pub(crate) fn metadata_flush_done(&mut self, io: UbiIo, snapshot: u64, success: bool) {
        if !success {
            error!(
                bdev = self.bdev.name(),
                "flush (start: {}, len: {}) failed (metadata flush failure)",
                io.block_offset,
                io.num_blocks
            );
            self.complete_request(io, false);
            return;
        }

        self.bdev.stripes().raise_flushed(snapshot);
        self.complete_request(io, true);
    }
}
