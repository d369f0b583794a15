//! Device descriptor and lifecycle: create claims the backing device, reads
//! or initializes the metadata region, and registers the device; destroy
//! quiesces, unclaims and releases everything in reverse order.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::error;

use crate::backing::{BackingDev, BackingStore};
use crate::config::UbiBdevOpts;
use crate::error::UbiError;
use crate::io::aligned_buf::alloc_aligned;
use crate::metadata::{UBI_MAX_STRIPES, UBI_METADATA_SIZE, UbiMetadata};
use crate::registry::UbiRegistry;
use crate::request::{IoType, io_type_supported};
use crate::stripe::{StripeStatus, StripeTable};
use crate::testing::{self, FailPoint};

pub const UBI_STRIPE_SIZE_KB_MIN: u32 = 4;
pub const UBI_STRIPE_SIZE_KB_MAX: u32 = 8192;

/// Required alignment for direct-I/O buffers.
pub const UBI_ALIGNMENT_BYTES: u32 = 4096;

/// Layout of metadata and data on the backing device, derived at create time.
struct LayoutParams {
    stripe_block_count: u32,
    stripe_shift: u32,
    data_offset_blocks: u64,
    image_block_count: u64,
}

/// A virtual block device lazily materializing an image file onto a backing
/// device. Shared by every channel of the device; all mutable state is held
/// in relaxed atomics (see [`StripeTable`] and [`UbiMetadata`]).
pub struct UbiBdev {
    name: String,
    image_path: PathBuf,
    stripe_size_kb: u32,
    stripe_block_count: u32,
    stripe_shift: u32,
    data_offset_blocks: u64,
    image_block_count: u64,
    block_len: u32,
    /// Block count exported to the consumer (backing minus metadata region).
    block_count: u64,
    no_sync: bool,
    copy_on_read: bool,
    directio: bool,
    base: Arc<dyn BackingDev>,
    /// Thread where the backing device was opened. It must be closed on the
    /// same thread.
    open_thread: ThreadId,
    stripes: StripeTable,
    metadata: UbiMetadata,
}

impl std::fmt::Debug for UbiBdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UbiBdev")
            .field("name", &self.name)
            .field("image_path", &self.image_path)
            .finish_non_exhaustive()
    }
}

impl UbiBdev {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn base_name(&self) -> &str {
        self.base.name()
    }

    pub fn base(&self) -> &Arc<dyn BackingDev> {
        &self.base
    }

    pub fn stripe_size_kb(&self) -> u32 {
        self.stripe_size_kb
    }

    pub fn stripe_size_bytes(&self) -> u64 {
        self.stripe_size_kb as u64 * 1024
    }

    pub fn stripe_block_count(&self) -> u32 {
        self.stripe_block_count
    }

    pub fn stripe_shift(&self) -> u32 {
        self.stripe_shift
    }

    pub fn data_offset_blocks(&self) -> u64 {
        self.data_offset_blocks
    }

    pub fn image_block_count(&self) -> u64 {
        self.image_block_count
    }

    pub fn block_len(&self) -> u32 {
        self.block_len
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn no_sync(&self) -> bool {
        self.no_sync
    }

    pub fn copy_on_read(&self) -> bool {
        self.copy_on_read
    }

    pub fn directio(&self) -> bool {
        self.directio
    }

    pub fn alignment_bytes(&self) -> u32 {
        UBI_ALIGNMENT_BYTES
    }

    /// Number of backing blocks covered by the metadata region.
    pub fn metadata_block_count(&self) -> u64 {
        UBI_METADATA_SIZE as u64 / self.block_len as u64
    }

    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        io_type_supported(io_type)
    }

    pub fn stripes(&self) -> &StripeTable {
        &self.stripes
    }

    pub fn metadata(&self) -> &UbiMetadata {
        &self.metadata
    }

    pub fn stripe_of_block(&self, block: u64) -> u64 {
        block >> self.stripe_shift
    }

    pub fn stripe_status(&self, stripe: u64) -> StripeStatus {
        self.stripes.status(stripe)
    }

    /// Advance a stripe's status. Reaching `Fetched` also sets the stripe's
    /// bit in the in-memory metadata image, before any metadata write can
    /// persist it.
    pub fn set_stripe_status(&self, stripe: u64, status: StripeStatus) {
        self.stripes.set_status(stripe, status);
        if status == StripeStatus::Fetched {
            self.metadata.set_fetched(stripe as usize);
        }
    }

    /// Release the claim and close the backing descriptor, deferring the
    /// close to the opening thread when called from anywhere else.
    pub(crate) fn destruct(&self, registry: &UbiRegistry) {
        self.base.release();
        if thread::current().id() == self.open_thread {
            self.base.close();
        } else {
            registry.defer_close(self.open_thread, Arc::clone(&self.base));
        }
    }
}

/// Create a ubi bdev and register it with `registry`.
///
/// On failure every partially-acquired resource is released in reverse
/// acquisition order and the original error is returned.
pub fn create_ubi_bdev(
    opts: &UbiBdevOpts,
    store: &dyn BackingStore,
    registry: &UbiRegistry,
) -> Result<Arc<UbiBdev>, UbiError> {
    if testing::should_fail(FailPoint::DeviceAlloc) {
        return Err(UbiError::ResourceExhausted("device descriptor"));
    }
    if opts.name.is_empty() {
        return Err(UbiError::InvalidConfig("device name must not be empty".into()));
    }

    let base = store.open(&opts.base_bdev)?;
    base.claim()?;

    // From here on, failure must unwind the claim and close the descriptor.
    let result = build_device(opts, &base).and_then(|bdev| registry.insert(bdev));
    match result {
        Ok(bdev) => Ok(bdev),
        Err(e) => {
            error!(name = %opts.name, "create failed: {e}");
            base.release();
            base.close();
            Err(e)
        }
    }
}

fn build_device(opts: &UbiBdevOpts, base: &Arc<dyn BackingDev>) -> Result<UbiBdev, UbiError> {
    let layout = init_layout_params(opts, base)?;
    let metadata = read_metadata(opts, base)?;

    if metadata.stripe_size_shift_kb() != stripe_shift_kb(opts.stripe_size_kb) {
        return Err(UbiError::InvalidConfig(format!(
            "existing disk uses {} KiB stripes, configured {} KiB",
            1u32 << metadata.stripe_size_shift_kb(),
            opts.stripe_size_kb,
        )));
    }

    let stripes = StripeTable::new();
    for i in 0..UBI_MAX_STRIPES {
        if metadata.is_fetched(i) {
            stripes.set_status(i as u64, StripeStatus::Fetched);
            stripes.count_recovered();
        }
    }

    Ok(UbiBdev {
        name: opts.name.clone(),
        image_path: opts.image_path.clone(),
        stripe_size_kb: opts.stripe_size_kb,
        stripe_block_count: layout.stripe_block_count,
        stripe_shift: layout.stripe_shift,
        data_offset_blocks: layout.data_offset_blocks,
        image_block_count: layout.image_block_count,
        block_len: base.block_len(),
        block_count: base.block_count() - layout.data_offset_blocks,
        no_sync: opts.no_sync,
        copy_on_read: opts.copy_on_read,
        directio: opts.directio,
        base: Arc::clone(base),
        open_thread: thread::current().id(),
        stripes,
        metadata,
    })
}

fn stripe_shift_kb(stripe_size_kb: u32) -> u8 {
    stripe_size_kb.trailing_zeros() as u8
}

/// Validate the configuration and derive the on-device layout.
fn init_layout_params(
    opts: &UbiBdevOpts,
    base: &Arc<dyn BackingDev>,
) -> Result<LayoutParams, UbiError> {
    let image_meta = std::fs::metadata(&opts.image_path).map_err(|e| {
        UbiError::InvalidConfig(format!(
            "cannot stat image {}: {e}",
            opts.image_path.display()
        ))
    })?;
    if !image_meta.is_file() {
        return Err(UbiError::InvalidConfig(format!(
            "image {} is not a regular file",
            opts.image_path.display()
        )));
    }
    let image_size = image_meta.len();

    let block_len = base.block_len() as u64;
    let backing_bytes = base.block_count() * block_len;
    if backing_bytes < image_size + UBI_METADATA_SIZE as u64 {
        return Err(UbiError::InvalidConfig(
            "backing device is smaller than image + metadata size".into(),
        ));
    }

    let stripe_size_kb = opts.stripe_size_kb;
    if !(UBI_STRIPE_SIZE_KB_MIN..=UBI_STRIPE_SIZE_KB_MAX).contains(&stripe_size_kb) {
        return Err(UbiError::InvalidConfig(format!(
            "stripe_size_kb must be between {UBI_STRIPE_SIZE_KB_MIN} and {UBI_STRIPE_SIZE_KB_MAX} (inclusive), got {stripe_size_kb}",
        )));
    }
    if !stripe_size_kb.is_power_of_two() {
        return Err(UbiError::InvalidConfig(format!(
            "stripe_size_kb must be a power of 2, got {stripe_size_kb}",
        )));
    }

    let stripe_size_bytes = stripe_size_kb as u64 * 1024;
    if stripe_size_bytes < block_len {
        return Err(UbiError::InvalidConfig(format!(
            "stripe size ({stripe_size_bytes} bytes) can't be less than the backing block length ({block_len} bytes)",
        )));
    }
    if UBI_METADATA_SIZE as u64 % block_len != 0 {
        return Err(UbiError::InvalidConfig(format!(
            "metadata size ({UBI_METADATA_SIZE}) must be a multiple of the block length ({block_len})",
        )));
    }

    let image_stripes = image_size.div_ceil(stripe_size_bytes);
    if image_stripes > UBI_MAX_STRIPES as u64 {
        return Err(UbiError::InvalidConfig(format!(
            "image needs {image_stripes} stripes, the metadata region holds {UBI_MAX_STRIPES}",
        )));
    }

    let stripe_block_count = (stripe_size_bytes / block_len) as u32;
    Ok(LayoutParams {
        stripe_block_count,
        stripe_shift: stripe_block_count.trailing_zeros(),
        data_offset_blocks: UBI_METADATA_SIZE as u64 / block_len,
        image_block_count: image_size.div_ceil(block_len),
    })
}

/// Read the metadata region through a temporary backing channel and decode.
fn read_metadata(opts: &UbiBdevOpts, base: &Arc<dyn BackingDev>) -> Result<UbiMetadata, UbiError> {
    if testing::should_fail(FailPoint::MetadataChannel) {
        return Err(UbiError::ResourceExhausted("metadata read channel"));
    }
    let mut channel = base.open_channel()?;

    let buf = alloc_aligned(UBI_METADATA_SIZE);
    let num_blocks = UBI_METADATA_SIZE as u64 / base.block_len() as u64;
    channel.read_blocks(0, num_blocks, buf, 0)?;

    // Create is driven to completion; the poller is not running yet.
    let mut completions = Vec::with_capacity(1);
    while channel.poll_completions(&mut completions) == 0 {
        std::hint::spin_loop();
    }
    let completion = completions.pop().ok_or(UbiError::InternalError(
        "metadata read produced no completion",
    ))?;
    if let Some(err) = completion.error {
        return Err(UbiError::BackingIo(err));
    }
    let buf = completion.buf.ok_or(UbiError::InternalError(
        "metadata read completion lost its buffer",
    ))?;

    UbiMetadata::decode(&buf, stripe_shift_kb(opts.stripe_size_kb))
}

/// Unregister and tear down the device with the given name.
pub fn delete_ubi_bdev(name: &str, registry: &UbiRegistry) -> Result<(), UbiError> {
    let bdev = registry
        .remove(name)
        .ok_or_else(|| UbiError::NotFound(name.to_string()))?;
    bdev.destruct(registry);
    Ok(())
}
