//! On-disk metadata region: a fixed 8 MiB prefix of the backing device
//! holding the magic, format version, stripe size, and one fetched bit per
//! stripe. The in-memory image is shared across channels, so the per-stripe
//! bits are relaxed atomics.

use std::sync::atomic::{AtomicU8, Ordering};

use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::UbiError;

/// Size of the metadata region on the backing device.
pub const UBI_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// Supports images up to 1 TiB at 1 MiB stripes.
pub const UBI_MAX_STRIPES: usize = 1024 * 1024;

pub const UBI_MAGIC: &[u8; UBI_MAGIC_SIZE] = b"BDEV_UBI\0";
pub const UBI_MAGIC_SIZE: usize = 9;

pub const UBI_VERSION_MAJOR: u16 = 0;
pub const UBI_VERSION_MINOR: u16 = 1;

/// Bytes reserved per stripe in the metadata region. Byte 0 bit 0 is the
/// fetched bit; the rest is reserved zero.
const STRIPE_HEADER_SIZE: usize = 4;

/// Fixed-size header at the start of the metadata region.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct MetadataHeader {
    magic: [u8; UBI_MAGIC_SIZE],
    version_major: U16,
    version_minor: U16,
    /// log2 of the stripe size in KiB. An 8-bit KiB count cannot represent
    /// sizes above 255 KiB, so the exponent is stored instead.
    stripe_size_shift_kb: u8,
}

const HEADER_SIZE: usize = size_of::<MetadataHeader>();

/// In-memory image of the metadata region.
#[derive(Debug)]
pub struct UbiMetadata {
    version_major: u16,
    version_minor: u16,
    stripe_size_shift_kb: u8,
    fetched_bits: Box<[AtomicU8]>,
}

fn zeroed_bits() -> Box<[AtomicU8]> {
    (0..UBI_MAX_STRIPES).map(|_| AtomicU8::new(0)).collect()
}

impl UbiMetadata {
    /// Fresh metadata for a new disk.
    pub fn new(stripe_size_shift_kb: u8) -> Self {
        Self {
            version_major: UBI_VERSION_MAJOR,
            version_minor: UBI_VERSION_MINOR,
            stripe_size_shift_kb,
            fetched_bits: zeroed_bits(),
        }
    }

    /// Decode the metadata region read from the backing device.
    ///
    /// An all-zero magic field means the device has never held a ubi bdev:
    /// the result is fresh metadata with `stripe_size_shift_kb` taken from
    /// the caller's configuration. Otherwise the magic and version are
    /// checked and the per-stripe fetched bits loaded.
    pub fn decode(buf: &[u8], config_shift_kb: u8) -> Result<Self, UbiError> {
        debug_assert!(buf.len() >= UBI_METADATA_SIZE);

        if buf[..UBI_MAGIC_SIZE].iter().all(|b| *b == 0) {
            return Ok(Self::new(config_shift_kb));
        }

        let header = MetadataHeader::ref_from_prefix(buf)
            .map_err(|_| UbiError::InvalidFormat)?
            .0;
        if header.magic != *UBI_MAGIC {
            return Err(UbiError::InvalidFormat);
        }

        let (major, minor) = (header.version_major.get(), header.version_minor.get());
        if major != UBI_VERSION_MAJOR || minor != UBI_VERSION_MINOR {
            return Err(UbiError::UnsupportedVersion { major, minor });
        }

        let metadata = Self {
            version_major: major,
            version_minor: minor,
            stripe_size_shift_kb: header.stripe_size_shift_kb,
            fetched_bits: zeroed_bits(),
        };
        for i in 0..UBI_MAX_STRIPES {
            let bit = buf[HEADER_SIZE + i * STRIPE_HEADER_SIZE] & 1;
            metadata.fetched_bits[i].store(bit, Ordering::Relaxed);
        }
        Ok(metadata)
    }

    /// Serialize the region into `out` (at least [`UBI_METADATA_SIZE`] bytes).
    pub fn encode_into(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= UBI_METADATA_SIZE);
        out[..UBI_METADATA_SIZE].fill(0);

        let header = MetadataHeader {
            magic: *UBI_MAGIC,
            version_major: U16::new(self.version_major),
            version_minor: U16::new(self.version_minor),
            stripe_size_shift_kb: self.stripe_size_shift_kb,
        };
        out[..HEADER_SIZE].copy_from_slice(header.as_bytes());

        for i in 0..UBI_MAX_STRIPES {
            out[HEADER_SIZE + i * STRIPE_HEADER_SIZE] =
                self.fetched_bits[i].load(Ordering::Relaxed);
        }
    }

    pub fn stripe_size_shift_kb(&self) -> u8 {
        self.stripe_size_shift_kb
    }

    pub fn is_fetched(&self, stripe: usize) -> bool {
        self.fetched_bits[stripe].load(Ordering::Relaxed) & 1 == 1
    }

    pub fn set_fetched(&self, stripe: usize) {
        self.fetched_bits[stripe].store(1, Ordering::Relaxed);
    }
}
