use aligned_vec::{AVec, ConstAlign};

/// Alignment required for direct-I/O buffers (4096 bytes covers all common
/// block devices and page-granular O_DIRECT requirements).
pub const BUF_ALIGN: usize = 4096;

pub type AlignedBuf = AVec<u8, ConstAlign<BUF_ALIGN>>;

/// Create a new aligned buffer of `size` bytes, zeroed.
pub fn alloc_aligned(size: usize) -> AlignedBuf {
    AVec::from_iter(BUF_ALIGN, std::iter::repeat_n(0u8, size))
}

/// An empty aligned buffer (no allocation).
pub fn empty_buf() -> AlignedBuf {
    AVec::new(BUF_ALIGN)
}
