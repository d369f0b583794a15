//! Block request and completion types exchanged with the host framework.

use crate::io::aligned_buf::AlignedBuf;

/// Block I/O operation kinds. Only `Read`, `Write` and `Flush` are serviced;
/// the rest exist so hosts can query support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    Read,
    Write,
    Flush,
    WriteZeroes,
    Unmap,
    Reset,
}

/// Which I/O types this device services. Read and write are the baseline;
/// flush is supported to provide crash recovery. Write-zeroes, unmap and
/// reset are not implemented.
pub fn io_type_supported(io_type: IoType) -> bool {
    matches!(io_type, IoType::Read | IoType::Write | IoType::Flush)
}

/// A block request submitted by the host.
///
/// The buffer belongs to the host: it carries the data for writes, receives
/// the data for reads (the channel allocates one if it arrives empty), and is
/// returned with the completion either way. `token` is an opaque host
/// correlation value.
pub struct UbiIo {
    pub kind: IoType,
    pub block_offset: u64,
    pub num_blocks: u64,
    pub buf: AlignedBuf,
    pub token: u64,
}

/// A finished request, handed back through [`crate::channel::UbiChannel::take_completions`].
pub struct CompletedIo {
    pub io: UbiIo,
    pub success: bool,
}
