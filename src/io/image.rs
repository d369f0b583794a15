use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use tracing::warn;

use crate::error::UbiError;
use crate::io::platform::{configure_direct_io, direct_open_flags};
use crate::testing::{self, FailPoint};

/// Submission queue depth for asynchronous image reads. Sized to cover the
/// fetch slots plus a full window of concurrent direct reads.
pub const IMAGE_QUEUE_DEPTH: u32 = 128;

/// A completed image read.
#[derive(Debug, Clone, Copy)]
pub struct ImageCompletion {
    pub user_data: u64,
    /// Bytes read on success, negated errno on failure.
    pub result: i32,
}

struct QueuedRead {
    ptr: *mut u8,
    len: u32,
    offset: u64,
    user_data: u64,
}

enum RingBackend {
    #[cfg(target_os = "linux")]
    Uring(io_uring::IoUring),
    /// Sequential pread(2) fallback. Reads queued by `prep_read` execute in
    /// order at `submit` time; completions surface on the next poll, matching
    /// the shape of the ring path.
    Queue(VecDeque<QueuedRead>),
}

/// The per-channel image file handle plus its asynchronous read interface.
pub struct ImageFile {
    file: File,
    backend: RingBackend,
    completions: VecDeque<ImageCompletion>,
}

impl ImageFile {
    /// Open the image read-only (O_DIRECT when `directio` is set) and set up
    /// the submission/completion interface.
    pub fn open(path: &Path, directio: bool) -> Result<Self, UbiError> {
        if testing::should_fail(FailPoint::ImageOpen) {
            return Err(UbiError::ImageIo(std::io::Error::from_raw_os_error(
                libc::EINVAL,
            )));
        }

        let mut opts = OpenOptions::new();
        opts.read(true);
        if directio {
            opts.custom_flags(direct_open_flags());
        }
        let file = opts.open(path).map_err(UbiError::ImageIo)?;
        if directio {
            configure_direct_io(file.as_raw_fd()).map_err(UbiError::ImageIo)?;
        }

        let backend = Self::init_backend()?;
        Ok(Self {
            file,
            backend,
            completions: VecDeque::new(),
        })
    }

    #[cfg(target_os = "linux")]
    fn init_backend() -> Result<RingBackend, UbiError> {
        if testing::should_fail(FailPoint::RingInit) {
            return Err(UbiError::ResourceExhausted("image submission queue"));
        }
        match io_uring::IoUring::new(IMAGE_QUEUE_DEPTH) {
            Ok(ring) => Ok(RingBackend::Uring(ring)),
            Err(e) => {
                // io_uring can be unavailable (old kernels, seccomp). Fall
                // back to the sequential path rather than failing the channel.
                warn!("io_uring unavailable ({e}), using pread fallback");
                Ok(RingBackend::Queue(VecDeque::new()))
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn init_backend() -> Result<RingBackend, UbiError> {
        if testing::should_fail(FailPoint::RingInit) {
            return Err(UbiError::ResourceExhausted("image submission queue"));
        }
        Ok(RingBackend::Queue(VecDeque::new()))
    }

    /// Queue a read of `len` bytes at byte `offset` into `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to at least `len` writable bytes that stay valid and
    /// untouched until the completion tagged `user_data` has been observed.
    pub unsafe fn prep_read(
        &mut self,
        ptr: *mut u8,
        len: u32,
        offset: u64,
        user_data: u64,
    ) -> Result<(), UbiError> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            RingBackend::Uring(ring) => {
                use io_uring::{opcode, types};

                let sqe = opcode::Read::new(types::Fd(self.file.as_raw_fd()), ptr, len)
                    .offset(offset)
                    .build()
                    .user_data(user_data);

                // SAFETY: the buffer outlives the submission per this
                // function's contract.
                if unsafe { ring.submission().push(&sqe) }.is_err() {
                    // Queue full: flush what is pending and retry once.
                    ring.submit().map_err(UbiError::ImageIo)?;
                    if unsafe { ring.submission().push(&sqe) }.is_err() {
                        return Err(UbiError::ResourceExhausted("image submission queue"));
                    }
                }
                Ok(())
            }
            RingBackend::Queue(queue) => {
                queue.push_back(QueuedRead {
                    ptr,
                    len,
                    offset,
                    user_data,
                });
                Ok(())
            }
        }
    }

    /// Submit all queued reads. Returns the number of submissions handed to
    /// the kernel (ring path) or executed (fallback path).
    pub fn submit(&mut self) -> Result<usize, UbiError> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            RingBackend::Uring(ring) => ring.submit().map_err(UbiError::ImageIo),
            RingBackend::Queue(queue) => {
                let n = queue.len();
                let fd = self.file.as_raw_fd();
                while let Some(read) = queue.pop_front() {
                    let result = pread_full(fd, read.ptr, read.len as usize, read.offset);
                    self.completions.push_back(ImageCompletion {
                        user_data: read.user_data,
                        result,
                    });
                }
                Ok(n)
            }
        }
    }

    /// Drain up to `max` completions without blocking.
    pub fn peek_completions(&mut self, out: &mut Vec<ImageCompletion>, max: usize) -> usize {
        let mut n = 0;
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            RingBackend::Uring(ring) => {
                for cqe in ring.completion() {
                    out.push(ImageCompletion {
                        user_data: cqe.user_data(),
                        result: cqe.result(),
                    });
                    n += 1;
                    if n == max {
                        break;
                    }
                }
            }
            RingBackend::Queue(_) => {
                while n < max {
                    let Some(c) = self.completions.pop_front() else {
                        break;
                    };
                    out.push(c);
                    n += 1;
                }
            }
        }
        n
    }
}

/// Read `len` bytes at `offset`, retrying on short reads. Returns total bytes
/// read (possibly short at EOF) or a negated errno.
fn pread_full(fd: i32, ptr: *mut u8, len: usize, offset: u64) -> i32 {
    let mut total = 0usize;
    while total < len {
        let ret = unsafe {
            libc::pread(
                fd,
                ptr.add(total) as *mut libc::c_void,
                len - total,
                (offset + total as u64) as libc::off_t,
            )
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
            return -errno;
        }
        if ret == 0 {
            break; // EOF
        }
        total += ret as usize;
    }
    total as i32
}
