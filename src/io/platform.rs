use std::os::fd::RawFd;

/// Configure direct I/O on the given file descriptor.
///
/// - Linux: O_DIRECT is set at open time (see image.rs).
/// - macOS: Uses fcntl(F_NOCACHE) to disable the buffer cache.
#[cfg(target_os = "macos")]
pub fn configure_direct_io(fd: RawFd) -> std::io::Result<()> {
    // F_NOCACHE = 48 on macOS
    let ret = unsafe { libc::fcntl(fd, libc::F_NOCACHE, 1) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
pub fn configure_direct_io(_fd: RawFd) -> std::io::Result<()> {
    Ok(())
}

/// Extra open(2) flags for direct I/O on this platform.
#[cfg(target_os = "linux")]
pub fn direct_open_flags() -> libc::c_int {
    libc::O_DIRECT
}

#[cfg(not(target_os = "linux"))]
pub fn direct_open_flags() -> libc::c_int {
    0
}
