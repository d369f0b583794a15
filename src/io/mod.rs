pub mod aligned_buf;
pub mod image;
pub mod platform;
