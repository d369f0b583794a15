//! Process-scoped fault injection for tests.
//!
//! Each fail point guards one allocation or system call in the create or
//! channel-setup paths. Setting a point makes the guarded step fail with the
//! error it would produce under real resource pressure. Points are plain
//! atomic flags; call [`reset`] between tests.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Allocation of the device descriptor in create.
    DeviceAlloc,
    /// Creation of the temporary backing channel used for the metadata read.
    MetadataChannel,
    /// Registration of the per-channel poller.
    PollerRegister,
    /// Creation of the per-channel backing channel.
    BaseChannel,
    /// Opening the image file.
    ImageOpen,
    /// Initialization of the image submission queue.
    RingInit,
}

const NUM_POINTS: usize = 6;

static FLAGS: [AtomicBool; NUM_POINTS] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

fn index(point: FailPoint) -> usize {
    match point {
        FailPoint::DeviceAlloc => 0,
        FailPoint::MetadataChannel => 1,
        FailPoint::PollerRegister => 2,
        FailPoint::BaseChannel => 3,
        FailPoint::ImageOpen => 4,
        FailPoint::RingInit => 5,
    }
}

/// Force the given point to fail (or stop doing so).
pub fn set_fail(point: FailPoint, fail: bool) {
    FLAGS[index(point)].store(fail, Ordering::Relaxed);
}

/// Clear all fail points.
pub fn reset() {
    for flag in &FLAGS {
        flag.store(false, Ordering::Relaxed);
    }
}

pub(crate) fn should_fail(point: FailPoint) -> bool {
    FLAGS[index(point)].load(Ordering::Relaxed)
}
