//! ubi-bdev: a virtual block device that lazily materializes a read-only
//! disk image onto a persistent backing device, stripe by stripe. Once a
//! stripe has been copied the backing device is the system of record; a
//! crash-consistent metadata region records which stripes are durable.
//!
//! The crate is the per-device I/O engine: device lifecycle
//! ([`device::create_ubi_bdev`] / [`device::delete_ubi_bdev`]), the
//! per-channel cooperative poller ([`channel::UbiChannel`]), the stripe
//! fetch engine, the two-phase flush protocol, and the backing-device
//! collaborator traits ([`backing`]) with a file-backed implementation.

pub mod backing;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod fetch;
pub mod flush;
pub mod io;
pub mod metadata;
pub mod registry;
pub mod request;
pub mod rpc;
pub mod stripe;
pub mod testing;

pub use backing::{BackingChannel, BackingDev, BackingStore, FileBackingStore};
pub use channel::{PollStatus, UbiChannel};
pub use config::{UbiBdevOpts, write_config};
pub use device::{UbiBdev, create_ubi_bdev, delete_ubi_bdev};
pub use error::UbiError;
pub use registry::UbiRegistry;
pub use request::{CompletedIo, IoType, UbiIo, io_type_supported};
pub use stripe::StripeStatus;
