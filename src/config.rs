//! Create-time options and the JSON config round-trip.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::UbiBdev;

pub const DEFAULT_STRIPE_SIZE_KB: u32 = 1024;

/// Parameters to create a ubi bdev.
#[derive(Debug, Clone, Deserialize)]
pub struct UbiBdevOpts {
    pub name: String,
    pub image_path: PathBuf,
    pub base_bdev: String,
    #[serde(default = "default_stripe_size_kb")]
    pub stripe_size_kb: u32,
    #[serde(default)]
    pub no_sync: bool,
    #[serde(default = "default_true")]
    pub copy_on_read: bool,
    #[serde(default = "default_true")]
    pub directio: bool,
}

fn default_stripe_size_kb() -> u32 {
    DEFAULT_STRIPE_SIZE_KB
}

fn default_true() -> bool {
    true
}

impl UbiBdevOpts {
    pub fn new(name: &str, image_path: &str, base_bdev: &str) -> Self {
        Self {
            name: name.to_string(),
            image_path: PathBuf::from(image_path),
            base_bdev: base_bdev.to_string(),
            stripe_size_kb: DEFAULT_STRIPE_SIZE_KB,
            no_sync: false,
            copy_on_read: true,
            directio: true,
        }
    }
}

/// One entry of the startup config: replaying it through the RPC surface
/// recreates the device. Field order is part of the emitted format.
#[derive(Serialize)]
struct ConfigEntry<'a> {
    method: &'static str,
    params: ConfigParams<'a>,
}

#[derive(Serialize)]
struct ConfigParams<'a> {
    name: &'a str,
    base_bdev: &'a str,
    image_path: &'a str,
    stripe_size_kb: u32,
    copy_on_read: bool,
    directio: bool,
    no_sync: bool,
}

/// Emit the JSON object that reconstructs `bdev` on restart.
pub fn write_config(bdev: &UbiBdev) -> String {
    let image_path = bdev.image_path().to_string_lossy();
    let entry = ConfigEntry {
        method: "bdev_ubi_create",
        params: ConfigParams {
            name: bdev.name(),
            base_bdev: bdev.base_name(),
            image_path: &image_path,
            stripe_size_kb: bdev.stripe_size_kb(),
            copy_on_read: bdev.copy_on_read(),
            directio: bdev.directio(),
            no_sync: bdev.no_sync(),
        },
    };
    serde_json::to_string(&entry).expect("config serialization cannot fail")
}
