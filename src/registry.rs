//! Process-wide set of live devices, used for duplicate-name rejection,
//! delete-by-name, and backing-device event dispatch. Also owns the queue of
//! deferred descriptor closes waiting for their opening thread.

use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use tracing::warn;

use crate::backing::BackingDev;
use crate::device::UbiBdev;
use crate::error::UbiError;

struct DeferredClose {
    thread: ThreadId,
    base: Arc<dyn BackingDev>,
}

/// Registry of live ubi bdevs. One per embedding; created at module init and
/// dropped at teardown.
pub struct UbiRegistry {
    devices: Mutex<Vec<Arc<UbiBdev>>>,
    deferred: Mutex<Vec<DeferredClose>>,
}

impl UbiRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    /// Register a freshly-created device. Rejects duplicate names.
    pub(crate) fn insert(&self, bdev: UbiBdev) -> Result<Arc<UbiBdev>, UbiError> {
        let mut devices = self.devices.lock().expect("registry lock");
        if devices.iter().any(|d| d.name() == bdev.name()) {
            return Err(UbiError::InvalidConfig(format!(
                "a bdev named {} already exists",
                bdev.name()
            )));
        }
        let bdev = Arc::new(bdev);
        devices.push(Arc::clone(&bdev));
        Ok(bdev)
    }

    pub fn get(&self, name: &str) -> Option<Arc<UbiBdev>> {
        let devices = self.devices.lock().expect("registry lock");
        devices.iter().find(|d| d.name() == name).cloned()
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<UbiBdev>> {
        let mut devices = self.devices.lock().expect("registry lock");
        let idx = devices.iter().position(|d| d.name() == name)?;
        Some(devices.swap_remove(idx))
    }

    /// Find the device owning the given backing device, if any.
    pub fn find_by_base(&self, base_name: &str) -> Option<Arc<UbiBdev>> {
        let devices = self.devices.lock().expect("registry lock");
        devices.iter().find(|d| d.base_name() == base_name).cloned()
    }

    /// Handle removal of a backing device: release the claim and close the
    /// descriptor of the device built on it.
    pub fn handle_base_removal(&self, base_name: &str) {
        let Some(bdev) = self.find_by_base(base_name) else {
            warn!("base bdev to remove '{base_name}' not found");
            return;
        };
        bdev.base().release();
        bdev.base().close();
    }

    /// Queue a descriptor close for the thread that opened it.
    pub(crate) fn defer_close(&self, thread: ThreadId, base: Arc<dyn BackingDev>) {
        let mut deferred = self.deferred.lock().expect("registry lock");
        deferred.push(DeferredClose { thread, base });
    }

    /// Execute deferred closes belonging to the calling thread. The host runs
    /// this on each control context. Returns how many closes ran.
    pub fn run_control_messages(&self) -> usize {
        let me = thread::current().id();
        let mut deferred = self.deferred.lock().expect("registry lock");
        let mut ran = 0;
        deferred.retain(|d| {
            if d.thread == me {
                d.base.close();
                ran += 1;
                false
            } else {
                true
            }
        });
        ran
    }

    /// Number of deferred closes still waiting for their thread.
    pub fn pending_control_messages(&self) -> usize {
        self.deferred.lock().expect("registry lock").len()
    }
}

impl Default for UbiRegistry {
    fn default() -> Self {
        Self::new()
    }
}
