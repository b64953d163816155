//! The device registry: the read side of the host USB
//! library, wrapped so the session layer only ever deals in busids and
//! devids, never raw `UsbHost` snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use crate::host::{DeviceSnapshot, HostUsbError, UsbHost};
use crate::proto::wire;

/// Wraps a [`UsbHost`] and answers `OP_DEVLIST`/`OP_IMPORT` queries.
///
/// Enumeration is never cached: every call re-queries the host library, so a
/// device unplugged between `OP_DEVLIST` and `OP_IMPORT` is simply absent
/// from the second call's results.
pub struct Registry<H: UsbHost> {
    host: H,
}

impl<H: UsbHost> Registry<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// All currently attached devices, for `OP_REQ_DEVLIST`.
    pub fn list(&self) -> Result<Vec<DeviceSnapshot>, HostUsbError> {
        self.host.list_devices()
    }

    /// A single device by busid, for `OP_REQ_IMPORT`.
    pub fn find(&self, busid: &str) -> Result<Option<DeviceSnapshot>, HostUsbError> {
        self.host.find_by_busid(busid)
    }

    /// Opens a device for exclusive use by an importing connection.
    pub fn open(&self, snapshot: &DeviceSnapshot) -> Result<H::Handle, HostUsbError> {
        self.host.open(snapshot)
    }

    /// Encodes the `OP_REQ_DEVLIST` reply body: a device count followed by
    /// each device's descriptor and interface records.
    pub fn encode_devlist_body(&self) -> Result<Vec<u8>, HostUsbError> {
        let devices = self.list()?;
        let mut out = Vec::new();
        out.extend_from_slice(&(devices.len() as u32).to_be_bytes());
        for dev in &devices {
            out.extend_from_slice(&wire::encode_device_desc(dev, true));
        }
        Ok(out)
    }
}

/// Tracks devices imported by a single connection, keyed by devid, so that
/// connection teardown can release exactly the handles it opened.
///
/// Handles are `Arc`-wrapped so a dispatch can be moved into
/// `spawn_blocking` without outliving the session.
pub struct ImportedDevices<Handle> {
    by_devid: HashMap<u32, Arc<Handle>>,
}

impl<Handle> Default for ImportedDevices<Handle> {
    fn default() -> Self {
        Self {
            by_devid: HashMap::new(),
        }
    }
}

impl<Handle> ImportedDevices<Handle> {
    pub fn insert(&mut self, devid: u32, handle: Handle) {
        self.by_devid.insert(devid, Arc::new(handle));
    }

    pub fn get(&self, devid: u32) -> Option<Arc<Handle>> {
        self.by_devid.get(&devid).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.by_devid.is_empty()
    }
}
