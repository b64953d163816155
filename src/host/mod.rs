//! The "host USB library" contract: everything the registry and
//! URB dispatcher need from whatever actually talks to USB hardware.
//!
//! This is deliberately the boundary of the crate's core: enumeration,
//! device open/close, and transfer submission are someone else's problem
//! (`rusb`, in the [`rusb_backend`] adapter) and are only ever reached
//! through the [`UsbHost`] / [`UsbHandle`] traits below. [`simulated`]
//! implements the same traits over an in-memory table, so the registry,
//! session and dispatcher are fully testable without a real bus.

#[cfg(feature = "rusb-host")]
pub mod rusb_backend;
pub mod simulated;

use thiserror::Error;

/// USB speeds as enumerated by the host library, before wire mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Unknown,
    Low,
    Full,
    High,
    Super,
    Variable,
}

impl Speed {
    /// Wire speed value: SUPER is reported as HIGH because the
    /// USB/IP protocol version this server speaks (0x0111) predates USB 3's
    /// own wire-speed encoding.
    pub fn wire_value(self) -> u32 {
        match self {
            Speed::Unknown => 0,
            Speed::Low => 1,
            Speed::Full => 2,
            Speed::High => 3,
            Speed::Super => 3,
            Speed::Variable => 4,
        }
    }
}

/// Transfer type of a non-control endpoint, as needed to route `CMD_SUBMIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Bulk,
    Interrupt,
    Isochronous,
}

/// Direction of an endpoint, independent of the URB's own direction field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub transfer_type: EndpointType,
    pub direction: EndpointDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationInfo {
    pub value: u8,
    pub interfaces: Vec<InterfaceInfo>,
}

/// Metadata needed to build a device descriptor on the wire without holding
/// the device open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub bus_number: u8,
    pub device_address: u8,
    pub speed: Speed,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// The active configuration value, or the first configuration's value
    /// if the device could not be opened to query it.
    pub configuration_value: u8,
    pub configurations: Vec<ConfigurationInfo>,
}

impl DeviceSnapshot {
    /// `"<bus>-<addr>"`, the textual identifier used during `OP_IMPORT`.
    pub fn busid(&self) -> String {
        format!("{}-{}", self.bus_number, self.device_address)
    }

    /// `(bus<<16)|addr`. The alternative `(bus<<8)|addr` packing seen in some
    /// USB/IP implementations is rejected here since it collides for
    /// multi-bus setups once either field exceeds a byte.
    pub fn devid(&self) -> u32 {
        ((self.bus_number as u32) << 16) | self.device_address as u32
    }

    /// The synthetic sysfs-like path reported in the device descriptor.
    pub fn path(&self) -> String {
        format!("pyusbip/{}/{}", self.bus_number, self.device_address)
    }

    /// Number of interfaces in the currently active configuration, or 0 if
    /// `configuration_value` doesn't match any known configuration.
    pub fn active_num_interfaces(&self) -> u8 {
        self.active_configuration()
            .map(|c| c.interfaces.len() as u8)
            .unwrap_or(0)
    }

    pub fn active_configuration(&self) -> Option<&ConfigurationInfo> {
        self.configurations
            .iter()
            .find(|c| c.value == self.configuration_value)
    }
}

/// Errors the host USB library can raise. Distinguishes a stalled endpoint
/// from everything else, since only that case maps to a distinct errno on
/// the wire.
#[derive(Debug, Error, Clone)]
pub enum HostUsbError {
    #[error("endpoint stalled (pipe error)")]
    Pipe,
    #[error("device not found")]
    NotFound,
    #[error("device busy or permission denied")]
    Busy,
    #[error("host usb error: {0}")]
    Other(String),
}

/// Enumeration and device-open contract.
pub trait UsbHost: Send + Sync {
    type Handle: UsbHandle;

    /// Snapshot every currently attached device. Queried anew on every
    /// `OP_DEVLIST` and `OP_IMPORT` — no caching.
    fn list_devices(&self) -> Result<Vec<DeviceSnapshot>, HostUsbError>;

    /// Find a single device by its `busid`, re-enumerating fresh.
    fn find_by_busid(&self, busid: &str) -> Result<Option<DeviceSnapshot>, HostUsbError> {
        Ok(self
            .list_devices()?
            .into_iter()
            .find(|d| d.busid() == busid))
    }

    /// Open the device for exclusive use by the importing connection.
    fn open(&self, snapshot: &DeviceSnapshot) -> Result<Self::Handle, HostUsbError>;
}

/// An open device handle, owned by exactly one connection.
pub trait UsbHandle: Send {
    fn get_configuration(&self) -> Result<u8, HostUsbError>;
    fn set_configuration(&self, value: u8) -> Result<(), HostUsbError>;
    /// Idempotent: claiming an already-claimed interface succeeds.
    fn claim_interface(&self, index: u8) -> Result<(), HostUsbError>;
    fn set_interface_alt_setting(&self, index: u8, alt: u8) -> Result<(), HostUsbError>;

    fn control_read(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        length: u16,
    ) -> Result<Vec<u8>, HostUsbError>;

    fn control_write(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        data: &[u8],
    ) -> Result<usize, HostUsbError>;

    fn bulk_transfer_in(&self, ep: u8, length: usize) -> Result<Vec<u8>, HostUsbError>;
    fn bulk_transfer_out(&self, ep: u8, data: &[u8]) -> Result<usize, HostUsbError>;
    fn interrupt_transfer_in(&self, ep: u8, length: usize) -> Result<Vec<u8>, HostUsbError>;
    fn interrupt_transfer_out(&self, ep: u8, data: &[u8]) -> Result<usize, HostUsbError>;
}
