//! [`UsbHost`] adapter backed by `rusb` (libusb bindings).
//!
//! This is the crate's one real external collaborator: enumeration, open,
//! and transfer submission are all `rusb` calls, following the same shape
//! other USB/IP server implementations use to talk to libusb (see e.g. how
//! `rusb::devices()` and `Device::open()` are wired up in the wider
//! ecosystem). We only adapt that API to [`UsbHost`]/[`UsbHandle`]; we do
//! not reimplement any of it.

use std::sync::Mutex;
use std::time::Duration;

use rusb::{Direction, GlobalContext, TransferType, UsbContext};

use super::{
    ConfigurationInfo, DeviceSnapshot, EndpointDirection, EndpointInfo, EndpointType,
    HostUsbError, InterfaceInfo, Speed, UsbHandle, UsbHost,
};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

impl From<rusb::Error> for HostUsbError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Pipe => HostUsbError::Pipe,
            rusb::Error::NotFound => HostUsbError::NotFound,
            rusb::Error::Access | rusb::Error::Busy => HostUsbError::Busy,
            other => HostUsbError::Other(other.to_string()),
        }
    }
}

fn speed_of(speed: rusb::Speed) -> Speed {
    match speed {
        rusb::Speed::Low => Speed::Low,
        rusb::Speed::Full => Speed::Full,
        rusb::Speed::High => Speed::High,
        rusb::Speed::Super | rusb::Speed::SuperPlus => Speed::Super,
        _ => Speed::Unknown,
    }
}

fn endpoint_type_of(t: TransferType) -> EndpointType {
    match t {
        TransferType::Bulk => EndpointType::Bulk,
        TransferType::Interrupt => EndpointType::Interrupt,
        TransferType::Isochronous => EndpointType::Isochronous,
        TransferType::Control => EndpointType::Bulk, // never queried for EP0
    }
}

/// A [`UsbHost`] that enumerates real devices via libusb's default context.
pub struct RusbHost {
    context: GlobalContext,
}

impl Default for RusbHost {
    fn default() -> Self {
        Self {
            context: GlobalContext::default(),
        }
    }
}

impl RusbHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot_of(&self, dev: &rusb::Device<GlobalContext>) -> Result<DeviceSnapshot, HostUsbError> {
        let desc = dev.device_descriptor()?;

        let mut configurations = Vec::with_capacity(desc.num_configurations() as usize);
        for cfg_idx in 0..desc.num_configurations() {
            let Ok(cfg) = dev.config_descriptor(cfg_idx) else {
                continue;
            };
            let mut interfaces = Vec::new();
            for intf in cfg.interfaces() {
                // Only the first alt setting is summarized, §4.2.
                let Some(first) = intf.descriptors().next() else {
                    continue;
                };
                let endpoints = first
                    .endpoint_descriptors()
                    .map(|ep| EndpointInfo {
                        address: ep.address(),
                        transfer_type: endpoint_type_of(ep.transfer_type()),
                        direction: match ep.direction() {
                            Direction::In => EndpointDirection::In,
                            Direction::Out => EndpointDirection::Out,
                        },
                    })
                    .collect();
                interfaces.push(InterfaceInfo {
                    class: first.class_code(),
                    subclass: first.sub_class_code(),
                    protocol: first.protocol_code(),
                    endpoints,
                });
            }
            configurations.push(ConfigurationInfo {
                value: cfg.number(),
                interfaces,
            });
        }

        // Try to read the live active configuration; fall back to the
        // first configuration's value if the device can't be opened
        //.
        let configuration_value = match dev.open() {
            Ok(handle) => handle
                .active_configuration()
                .unwrap_or_else(|_| configurations.first().map(|c| c.value).unwrap_or(0)),
            Err(_) => configurations.first().map(|c| c.value).unwrap_or(0),
        };

        Ok(DeviceSnapshot {
            bus_number: dev.bus_number(),
            device_address: dev.address(),
            speed: speed_of(dev.speed()),
            id_vendor: desc.vendor_id(),
            id_product: desc.product_id(),
            bcd_device: desc.device_version().into(),
            device_class: desc.class_code(),
            device_subclass: desc.sub_class_code(),
            device_protocol: desc.protocol_code(),
            configuration_value,
            configurations,
        })
    }

    fn find_rusb_device(&self, snapshot: &DeviceSnapshot) -> Result<rusb::Device<GlobalContext>, HostUsbError> {
        rusb::devices()?
            .iter()
            .find(|d| {
                d.bus_number() == snapshot.bus_number && d.address() == snapshot.device_address
            })
            .ok_or(HostUsbError::NotFound)
    }
}

impl UsbHost for RusbHost {
    type Handle = RusbHandle;

    fn list_devices(&self) -> Result<Vec<DeviceSnapshot>, HostUsbError> {
        let list = rusb::devices()?;
        list.iter().map(|d| self.snapshot_of(&d)).collect()
    }

    fn open(&self, snapshot: &DeviceSnapshot) -> Result<Self::Handle, HostUsbError> {
        let dev = self.find_rusb_device(snapshot)?;
        let handle = dev.open()?;
        Ok(RusbHandle {
            handle: Mutex::new(handle),
        })
    }
}

/// An open libusb device handle. `rusb::DeviceHandle` is `Sync` for control
/// transfers but we still serialize through a mutex since a connection may
/// issue overlapping blocking calls via `spawn_blocking`.
pub struct RusbHandle {
    handle: Mutex<rusb::DeviceHandle<GlobalContext>>,
}

impl UsbHandle for RusbHandle {
    fn get_configuration(&self) -> Result<u8, HostUsbError> {
        Ok(self.handle.lock().unwrap().active_configuration()?)
    }

    fn set_configuration(&self, value: u8) -> Result<(), HostUsbError> {
        Ok(self.handle.lock().unwrap().set_active_configuration(value)?)
    }

    fn claim_interface(&self, index: u8) -> Result<(), HostUsbError> {
        match self.handle.lock().unwrap().claim_interface(index) {
            Ok(()) => Ok(()),
            Err(rusb::Error::Busy) => Ok(()), // already claimed by us: idempotent
            Err(e) => Err(e.into()),
        }
    }

    fn set_interface_alt_setting(&self, index: u8, alt: u8) -> Result<(), HostUsbError> {
        Ok(self
            .handle
            .lock()
            .unwrap()
            .set_alternate_setting(index, alt)?)
    }

    fn control_read(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        length: u16,
    ) -> Result<Vec<u8>, HostUsbError> {
        let mut buf = vec![0u8; length as usize];
        let n = self.handle.lock().unwrap().read_control(
            bm_request_type,
            b_request,
            w_value,
            w_index,
            &mut buf,
            CONTROL_TIMEOUT,
        )?;
        buf.truncate(n);
        Ok(buf)
    }

    fn control_write(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        data: &[u8],
    ) -> Result<usize, HostUsbError> {
        Ok(self.handle.lock().unwrap().write_control(
            bm_request_type,
            b_request,
            w_value,
            w_index,
            data,
            CONTROL_TIMEOUT,
        )?)
    }

    fn bulk_transfer_in(&self, ep: u8, length: usize) -> Result<Vec<u8>, HostUsbError> {
        let mut buf = vec![0u8; length];
        let n = self
            .handle
            .lock()
            .unwrap()
            .read_bulk(ep | 0x80, &mut buf, TRANSFER_TIMEOUT)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn bulk_transfer_out(&self, ep: u8, data: &[u8]) -> Result<usize, HostUsbError> {
        Ok(self
            .handle
            .lock()
            .unwrap()
            .write_bulk(ep & 0x7f, data, TRANSFER_TIMEOUT)?)
    }

    fn interrupt_transfer_in(&self, ep: u8, length: usize) -> Result<Vec<u8>, HostUsbError> {
        let mut buf = vec![0u8; length];
        let n = self
            .handle
            .lock()
            .unwrap()
            .read_interrupt(ep | 0x80, &mut buf, TRANSFER_TIMEOUT)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn interrupt_transfer_out(&self, ep: u8, data: &[u8]) -> Result<usize, HostUsbError> {
        Ok(self
            .handle
            .lock()
            .unwrap()
            .write_interrupt(ep & 0x7f, data, TRANSFER_TIMEOUT)?)
    }
}
