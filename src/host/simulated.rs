//! In-memory [`UsbHost`] used for tests and the `--simulated` CLI flag.
//!
//! No real bus access, no root required. Records every call made against a
//! handle so scenario tests can assert on side effects (e.g. that
//! `SET_CONFIGURATION` actually called `set_configuration` on the handle
//! rather than forwarding a control transfer to the device), the same way
//! the wider USB/IP ecosystem ships a `new_simulated` constructor alongside
//! a real-hardware one.

use std::sync::{Arc, Mutex};

use super::{DeviceSnapshot, HostUsbError, UsbHandle, UsbHost};

#[derive(Debug, Default, Clone)]
pub struct CallLog {
    pub set_configuration: Vec<u8>,
    pub claimed_interfaces: Vec<u8>,
    pub alt_settings: Vec<(u8, u8)>,
    pub control_reads: Vec<(u8, u8, u16, u16, u16)>,
    pub control_writes: Vec<(u8, u8, u16, u16, Vec<u8>)>,
    pub bulk_in: Vec<(u8, usize)>,
    pub bulk_out: Vec<(u8, Vec<u8>)>,
}

/// A fake device: the snapshot it reports plus scripted responses for
/// pass-through transfers.
pub struct SimulatedDevice {
    pub snapshot: DeviceSnapshot,
    /// Response returned from `control_read`/`bulk_transfer_in`/etc,
    /// regardless of the specific request — enough for the scenarios this
    /// server needs to cover.
    pub canned_in_response: Vec<u8>,
    /// If set, every transfer on this device fails with this error instead
    /// of succeeding (used to exercise the stall/error-mapping path).
    pub fail_with: Option<HostUsbError>,
}

pub struct SimulatedHost {
    devices: Vec<SimulatedDevice>,
}

impl SimulatedHost {
    pub fn new(devices: Vec<SimulatedDevice>) -> Self {
        Self { devices }
    }

    pub fn empty() -> Self {
        Self { devices: Vec::new() }
    }
}

impl UsbHost for SimulatedHost {
    type Handle = SimulatedHandle;

    fn list_devices(&self) -> Result<Vec<DeviceSnapshot>, HostUsbError> {
        Ok(self.devices.iter().map(|d| d.snapshot.clone()).collect())
    }

    fn open(&self, snapshot: &DeviceSnapshot) -> Result<Self::Handle, HostUsbError> {
        let dev = self
            .devices
            .iter()
            .find(|d| d.snapshot.busid() == snapshot.busid())
            .ok_or(HostUsbError::NotFound)?;
        Ok(SimulatedHandle {
            configuration: Mutex::new(snapshot.configuration_value),
            canned_in_response: dev.canned_in_response.clone(),
            fail_with: dev.fail_with.clone(),
            log: Arc::new(Mutex::new(CallLog::default())),
        })
    }
}

/// An open handle to a simulated device.
pub struct SimulatedHandle {
    configuration: Mutex<u8>,
    canned_in_response: Vec<u8>,
    fail_with: Option<HostUsbError>,
    log: Arc<Mutex<CallLog>>,
}

impl SimulatedHandle {
    pub fn calls(&self) -> CallLog {
        self.log.lock().unwrap().clone()
    }

    fn maybe_fail(&self) -> Result<(), HostUsbError> {
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl UsbHandle for SimulatedHandle {
    fn get_configuration(&self) -> Result<u8, HostUsbError> {
        Ok(*self.configuration.lock().unwrap())
    }

    fn set_configuration(&self, value: u8) -> Result<(), HostUsbError> {
        self.maybe_fail()?;
        *self.configuration.lock().unwrap() = value;
        self.log.lock().unwrap().set_configuration.push(value);
        Ok(())
    }

    fn claim_interface(&self, index: u8) -> Result<(), HostUsbError> {
        self.maybe_fail()?;
        let mut log = self.log.lock().unwrap();
        if !log.claimed_interfaces.contains(&index) {
            log.claimed_interfaces.push(index);
        }
        Ok(())
    }

    fn set_interface_alt_setting(&self, index: u8, alt: u8) -> Result<(), HostUsbError> {
        self.maybe_fail()?;
        self.log.lock().unwrap().alt_settings.push((index, alt));
        Ok(())
    }

    fn control_read(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        length: u16,
    ) -> Result<Vec<u8>, HostUsbError> {
        self.maybe_fail()?;
        self.log
            .lock()
            .unwrap()
            .control_reads
            .push((bm_request_type, b_request, w_value, w_index, length));
        let mut resp = self.canned_in_response.clone();
        resp.truncate(length as usize);
        Ok(resp)
    }

    fn control_write(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        data: &[u8],
    ) -> Result<usize, HostUsbError> {
        self.maybe_fail()?;
        self.log.lock().unwrap().control_writes.push((
            bm_request_type,
            b_request,
            w_value,
            w_index,
            data.to_vec(),
        ));
        Ok(data.len())
    }

    fn bulk_transfer_in(&self, ep: u8, length: usize) -> Result<Vec<u8>, HostUsbError> {
        self.maybe_fail()?;
        self.log.lock().unwrap().bulk_in.push((ep, length));
        let mut resp = self.canned_in_response.clone();
        resp.truncate(length);
        Ok(resp)
    }

    fn bulk_transfer_out(&self, ep: u8, data: &[u8]) -> Result<usize, HostUsbError> {
        self.maybe_fail()?;
        self.log
            .lock()
            .unwrap()
            .bulk_out
            .push((ep, data.to_vec()));
        Ok(data.len())
    }

    fn interrupt_transfer_in(&self, ep: u8, length: usize) -> Result<Vec<u8>, HostUsbError> {
        self.bulk_transfer_in(ep, length)
    }

    fn interrupt_transfer_out(&self, ep: u8, data: &[u8]) -> Result<usize, HostUsbError> {
        self.bulk_transfer_out(ep, data)
    }
}
