//! URB dispatch: turns a decoded `CMD_SUBMIT` into a call
//! against an open [`UsbHandle`], and its result back into a `RET_SUBMIT`.
//!
//! EP0 gets special treatment: `SET_CONFIGURATION`, `SET_INTERFACE` and
//! `SET_ADDRESS` are executed against the handle directly and never reach the
//! device as a real control transfer. Every other control
//! request on EP0 passes through unchanged. Non-EP0 endpoints are routed by
//! their known transfer type; isochronous endpoints are rejected outright.

use crate::error::{status_for, SessionError};
use crate::host::{DeviceSnapshot, EndpointDirection, EndpointType, HostUsbError, UsbHandle};
use crate::proto::wire::SetupPacket;
use crate::proto::{
    RECIP_DEVICE, RECIP_INTERFACE, REQUEST_SET_ADDRESS, REQUEST_SET_CONFIGURATION,
    REQUEST_SET_INTERFACE, REQUEST_TYPE_DIR_IN, USBIP_DIR_IN,
};

/// The outcome of dispatching one `CMD_SUBMIT`: a status plus whatever data
/// should be copied back for an IN transfer.
pub struct UrbResult {
    pub status: i32,
    pub data: Vec<u8>,
}

impl UrbResult {
    fn ok(data: Vec<u8>) -> Self {
        Self { status: 0, data }
    }

    fn from_err(err: &HostUsbError) -> Self {
        Self {
            status: status_for(err),
            data: Vec::new(),
        }
    }
}

/// Dispatches a control transfer on endpoint 0.
///
/// `out_data` is the OUT-direction payload already read from the wire (empty
/// for IN transfers); the setup packet's `w_length`/direction decide how
/// much, if anything, is read back.
pub fn dispatch_ep0<H: UsbHandle>(
    handle: &H,
    setup: &SetupPacket,
    out_data: &[u8],
) -> UrbResult {
    let is_in = setup.bm_request_type & REQUEST_TYPE_DIR_IN != 0;
    let w_value: u16 = setup.w_value.into();
    let w_index: u16 = setup.w_index.into();
    let w_length: u16 = setup.w_length.into();

    // These three interceptions compare the whole `bmRequestType` byte, not
    // just the recipient bits: spec.md's literal rule is
    // `bmRequestType == RECIP_DEVICE`/`== RECIP_INTERFACE`, which also pins
    // Type to standard and Direction to host-to-device. A class/vendor
    // request or a device-to-host read that happens to share a request
    // number must pass through to the device instead.
    if setup.bm_request_type == RECIP_DEVICE && setup.b_request == REQUEST_SET_CONFIGURATION {
        let value = (w_value & 0xff) as u8;
        return match handle.set_configuration(value) {
            Ok(()) => UrbResult::ok(Vec::new()),
            Err(e) => UrbResult::from_err(&e),
        };
    }

    if setup.bm_request_type == RECIP_INTERFACE && setup.b_request == REQUEST_SET_INTERFACE {
        let interface = (w_index & 0xff) as u8;
        let alt = (w_value & 0xff) as u8;
        return match handle
            .claim_interface(interface)
            .and_then(|()| handle.set_interface_alt_setting(interface, alt))
        {
            Ok(()) => UrbResult::ok(Vec::new()),
            Err(e) => UrbResult::from_err(&e),
        };
    }

    if setup.bm_request_type == RECIP_DEVICE && setup.b_request == REQUEST_SET_ADDRESS {
        // The host already owns a USB address for this device; fabricate
        // success rather than forwarding.
        return UrbResult::ok(Vec::new());
    }

    if is_in {
        match handle.control_read(setup.bm_request_type, setup.b_request, w_value, w_index, w_length) {
            Ok(data) => UrbResult::ok(data),
            Err(e) => UrbResult::from_err(&e),
        }
    } else {
        match handle.control_write(setup.bm_request_type, setup.b_request, w_value, w_index, out_data) {
            Ok(_) => UrbResult::ok(Vec::new()),
            Err(e) => UrbResult::from_err(&e),
        }
    }
}

/// Dispatches a transfer on a non-zero endpoint, given what the registry
/// knows about that endpoint's type from the device's active configuration.
pub fn dispatch_non_ep0<H: UsbHandle>(
    handle: &H,
    snapshot: &DeviceSnapshot,
    ep: u8,
    direction: u32,
    transfer_buffer_length: u32,
    out_data: &[u8],
) -> Result<UrbResult, SessionError> {
    let endpoint = snapshot
        .active_configuration()
        .and_then(|cfg| {
            cfg.interfaces.iter().flat_map(|i| &i.endpoints).find(|e| {
                let addr = e.address & 0x0f;
                addr == ep
                    && e.direction
                        == if direction == USBIP_DIR_IN {
                            EndpointDirection::In
                        } else {
                            EndpointDirection::Out
                        }
            })
        })
        .ok_or_else(|| SessionError::Protocol(format!("unknown endpoint {ep}")))?;

    if endpoint.transfer_type == EndpointType::Isochronous {
        return Err(SessionError::Unimplemented("isochronous transfers"));
    }

    let is_in = direction == USBIP_DIR_IN;
    let result = match (endpoint.transfer_type, is_in) {
        (EndpointType::Bulk, true) => handle
            .bulk_transfer_in(ep, transfer_buffer_length as usize)
            .map(UrbResult::ok),
        (EndpointType::Bulk, false) => handle
            .bulk_transfer_out(ep, out_data)
            .map(|_| UrbResult::ok(Vec::new())),
        (EndpointType::Interrupt, true) => handle
            .interrupt_transfer_in(ep, transfer_buffer_length as usize)
            .map(UrbResult::ok),
        (EndpointType::Interrupt, false) => handle
            .interrupt_transfer_out(ep, out_data)
            .map(|_| UrbResult::ok(Vec::new())),
        (EndpointType::Isochronous, _) => unreachable!("rejected above"),
    };

    Ok(result.unwrap_or_else(|e| UrbResult::from_err(&e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::simulated::{SimulatedDevice, SimulatedHandle, SimulatedHost};
    use crate::host::{ConfigurationInfo, EndpointInfo, HostUsbError, InterfaceInfo, Speed, UsbHost};
    use crate::proto::wire::decode_setup_packet;

    fn snapshot_with_bulk_in(ep: u8) -> DeviceSnapshot {
        DeviceSnapshot {
            bus_number: 1,
            device_address: 2,
            speed: Speed::High,
            id_vendor: 1,
            id_product: 1,
            bcd_device: 0,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            configurations: vec![ConfigurationInfo {
                value: 1,
                interfaces: vec![InterfaceInfo {
                    class: 0,
                    subclass: 0,
                    protocol: 0,
                    endpoints: vec![EndpointInfo {
                        address: ep,
                        transfer_type: EndpointType::Bulk,
                        direction: EndpointDirection::In,
                    }],
                }],
            }],
        }
    }

    fn open_handle(snapshot: DeviceSnapshot, canned: Vec<u8>) -> SimulatedHandle {
        let host = SimulatedHost::new(vec![SimulatedDevice {
            snapshot: snapshot.clone(),
            canned_in_response: canned,
            fail_with: None,
        }]);
        host.open(&snapshot).unwrap()
    }

    #[test]
    fn set_configuration_never_reaches_control_write() {
        let handle = open_handle(snapshot_with_bulk_in(1), vec![]);
        let raw: [u8; 8] = [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        let setup = decode_setup_packet(&raw).unwrap();
        let result = dispatch_ep0(&handle, &setup, &[]);
        assert_eq!(result.status, 0);
        assert_eq!(handle.calls().set_configuration, vec![1]);
        assert!(handle.calls().control_writes.is_empty());
    }

    #[test]
    fn set_interface_claims_before_setting_alt() {
        let handle = open_handle(snapshot_with_bulk_in(1), vec![]);
        // SET_INTERFACE(interface=2, alt=1): bmRequestType = RECIP_INTERFACE
        let raw: [u8; 8] = [0x01, 0x0B, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00];
        let setup = decode_setup_packet(&raw).unwrap();
        let result = dispatch_ep0(&handle, &setup, &[]);
        assert_eq!(result.status, 0);
        assert_eq!(handle.calls().claimed_interfaces, vec![2]);
        assert_eq!(handle.calls().alt_settings, vec![(2, 1)]);
    }

    #[test]
    fn device_to_host_request_sharing_set_configuration_number_passes_through() {
        // bmRequestType = 0x80: standard, device-to-host, recipient device —
        // not RECIP_DEVICE (0x00) because of the direction bit, so even
        // though bRequest == SET_CONFIGURATION's number it must not be
        // intercepted.
        let handle = open_handle(snapshot_with_bulk_in(1), vec![0xAA; 1]);
        let raw: [u8; 8] = [0x80, 0x09, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00];
        let setup = decode_setup_packet(&raw).unwrap();
        let result = dispatch_ep0(&handle, &setup, &[]);
        assert_eq!(result.status, 0);
        assert!(handle.calls().set_configuration.is_empty());
        assert_eq!(handle.calls().control_reads.len(), 1);
    }

    #[test]
    fn passthrough_get_descriptor_hits_control_read() {
        let handle = open_handle(snapshot_with_bulk_in(1), vec![0xAA; 18]);
        // GET_DESCRIPTOR(DEVICE), standard IN request
        let raw: [u8; 8] = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = decode_setup_packet(&raw).unwrap();
        let result = dispatch_ep0(&handle, &setup, &[]);
        assert_eq!(result.status, 0);
        assert_eq!(result.data.len(), 18);
        assert_eq!(handle.calls().control_reads.len(), 1);
    }

    #[test]
    fn bulk_in_on_known_endpoint_succeeds() {
        let snap = snapshot_with_bulk_in(0x81 & 0x0f);
        let handle = open_handle(snap.clone(), vec![1, 2, 3, 4]);
        let result = dispatch_non_ep0(&handle, &snap, 1, USBIP_DIR_IN, 4, &[]).unwrap();
        assert_eq!(result.status, 0);
        assert_eq!(result.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_endpoint_is_a_protocol_error() {
        let snap = snapshot_with_bulk_in(1);
        let handle = open_handle(snap.clone(), vec![]);
        let err = dispatch_non_ep0(&handle, &snap, 5, USBIP_DIR_IN, 4, &[]).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn stalled_control_in_maps_to_epipe_with_empty_payload() {
        let snap = snapshot_with_bulk_in(1);
        let host = SimulatedHost::new(vec![SimulatedDevice {
            snapshot: snap.clone(),
            canned_in_response: vec![0xAA; 18],
            fail_with: Some(HostUsbError::Pipe),
        }]);
        let handle = host.open(&snap).unwrap();
        // GET_DESCRIPTOR(DEVICE), standard IN request
        let raw: [u8; 8] = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let setup = decode_setup_packet(&raw).unwrap();
        let result = dispatch_ep0(&handle, &setup, &[]);
        assert_eq!(result.status, -32);
        assert!(result.data.is_empty());
    }

    #[test]
    fn stalled_bulk_transfer_maps_to_epipe() {
        let snap = snapshot_with_bulk_in(1);
        let host = SimulatedHost::new(vec![SimulatedDevice {
            snapshot: snap.clone(),
            canned_in_response: vec![],
            fail_with: Some(HostUsbError::Pipe),
        }]);
        let handle = host.open(&snap).unwrap();
        let result = dispatch_non_ep0(&handle, &snap, 1, USBIP_DIR_IN, 4, &[]).unwrap();
        assert_eq!(result.status, -32);
    }
}
