//! Fixed, big-endian wire layouts, and the handful of functions that
//! actually pack/unpack them. All multi-byte integers are big-endian except
//! [`SetupPacket`], which is little-endian per USB convention.

use packed_struct::prelude::*;

use crate::error::SessionError;
use crate::host::DeviceSnapshot;

use super::{pad_fixed, strip_nul, USBIP_BUS_ID_SIZE, USBIP_DEV_PATH_MAX};

/// `op_common`: the 8-byte header shared by every OP-phase reply.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct OpCommon {
    #[packed_field(bytes = "0..=1", endian = "msb")]
    pub version: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "2..=3", endian = "msb")]
    pub opcode: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub status: Integer<u32, packed_bits::Bits<32>>,
}

/// `usbip_header_basic`: the 20-byte header common to every URB message.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "20")]
pub struct UsbIpHeaderBasic {
    #[packed_field(bytes = "0..=3", endian = "msb")]
    pub command: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub seqnum: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "8..=11", endian = "msb")]
    pub devid: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "12..=15", endian = "msb")]
    pub direction: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "16..=19", endian = "msb")]
    pub ep: Integer<u32, packed_bits::Bits<32>>,
}

/// The 28 bytes following `usbip_header_basic` in a `cmd_submit`.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "28")]
pub struct CmdSubmitExtra {
    #[packed_field(bytes = "0..=3", endian = "msb")]
    pub transfer_flags: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub transfer_buffer_length: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "8..=11", endian = "msb")]
    pub start_frame: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "12..=15", endian = "msb")]
    pub number_of_packets: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "16..=19", endian = "msb")]
    pub interval: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "20..=27")]
    pub setup: [u8; 8],
}

/// The 8-byte USB setup packet. Little-endian, per USB convention, unlike
/// every other field on the wire.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct SetupPacket {
    #[packed_field(bytes = "0")]
    pub bm_request_type: u8,
    #[packed_field(bytes = "1")]
    pub b_request: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_value: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_index: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "6..=7", endian = "lsb")]
    pub w_length: Integer<u16, packed_bits::Bits<16>>,
}

/// `ret_submit`: the full 48-byte reply to a `cmd_submit`.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "48")]
pub struct RetSubmit {
    #[packed_field(bytes = "0..=3", endian = "msb")]
    pub command: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "4..=7", endian = "msb")]
    pub seqnum: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "8..=11", endian = "msb")]
    pub devid: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "12..=15", endian = "msb")]
    pub direction: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "16..=19", endian = "msb")]
    pub ep: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "20..=23", endian = "msb")]
    pub status: Integer<i32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "24..=27", endian = "msb")]
    pub actual_length: Integer<i32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "28..=31", endian = "msb")]
    pub start_frame: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "32..=35", endian = "msb")]
    pub number_of_packets: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "36..=39", endian = "msb")]
    pub error_count: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "40..=47")]
    pub reserved: [u8; 8],
}

/// The 312-byte `struct usb_device` wire record.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "312")]
pub struct DeviceDescriptorWire {
    #[packed_field(bytes = "0..=255")]
    pub path: [u8; 256],
    #[packed_field(bytes = "256..=287")]
    pub busid: [u8; 32],
    #[packed_field(bytes = "288..=291", endian = "msb")]
    pub busnum: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "292..=295", endian = "msb")]
    pub devnum: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "296..=299", endian = "msb")]
    pub speed: Integer<u32, packed_bits::Bits<32>>,
    #[packed_field(bytes = "300..=301", endian = "msb")]
    pub id_vendor: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "302..=303", endian = "msb")]
    pub id_product: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "304..=305", endian = "msb")]
    pub bcd_device: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "306")]
    pub b_device_class: u8,
    #[packed_field(bytes = "307")]
    pub b_device_subclass: u8,
    #[packed_field(bytes = "308")]
    pub b_device_protocol: u8,
    #[packed_field(bytes = "309")]
    pub b_configuration_value: u8,
    #[packed_field(bytes = "310")]
    pub b_num_configurations: u8,
    #[packed_field(bytes = "311")]
    pub b_num_interfaces: u8,
}

/// Each trailing per-interface record following a device descriptor.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "4")]
pub struct InterfaceDescriptorWire {
    #[packed_field(bytes = "0")]
    pub b_interface_class: u8,
    #[packed_field(bytes = "1")]
    pub b_interface_subclass: u8,
    #[packed_field(bytes = "2")]
    pub b_interface_protocol: u8,
    #[packed_field(bytes = "3")]
    pub padding: u8,
}

/// Decodes the 6 bytes following the already-consumed 2-byte version field
/// of an OP-phase header into `(opcode, status)`.
pub fn decode_op_common(buf: &[u8; 6]) -> (u16, u32) {
    let opcode = u16::from_be_bytes([buf[0], buf[1]]);
    let status = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    (opcode, status)
}

/// Encodes a full 8-byte `op_common` reply.
pub fn encode_op_reply(version: u16, opcode: u16, status: u32) -> [u8; 8] {
    let common = OpCommon {
        version: version.into(),
        opcode: opcode.into(),
        status: status.into(),
    };
    common.pack().expect("fixed-size struct always packs")
}

/// Decodes the 18 bytes following the already-consumed 2-byte command-high
/// field of a URB header, combined with the 2 peeked bytes, into the full
/// 20-byte `usbip_header_basic`.
pub fn decode_submit_header(full_20_bytes: &[u8; 20]) -> Result<UsbIpHeaderBasic, SessionError> {
    UsbIpHeaderBasic::unpack(full_20_bytes)
        .map_err(|e| SessionError::Codec(format!("usbip_header_basic: {e}")))
}

pub fn decode_cmd_submit_extra(buf: &[u8; 28]) -> Result<CmdSubmitExtra, SessionError> {
    CmdSubmitExtra::unpack(buf).map_err(|e| SessionError::Codec(format!("cmd_submit: {e}")))
}

pub fn decode_setup_packet(buf: &[u8; 8]) -> Result<SetupPacket, SessionError> {
    SetupPacket::unpack(buf).map_err(|e| SessionError::Codec(format!("setup packet: {e}")))
}

/// Encodes a `RET_SUBMIT` header (48 bytes, payload appended separately by
/// the caller for IN transfers).
pub fn encode_submit_reply(seqnum: u32, status: i32, actual_length: i32) -> [u8; 48] {
    let reply = RetSubmit {
        command: (crate::proto::Command::RetSubmit as u32).into(),
        seqnum: seqnum.into(),
        devid: 0u32.into(),
        direction: 0u32.into(),
        ep: 0u32.into(),
        status: status.into(),
        actual_length: actual_length.into(),
        start_frame: 0u32.into(),
        number_of_packets: 0u32.into(),
        error_count: 0u32.into(),
        reserved: [0u8; 8],
    };
    reply.pack().expect("fixed-size struct always packs")
}

/// Encodes a device descriptor (and, if `with_interfaces`, its active
/// configuration's interface records) for `OP_IMPORT`/`OP_DEVLIST` replies.
pub fn encode_device_desc(snapshot: &DeviceSnapshot, with_interfaces: bool) -> Vec<u8> {
    let desc = DeviceDescriptorWire {
        path: pad_fixed::<{ USBIP_DEV_PATH_MAX }>(&snapshot.path()),
        busid: pad_fixed::<{ USBIP_BUS_ID_SIZE }>(&snapshot.busid()),
        busnum: (snapshot.bus_number as u32).into(),
        devnum: (snapshot.device_address as u32).into(),
        speed: snapshot.speed.wire_value().into(),
        id_vendor: snapshot.id_vendor.into(),
        id_product: snapshot.id_product.into(),
        bcd_device: snapshot.bcd_device.into(),
        b_device_class: snapshot.device_class,
        b_device_subclass: snapshot.device_subclass,
        b_device_protocol: snapshot.device_protocol,
        b_configuration_value: snapshot.configuration_value,
        b_num_configurations: snapshot.configurations.len() as u8,
        b_num_interfaces: snapshot.active_num_interfaces(),
    };

    let mut out = desc.pack().expect("fixed-size struct always packs").to_vec();

    if with_interfaces {
        if let Some(cfg) = snapshot.active_configuration() {
            for iface in &cfg.interfaces {
                let iface_wire = InterfaceDescriptorWire {
                    b_interface_class: iface.class,
                    b_interface_subclass: iface.subclass,
                    b_interface_protocol: iface.protocol,
                    padding: 0,
                };
                out.extend_from_slice(&iface_wire.pack().expect("fixed-size struct always packs"));
            }
        }
    }

    out
}

/// Decodes a NUL-padded 32-byte busid field from an `OP_IMPORT` request body.
pub fn decode_busid(buf: &[u8; USBIP_BUS_ID_SIZE]) -> String {
    strip_nul(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ConfigurationInfo, InterfaceInfo, Speed};

    fn sample_snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            bus_number: 1,
            device_address: 2,
            speed: Speed::High,
            id_vendor: 0x1234,
            id_product: 0x5678,
            bcd_device: 0x0100,
            device_class: 9,
            device_subclass: 0,
            device_protocol: 1,
            configuration_value: 1,
            configurations: vec![ConfigurationInfo {
                value: 1,
                interfaces: vec![InterfaceInfo {
                    class: 3,
                    subclass: 1,
                    protocol: 2,
                    endpoints: vec![],
                }],
            }],
        }
    }

    #[test]
    fn op_reply_round_trips_version_and_opcode() {
        let buf = encode_op_reply(0x0111, 0x0005, 0);
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[0..2], &[0x01, 0x11]);
        assert_eq!(&buf[2..4], &[0x00, 0x05]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn device_descriptor_round_trips_and_strips_nuls() {
        let snap = sample_snapshot();
        let encoded = encode_device_desc(&snap, true);
        assert_eq!(encoded.len(), 312 + 4);

        let desc = DeviceDescriptorWire::unpack_from_slice(&encoded[..312]).unwrap();
        assert_eq!(strip_nul(&desc.path), snap.path());
        assert_eq!(strip_nul(&desc.busid), snap.busid());
        assert_eq!(u16::from(desc.id_vendor), snap.id_vendor);

        let iface = InterfaceDescriptorWire::unpack_from_slice(&encoded[312..316]).unwrap();
        assert_eq!(iface.b_interface_class, 3);
        assert_eq!(iface.padding, 0);
    }

    #[test]
    fn setup_packet_is_little_endian() {
        // SET_CONFIGURATION value=1, wLength=0
        let raw: [u8; 8] = [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        let setup = decode_setup_packet(&raw).unwrap();
        assert_eq!(setup.bm_request_type, 0x00);
        assert_eq!(setup.b_request, 0x09);
        assert_eq!(u16::from(setup.w_value), 1);
        assert_eq!(u16::from(setup.w_length), 0);
    }

    #[test]
    fn ret_submit_status_is_big_endian_negative() {
        let buf = encode_submit_reply(1, -32, 0);
        assert_eq!(buf.len(), 48);
        // command = 3
        assert_eq!(&buf[0..4], &[0, 0, 0, 3]);
        // seqnum = 1
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]);
        // status = -32 as big-endian i32
        assert_eq!(&buf[20..24], &(-32i32).to_be_bytes());
    }
}
