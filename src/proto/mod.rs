//! USB/IP wire protocol: opcodes, constants, and the packed-struct codec.
//!
//! Pure (no I/O) §4.1: these are pack/unpack functions over
//! fixed, big-endian layouts, plus the one little-endian exception (the USB
//! setup packet, per USB convention).

pub mod wire;

use num_derive::{FromPrimitive, ToPrimitive};

/// USB/IP wire protocol version this server speaks. Emitted in every
/// OP-phase reply.
pub const USBIP_VERSION: u16 = 0x0111;

/// High bit distinguishing an OP-phase REQUEST from a REPLY.
pub const OP_REQUEST: u16 = 0x8000;
pub const OP_REPLY: u16 = 0x0000;

pub const USBIP_BUS_ID_SIZE: usize = 32;
pub const USBIP_DEV_PATH_MAX: usize = 256;

/// Size in bytes of the fixed device-descriptor wire record.
pub const DEVICE_DESC_SIZE: usize = 312;
/// Size in bytes of each trailing per-interface record.
pub const INTERFACE_DESC_SIZE: usize = 4;

/// Size in bytes of `usbip_header_basic`: command, seqnum, devid, direction, ep.
pub const HEADER_BASIC_SIZE: usize = 20;
/// Size in bytes of the fields following `usbip_header_basic` in a
/// `cmd_submit`: transfer_flags, transfer_buffer_length, start_frame,
/// number_of_packets, interval, setup.
pub const CMD_SUBMIT_EXTRA_SIZE: usize = 28;
/// Size in bytes of a full `ret_submit`, header included.
pub const RET_SUBMIT_SIZE: usize = 48;

pub const ST_OK: u32 = 0x00;
pub const ST_NA: u32 = 0x01;

/// OP-phase opcode (low 15 bits; `OP_REQUEST`/`OP_REPLY` is the high bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum OpCode {
    Unspec = 0x00,
    Devinfo = 0x02,
    Import = 0x03,
    Devlist = 0x05,
}

/// URB-phase command, the low 16 bits of `usbip_header_basic.command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum Command {
    CmdSubmit = 0x0001,
    CmdUnlink = 0x0002,
    RetSubmit = 0x0003,
    RetUnlink = 0x0004,
    ResetDev = 0xFFFF,
}

/// `usbip_header_basic.direction`.
pub const USBIP_DIR_OUT: u32 = 0;
pub const USBIP_DIR_IN: u32 = 1;

/// Standard USB control-request fields, reused from the setup packet.
pub const RECIP_DEVICE: u8 = 0x00;
pub const RECIP_INTERFACE: u8 = 0x01;
pub const REQUEST_TYPE_RECIPIENT_MASK: u8 = 0x1f;
pub const REQUEST_TYPE_DIR_IN: u8 = 0x80;

pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_SET_INTERFACE: u8 = 0x0B;
pub const REQUEST_SET_ADDRESS: u8 = 0x05;

/// NUL-pads `s` into a fixed-width byte array for a wire string field.
pub fn pad_fixed<const N: usize>(s: &str) -> [u8; N] {
    let mut buf = [0u8; N];
    let bytes = s.as_bytes();
    let n = bytes.len().min(N);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// Strips trailing NULs from a fixed-width wire string field.
pub fn strip_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
