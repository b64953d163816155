//! Per-connection state machine: demultiplexes OP-phase and
//! URB-phase traffic on one socket, and keeps track of which devices this
//! connection has imported.
//!
//! A connection starts in the OP phase, handling `OP_REQ_DEVLIST`/
//! `OP_REQ_IMPORT` requests, and only enters the URB phase once at least one
//! `OP_REQ_IMPORT` has succeeded. Both phases share the same socket and the
//! same read loop; the first two bytes of every message decide which phase
//! it belongs to.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use num_traits::FromPrimitive;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dispatcher::{dispatch_ep0, dispatch_non_ep0};
use crate::error::SessionError;
use crate::host::{DeviceSnapshot, UsbHandle, UsbHost};
use crate::proto::wire::{
    decode_busid, decode_cmd_submit_extra, decode_op_common, decode_setup_packet,
    decode_submit_header, encode_op_reply, encode_submit_reply,
};
use crate::proto::{
    Command, OpCode, CMD_SUBMIT_EXTRA_SIZE, HEADER_BASIC_SIZE, OP_REPLY, OP_REQUEST, ST_NA, ST_OK,
    USBIP_BUS_ID_SIZE, USBIP_VERSION,
};
use crate::registry::{ImportedDevices, Registry};

/// Runs one connection's full lifetime: OP phase, URB phase, and teardown.
///
/// Generic over the stream so tests can drive it with an in-memory duplex
/// pipe instead of a real `TcpStream`.
pub struct Session<H: UsbHost> {
    registry: Arc<Registry<H>>,
    imported: ImportedDevices<H::Handle>,
    snapshots: HashMap<u32, DeviceSnapshot>,
}

impl<H> Session<H>
where
    H: UsbHost + 'static,
    H::Handle: 'static,
{
    pub fn new(registry: Arc<Registry<H>>) -> Self {
        Self {
            registry,
            imported: ImportedDevices::default(),
            snapshots: HashMap::new(),
        }
    }

    /// Drives the connection until the peer disconnects or a protocol/
    /// unimplemented-feature error ends it. Host USB errors never end the
    /// session; they become a negative status in the reply.
    pub async fn run<S>(&mut self, stream: &mut S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let mut peek = [0u8; 2];
            match stream.read_exact(&mut peek).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("peer closed connection");
                    return Ok(());
                }
                Err(e) => return Err(SessionError::Io(e)),
            }

            if peek[0] == 0x01 {
                self.handle_op_message(stream, peek).await?;
            } else if peek == [0x00, 0x00] {
                self.handle_urb_message(stream, peek).await?;
            } else {
                return Err(SessionError::Protocol(format!(
                    "unrecognized leading bytes {:02x?}",
                    peek
                )));
            }
        }
    }

    async fn handle_op_message<S>(&mut self, stream: &mut S, peek: [u8; 2]) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let version = u16::from_be_bytes(peek);
        if version != USBIP_VERSION {
            return Err(SessionError::Protocol(format!(
                "unsupported usbip version {version:#06x}"
            )));
        }

        let mut rest = [0u8; 6];
        stream.read_exact(&mut rest).await?;
        let (raw_opcode, _status) = decode_op_common(&rest);
        let opcode = raw_opcode & !OP_REQUEST;

        match OpCode::from_u16(opcode) {
            Some(OpCode::Unspec) => self.handle_unspec(stream).await,
            Some(OpCode::Devlist) => self.handle_devlist(stream).await,
            Some(OpCode::Import) => self.handle_import(stream).await,
            Some(OpCode::Devinfo) => Err(SessionError::Unimplemented("OP_REQ_DEVINFO")),
            None => Err(SessionError::Protocol(format!("unknown opcode {opcode:#06x}"))),
        }
    }

    async fn handle_unspec<S>(&mut self, stream: &mut S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let reply_opcode = OP_REPLY | OpCode::Unspec as u16;
        let header = encode_op_reply(USBIP_VERSION, reply_opcode, ST_OK);
        stream.write_all(&header).await?;
        Ok(())
    }

    async fn handle_devlist<S>(&mut self, stream: &mut S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let body = self.registry.encode_devlist_body()?;
        let reply_opcode = OP_REPLY | OpCode::Devlist as u16;
        let header = encode_op_reply(USBIP_VERSION, reply_opcode, ST_OK);
        stream.write_all(&header).await?;
        stream.write_all(&body).await?;
        Ok(())
    }

    async fn handle_import<S>(&mut self, stream: &mut S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut busid_buf = [0u8; USBIP_BUS_ID_SIZE];
        stream.read_exact(&mut busid_buf).await?;
        let busid = decode_busid(&busid_buf);

        let reply_opcode = OP_REPLY | OpCode::Import as u16;
        match self.registry.find(&busid)? {
            Some(snapshot) => {
                let handle = self.registry.open(&snapshot)?;
                let devid = snapshot.devid();
                self.imported.insert(devid, handle);
                self.snapshots.insert(devid, snapshot.clone());

                info!("imported device {busid} as devid {devid:#010x}");

                let header = encode_op_reply(USBIP_VERSION, reply_opcode, ST_OK);
                stream.write_all(&header).await?;
                stream.write_all(&crate::proto::wire::encode_device_desc(&snapshot, false)).await?;
            }
            None => {
                warn!("import requested for unknown busid {busid}");
                let header = encode_op_reply(USBIP_VERSION, reply_opcode, ST_NA);
                stream.write_all(&header).await?;
            }
        }
        Ok(())
    }

    async fn handle_urb_message<S>(&mut self, stream: &mut S, peek: [u8; 2]) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut rest = [0u8; HEADER_BASIC_SIZE - 2];
        stream.read_exact(&mut rest).await?;
        let mut full = [0u8; HEADER_BASIC_SIZE];
        full[..2].copy_from_slice(&peek);
        full[2..].copy_from_slice(&rest);
        let header = decode_submit_header(&full)?;

        let command = u32::from(header.command);
        match Command::from_u32(command) {
            Some(Command::CmdSubmit) => self.handle_cmd_submit(stream, &header).await,
            Some(Command::CmdUnlink) => Err(SessionError::Unimplemented("CMD_UNLINK")),
            Some(Command::ResetDev) => Err(SessionError::Unimplemented("RESET_DEV")),
            _ => Err(SessionError::Protocol(format!("unexpected urb command {command:#010x}"))),
        }
    }

    async fn handle_cmd_submit<S>(
        &mut self,
        stream: &mut S,
        header: &crate::proto::wire::UsbIpHeaderBasic,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut extra_buf = [0u8; CMD_SUBMIT_EXTRA_SIZE];
        stream.read_exact(&mut extra_buf).await?;
        let extra = decode_cmd_submit_extra(&extra_buf)?;

        if u32::from(extra.number_of_packets) != 0 {
            return Err(SessionError::Unimplemented("isochronous transfers"));
        }

        let seqnum = u32::from(header.seqnum);
        let devid = u32::from(header.devid);
        let direction = u32::from(header.direction);
        let ep = u32::from(header.ep) as u8;
        let transfer_buffer_length = u32::from(extra.transfer_buffer_length);

        let out_data = if direction == crate::proto::USBIP_DIR_OUT && transfer_buffer_length > 0 {
            let mut buf = vec![0u8; transfer_buffer_length as usize];
            stream.read_exact(&mut buf).await?;
            buf
        } else {
            Vec::new()
        };

        let handle = self
            .imported
            .get(devid)
            .ok_or_else(|| SessionError::Protocol(format!("unknown devid {devid:#010x}")))?;

        // Host USB calls are blocking; run them on the blocking pool so a
        // slow device never stalls the executor. RET_SUBMIT ordering is
        // preserved because this future is awaited before the next message
        // is even read off the socket.
        let result = if ep == 0 {
            let setup = decode_setup_packet(&extra.setup)?;
            let w_length: u16 = setup.w_length.into();
            if w_length as u32 != transfer_buffer_length {
                return Err(SessionError::Protocol(format!(
                    "setup wLength {w_length} does not match transfer_buffer_length {transfer_buffer_length}"
                )));
            }
            tokio::task::spawn_blocking(move || dispatch_ep0(handle.as_ref(), &setup, &out_data))
                .await
                .map_err(|e| SessionError::Protocol(format!("dispatch task panicked: {e}")))?
        } else {
            let snapshot = self
                .snapshots
                .get(&devid)
                .expect("snapshot tracked alongside every imported handle")
                .clone();
            tokio::task::spawn_blocking(move || {
                dispatch_non_ep0(handle.as_ref(), &snapshot, ep, direction, transfer_buffer_length, &out_data)
            })
            .await
            .map_err(|e| SessionError::Protocol(format!("dispatch task panicked: {e}")))??
        };

        let actual_length = result.data.len() as i32;
        let reply_header = encode_submit_reply(seqnum, result.status, actual_length);
        stream.write_all(&reply_header).await?;
        if direction == crate::proto::USBIP_DIR_IN && !result.data.is_empty() {
            stream.write_all(&result.data).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::simulated::{SimulatedDevice, SimulatedHost};
    use crate::host::{ConfigurationInfo, Speed};
    use crate::proto::OP_REQUEST;

    fn snapshot(bus: u8, addr: u8) -> DeviceSnapshot {
        DeviceSnapshot {
            bus_number: bus,
            device_address: addr,
            speed: Speed::High,
            id_vendor: 0x1234,
            id_product: 0x5678,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            configurations: vec![ConfigurationInfo {
                value: 1,
                interfaces: vec![],
            }],
        }
    }

    fn op_request(opcode: u16, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&USBIP_VERSION.to_be_bytes());
        buf.extend_from_slice(&(OP_REQUEST | opcode).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(body);
        buf
    }

    #[tokio::test]
    async fn empty_devlist_round_trip() {
        let registry = Arc::new(Registry::new(SimulatedHost::empty()));
        let mut session = Session::new(registry);
        let (mut client, mut server) = tokio::io::duplex(4096);

        let request = op_request(OpCode::Devlist as u16, &[]);
        client.write_all(&request).await.unwrap();

        tokio::spawn(async move {
            let _ = session.run(&mut server).await;
        });

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[0..2], &USBIP_VERSION.to_be_bytes());
        assert_eq!(&reply[2..4], &(OpCode::Devlist as u16).to_be_bytes());
        assert_eq!(&reply[4..8], &ST_OK.to_be_bytes());

        let mut count = [0u8; 4];
        client.read_exact(&mut count).await.unwrap();
        assert_eq!(count, 0u32.to_be_bytes());
    }

    #[tokio::test]
    async fn import_unknown_busid_replies_not_available() {
        let registry = Arc::new(Registry::new(SimulatedHost::empty()));
        let mut session = Session::new(registry);
        let (mut client, mut server) = tokio::io::duplex(4096);

        let mut busid = [0u8; USBIP_BUS_ID_SIZE];
        busid[..3].copy_from_slice(b"1-9");
        let request = op_request(OpCode::Import as u16, &busid);
        client.write_all(&request).await.unwrap();

        tokio::spawn(async move {
            let _ = session.run(&mut server).await;
        });

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[4..8], &ST_NA.to_be_bytes());
    }

    #[tokio::test]
    async fn import_known_device_then_set_configuration_urb() {
        let snap = snapshot(1, 2);
        let registry = Arc::new(Registry::new(SimulatedHost::new(vec![SimulatedDevice {
            snapshot: snap.clone(),
            canned_in_response: vec![],
            fail_with: None,
        }])));
        let mut session = Session::new(registry);
        let (mut client, mut server) = tokio::io::duplex(8192);

        let mut busid = [0u8; USBIP_BUS_ID_SIZE];
        busid[..3].copy_from_slice(b"1-2");
        client.write_all(&op_request(OpCode::Import as u16, &busid)).await.unwrap();

        // CMD_SUBMIT: SET_CONFIGURATION(1) on EP0, devid = (1<<16)|2
        let devid = snap.devid();
        let mut cmd = Vec::new();
        cmd.extend_from_slice(&(Command::CmdSubmit as u32).to_be_bytes());
        cmd.extend_from_slice(&7u32.to_be_bytes()); // seqnum
        cmd.extend_from_slice(&devid.to_be_bytes());
        cmd.extend_from_slice(&crate::proto::USBIP_DIR_OUT.to_be_bytes());
        cmd.extend_from_slice(&0u32.to_be_bytes()); // ep 0
        cmd.extend_from_slice(&0u32.to_be_bytes()); // transfer_flags
        cmd.extend_from_slice(&0u32.to_be_bytes()); // transfer_buffer_length
        cmd.extend_from_slice(&0u32.to_be_bytes()); // start_frame
        cmd.extend_from_slice(&0u32.to_be_bytes()); // number_of_packets
        cmd.extend_from_slice(&0u32.to_be_bytes()); // interval
        cmd.extend_from_slice(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]); // setup
        client.write_all(&cmd).await.unwrap();

        tokio::spawn(async move {
            let _ = session.run(&mut server).await;
        });

        // drain import reply
        let mut import_reply = [0u8; 8 + 312];
        client.read_exact(&mut import_reply).await.unwrap();
        assert_eq!(&import_reply[4..8], &ST_OK.to_be_bytes());

        let mut ret = [0u8; 48];
        client.read_exact(&mut ret).await.unwrap();
        assert_eq!(&ret[0..4], &(Command::RetSubmit as u32).to_be_bytes());
        assert_eq!(&ret[4..8], &7u32.to_be_bytes());
        assert_eq!(&ret[20..24], &0i32.to_be_bytes());
    }

    #[tokio::test]
    async fn op_unspec_handshake_echoes_version() {
        let registry = Arc::new(Registry::new(SimulatedHost::empty()));
        let mut session = Session::new(registry);
        let (mut client, mut server) = tokio::io::duplex(4096);

        client
            .write_all(&op_request(OpCode::Unspec as u16, &[]))
            .await
            .unwrap();

        tokio::spawn(async move {
            let _ = session.run(&mut server).await;
        });

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[0..2], &USBIP_VERSION.to_be_bytes());
        assert_eq!(&reply[2..4], &(OpCode::Unspec as u16).to_be_bytes());
        assert_eq!(&reply[4..8], &ST_OK.to_be_bytes());
    }

    #[tokio::test]
    async fn iso_submit_closes_connection_with_no_reply() {
        let snap = snapshot(1, 2);
        let registry = Arc::new(Registry::new(SimulatedHost::new(vec![SimulatedDevice {
            snapshot: snap.clone(),
            canned_in_response: vec![],
            fail_with: None,
        }])));
        let mut session = Session::new(registry);
        let (mut client, mut server) = tokio::io::duplex(8192);

        let mut busid = [0u8; USBIP_BUS_ID_SIZE];
        busid[..3].copy_from_slice(b"1-2");
        client.write_all(&op_request(OpCode::Import as u16, &busid)).await.unwrap();

        let devid = snap.devid();
        let mut cmd = Vec::new();
        cmd.extend_from_slice(&(Command::CmdSubmit as u32).to_be_bytes());
        cmd.extend_from_slice(&9u32.to_be_bytes()); // seqnum
        cmd.extend_from_slice(&devid.to_be_bytes());
        cmd.extend_from_slice(&crate::proto::USBIP_DIR_IN.to_be_bytes());
        cmd.extend_from_slice(&1u32.to_be_bytes()); // ep 1
        cmd.extend_from_slice(&0u32.to_be_bytes()); // transfer_flags
        cmd.extend_from_slice(&0u32.to_be_bytes()); // transfer_buffer_length
        cmd.extend_from_slice(&0u32.to_be_bytes()); // start_frame
        cmd.extend_from_slice(&3u32.to_be_bytes()); // number_of_packets != 0
        cmd.extend_from_slice(&0u32.to_be_bytes()); // interval
        cmd.extend_from_slice(&[0u8; 8]); // setup (unused for non-EP0)
        client.write_all(&cmd).await.unwrap();

        let handle = tokio::spawn(async move { session.run(&mut server).await });

        // drain import reply
        let mut import_reply = [0u8; 8 + 312];
        client.read_exact(&mut import_reply).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SessionError::Unimplemented(_))));

        // No RET_SUBMIT follows; the duplex pipe is closed with nothing left to read.
        let mut trailing = Vec::new();
        client.read_to_end(&mut trailing).await.unwrap();
        assert!(trailing.is_empty());
    }

    #[tokio::test]
    async fn mismatched_w_length_is_a_protocol_error() {
        let snap = snapshot(1, 2);
        let registry = Arc::new(Registry::new(SimulatedHost::new(vec![SimulatedDevice {
            snapshot: snap.clone(),
            canned_in_response: vec![],
            fail_with: None,
        }])));
        let mut session = Session::new(registry);
        let (mut client, mut server) = tokio::io::duplex(8192);

        let mut busid = [0u8; USBIP_BUS_ID_SIZE];
        busid[..3].copy_from_slice(b"1-2");
        client.write_all(&op_request(OpCode::Import as u16, &busid)).await.unwrap();

        // setup claims wLength=18 but transfer_buffer_length says 0.
        let devid = snap.devid();
        let mut cmd = Vec::new();
        cmd.extend_from_slice(&(Command::CmdSubmit as u32).to_be_bytes());
        cmd.extend_from_slice(&3u32.to_be_bytes()); // seqnum
        cmd.extend_from_slice(&devid.to_be_bytes());
        cmd.extend_from_slice(&crate::proto::USBIP_DIR_IN.to_be_bytes());
        cmd.extend_from_slice(&0u32.to_be_bytes()); // ep 0
        cmd.extend_from_slice(&0u32.to_be_bytes()); // transfer_flags
        cmd.extend_from_slice(&0u32.to_be_bytes()); // transfer_buffer_length = 0
        cmd.extend_from_slice(&0u32.to_be_bytes()); // start_frame
        cmd.extend_from_slice(&0u32.to_be_bytes()); // number_of_packets
        cmd.extend_from_slice(&0u32.to_be_bytes()); // interval
        cmd.extend_from_slice(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]); // wLength=18
        client.write_all(&cmd).await.unwrap();

        let handle = tokio::spawn(async move { session.run(&mut server).await });

        let mut import_reply = [0u8; 8 + 312];
        client.read_exact(&mut import_reply).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }
}
