//! VXI-11 network backend.
//!
//! VXI-11 is ONC RPC over TCP with XDR encoding. Instruments register the
//! `DEVICE_CORE` program (0x0607AF) with the host's portmapper; a client asks
//! the portmapper (TCP port 111) where the core channel lives, connects,
//! creates a link to `inst0` and then exchanges `device_write`/`device_read`
//! calls.
//!
//! Only the slice of the protocol needed for command channels is
//! implemented: `GETPORT`, `create_link`, `device_write`, `device_read`,
//! `destroy_link`. Abort and interrupt channels are not.
//!
//! [`probe`] is the network scanner's primitive: a bounded-timeout
//! portmapper lookup that classifies a host as "VXI-11 instrument" without
//! creating a link.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::backend::Backend;
use crate::error::BackendError;

// ONC RPC constants (RFC 5531).
const RPC_VERSION: u32 = 2;
const MSG_CALL: u32 = 0;
const MSG_REPLY: u32 = 1;
const REPLY_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const AUTH_NONE: u32 = 0;

// Portmapper (RFC 1833).
const PORTMAP_PORT: u16 = 111;
const PORTMAP_PROGRAM: u32 = 100_000;
const PORTMAP_VERSION: u32 = 2;
const PMAP_GETPORT: u32 = 3;
const IPPROTO_TCP: u32 = 6;

// VXI-11 core channel (VXIbus TCP/IP Instrument Protocol).
const DEVICE_CORE_PROGRAM: u32 = 0x0607AF;
const DEVICE_CORE_VERSION: u32 = 1;
const PROC_CREATE_LINK: u32 = 10;
const PROC_DEVICE_WRITE: u32 = 11;
const PROC_DEVICE_READ: u32 = 12;
const PROC_DESTROY_LINK: u32 = 23;

// device_write / device_read flags and reasons.
const FLAG_END: u32 = 8;
const REASON_END: u32 = 4;
const REASON_TERMCHAR: u32 = 2;

// Device_ErrorCode values worth distinguishing.
const ERR_IO_TIMEOUT: u32 = 15;

/// Default logical device name on the instrument.
const DEFAULT_DEVICE_NAME: &str = "inst0";

// ---------------------------------------------------------------------------
// XDR encoding
// ---------------------------------------------------------------------------

fn put_opaque(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    // XDR pads opaque data to a 4-byte boundary.
    let pad = (4 - data.len() % 4) % 4;
    buf.put_bytes(0, pad);
}

fn get_u32(buf: &mut Bytes) -> Result<u32, BackendError> {
    if buf.remaining() < 4 {
        return Err(BackendError::Malformed("truncated XDR word".into()));
    }
    Ok(buf.get_u32())
}

fn get_opaque(buf: &mut Bytes) -> Result<Bytes, BackendError> {
    let len = get_u32(buf)? as usize;
    let padded = len + (4 - len % 4) % 4;
    if buf.remaining() < padded {
        return Err(BackendError::Malformed("truncated XDR opaque".into()));
    }
    let data = buf.split_to(len);
    buf.advance(padded - len);
    Ok(data)
}

/// Encode an RPC call message with AUTH_NONE credentials.
fn encode_call(xid: u32, program: u32, version: u32, procedure: u32, args: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(40 + args.len());
    buf.put_u32(xid);
    buf.put_u32(MSG_CALL);
    buf.put_u32(RPC_VERSION);
    buf.put_u32(program);
    buf.put_u32(version);
    buf.put_u32(procedure);
    // cred + verf, both AUTH_NONE with empty bodies
    buf.put_u32(AUTH_NONE);
    buf.put_u32(0);
    buf.put_u32(AUTH_NONE);
    buf.put_u32(0);
    buf.put_slice(args);
    buf
}

/// Strip the RPC reply header, returning the result payload.
fn decode_reply(expected_xid: u32, mut buf: Bytes) -> Result<Bytes, BackendError> {
    let xid = get_u32(&mut buf)?;
    if xid != expected_xid {
        return Err(BackendError::Malformed(format!(
            "RPC xid mismatch: sent {expected_xid}, got {xid}"
        )));
    }
    if get_u32(&mut buf)? != MSG_REPLY {
        return Err(BackendError::Malformed("not an RPC reply".into()));
    }
    if get_u32(&mut buf)? != REPLY_ACCEPTED {
        return Err(BackendError::Protocol("RPC call denied".into()));
    }
    // verifier: flavor + opaque body
    let _flavor = get_u32(&mut buf)?;
    let _verf = get_opaque(&mut buf)?;
    let accept = get_u32(&mut buf)?;
    if accept != ACCEPT_SUCCESS {
        return Err(BackendError::Protocol(format!(
            "RPC accept status {accept}"
        )));
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Record-marked TCP transport (RFC 5531 §11)
// ---------------------------------------------------------------------------

const LAST_FRAGMENT: u32 = 0x8000_0000;
/// Cap on a single reply record, far above any SCPI response we expect.
const MAX_RECORD: usize = 16 * 1024 * 1024;

async fn send_record(stream: &mut TcpStream, payload: &[u8]) -> Result<(), BackendError> {
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(LAST_FRAGMENT | payload.len() as u32);
    frame.put_slice(payload);
    stream.write_all(&frame).await.map_err(BackendError::Io)
}

async fn recv_record(stream: &mut TcpStream) -> Result<Bytes, BackendError> {
    let mut record = BytesMut::new();
    loop {
        let header = stream.read_u32().await.map_err(BackendError::Io)?;
        let len = (header & !LAST_FRAGMENT) as usize;
        if record.len() + len > MAX_RECORD {
            return Err(BackendError::Malformed("oversized RPC record".into()));
        }
        let mut fragment = vec![0u8; len];
        stream
            .read_exact(&mut fragment)
            .await
            .map_err(BackendError::Io)?;
        record.put_slice(&fragment);
        if header & LAST_FRAGMENT != 0 {
            return Ok(record.freeze());
        }
    }
}

/// One call/reply round trip on an open stream, bounded by `timeout`.
async fn round_trip(
    stream: &mut TcpStream,
    xid: u32,
    call: &[u8],
    timeout: Duration,
) -> Result<Bytes, BackendError> {
    let exchange = async {
        send_record(stream, call).await?;
        recv_record(stream).await
    };
    let record = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| BackendError::Timeout(timeout))??;
    decode_reply(xid, record)
}

// ---------------------------------------------------------------------------
// Portmapper lookup and host probing
// ---------------------------------------------------------------------------

/// Ask the host's portmapper where the VXI-11 core channel listens.
///
/// The whole exchange (connect + call) is bounded by `timeout`.
pub async fn core_channel_port(host: Ipv4Addr, timeout: Duration) -> Result<u16, BackendError> {
    let connect = TcpStream::connect((host, PORTMAP_PORT));
    let mut stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| BackendError::Timeout(timeout))?
        .map_err(BackendError::Io)?;

    let mut args = BytesMut::new();
    args.put_u32(DEVICE_CORE_PROGRAM);
    args.put_u32(DEVICE_CORE_VERSION);
    args.put_u32(IPPROTO_TCP);
    args.put_u32(0);
    let call = encode_call(1, PORTMAP_PROGRAM, PORTMAP_VERSION, PMAP_GETPORT, &args);

    let mut reply = round_trip(&mut stream, 1, &call, timeout).await?;
    let port = get_u32(&mut reply)?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(BackendError::Protocol(format!(
            "{host}: VXI-11 core channel not registered"
        )));
    }
    Ok(port as u16)
}

/// Probe one host: does it expose a VXI-11 core channel?
///
/// Returns the VISA-style resource string on success, `None` on any failure
/// (unreachable, timed out, no portmapper, program not registered). Used by
/// the network scanner, which treats every failure as "not an instrument".
pub async fn probe(host: Ipv4Addr, timeout: Duration) -> Option<String> {
    match core_channel_port(host, timeout).await {
        Ok(port) => {
            debug!(%host, port, "VXI-11 instrument found");
            Some(resource_string(host))
        }
        Err(err) => {
            trace!(%host, %err, "VXI-11 probe failed");
            None
        }
    }
}

/// VISA-style resource string for a VXI-11 host.
pub fn resource_string(host: Ipv4Addr) -> String {
    format!("TCPIP0::{host}::INSTR")
}

// ---------------------------------------------------------------------------
// Core channel backend
// ---------------------------------------------------------------------------

/// Command channel over a VXI-11 core link.
pub struct Vxi11Backend {
    host: Ipv4Addr,
    stream: tokio::sync::Mutex<TcpStream>,
    link_id: u32,
    max_recv_size: u32,
    timeout: Mutex<Duration>,
    xid: AtomicU32,
}

impl Vxi11Backend {
    /// Connect to a host and create a link to the default device (`inst0`).
    pub async fn connect(host: Ipv4Addr, timeout: Duration) -> Result<Self, BackendError> {
        Self::connect_device(host, DEFAULT_DEVICE_NAME, timeout).await
    }

    /// Connect to a host and create a link to a named logical device.
    pub async fn connect_device(
        host: Ipv4Addr,
        device: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let port = core_channel_port(host, timeout).await?;
        let connect = TcpStream::connect((host, port));
        let mut stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
            .map_err(BackendError::Io)?;

        // create_link(clientId, lockDevice, lock_timeout, device)
        let mut args = BytesMut::new();
        args.put_u32(std::process::id());
        args.put_u32(0); // lockDevice = false
        args.put_u32(0); // lock_timeout
        put_opaque(&mut args, device.as_bytes());
        let xid = 1;
        let call = encode_call(
            xid,
            DEVICE_CORE_PROGRAM,
            DEVICE_CORE_VERSION,
            PROC_CREATE_LINK,
            &args,
        );
        let mut reply = round_trip(&mut stream, xid, &call, timeout).await?;
        check_device_error(get_u32(&mut reply)?, timeout)?;
        let link_id = get_u32(&mut reply)?;
        let _abort_port = get_u32(&mut reply)?;
        let max_recv_size = get_u32(&mut reply)?.max(1024);
        debug!(%host, link_id, max_recv_size, "VXI-11 link created");

        Ok(Self {
            host,
            stream: tokio::sync::Mutex::new(stream),
            link_id,
            max_recv_size,
            timeout: Mutex::new(timeout),
            xid: AtomicU32::new(xid + 1),
        })
    }

    /// Host this session is bound to.
    pub fn host(&self) -> Ipv4Addr {
        self.host
    }

    fn next_xid(&self) -> u32 {
        self.xid.fetch_add(1, Ordering::Relaxed)
    }

    fn current_timeout(&self) -> Duration {
        // A poisoned lock only means another thread panicked while storing a
        // Duration; the stored value is still usable.
        match self.timeout.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    async fn call(&self, procedure: u32, args: &[u8]) -> Result<Bytes, BackendError> {
        let timeout = self.current_timeout();
        let xid = self.next_xid();
        let call = encode_call(
            xid,
            DEVICE_CORE_PROGRAM,
            DEVICE_CORE_VERSION,
            procedure,
            args,
        );
        let mut stream = self.stream.lock().await;
        round_trip(&mut stream, xid, &call, timeout).await
    }

    async fn device_write(&self, data: &[u8]) -> Result<(), BackendError> {
        let timeout = self.current_timeout();
        let mut args = BytesMut::new();
        args.put_u32(self.link_id);
        args.put_u32(timeout.as_millis() as u32); // io_timeout
        args.put_u32(0); // lock_timeout
        args.put_u32(FLAG_END);
        put_opaque(&mut args, data);
        let mut reply = self.call(PROC_DEVICE_WRITE, &args).await?;
        check_device_error(get_u32(&mut reply)?, timeout)?;
        let _size = get_u32(&mut reply)?;
        Ok(())
    }

    async fn device_read(&self) -> Result<String, BackendError> {
        let timeout = self.current_timeout();
        let mut response = Vec::new();
        loop {
            let mut args = BytesMut::new();
            args.put_u32(self.link_id);
            args.put_u32(self.max_recv_size);
            args.put_u32(timeout.as_millis() as u32);
            args.put_u32(0); // lock_timeout
            args.put_u32(0); // flags
            args.put_u32(0); // termChar
            let mut reply = self.call(PROC_DEVICE_READ, &args).await?;
            check_device_error(get_u32(&mut reply)?, timeout)?;
            let reason = get_u32(&mut reply)?;
            let data = get_opaque(&mut reply)?;
            response.extend_from_slice(&data);
            if reason & (REASON_END | REASON_TERMCHAR) != 0 {
                break;
            }
            if data.is_empty() {
                return Err(BackendError::Malformed(
                    "device_read returned no data and no end reason".into(),
                ));
            }
        }
        Ok(String::from_utf8_lossy(&response).trim().to_string())
    }

    /// Release the link on the instrument. Best effort; dropping the backend
    /// closes the TCP stream, which also invalidates the link server-side.
    pub async fn close(&self) -> Result<(), BackendError> {
        let mut args = BytesMut::new();
        args.put_u32(self.link_id);
        let mut reply = self.call(PROC_DESTROY_LINK, &args).await?;
        check_device_error(get_u32(&mut reply)?, self.current_timeout())?;
        Ok(())
    }
}

fn check_device_error(code: u32, timeout: Duration) -> Result<(), BackendError> {
    match code {
        0 => Ok(()),
        ERR_IO_TIMEOUT => Err(BackendError::Timeout(timeout)),
        other => Err(BackendError::Protocol(format!("device error {other}"))),
    }
}

#[async_trait]
impl Backend for Vxi11Backend {
    async fn write(&self, command: &str) -> Result<(), BackendError> {
        trace!(host = %self.host, command, "vxi11 write");
        self.device_write(format!("{command}\n").as_bytes()).await
    }

    async fn query(&self, command: &str) -> Result<String, BackendError> {
        trace!(host = %self.host, command, "vxi11 query");
        self.device_write(format!("{command}\n").as_bytes()).await?;
        let response = self.device_read().await?;
        trace!(host = %self.host, response, "vxi11 response");
        Ok(response)
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<(), BackendError> {
        match self.timeout.lock() {
            Ok(mut guard) => *guard = timeout,
            Err(poisoned) => *poisoned.into_inner() = timeout,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_is_padded_to_four_bytes() {
        let mut buf = BytesMut::new();
        put_opaque(&mut buf, b"*IDN?");
        // 4 length bytes + 5 data + 3 pad
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[9..], &[0, 0, 0]);

        let mut bytes = buf.freeze();
        let data = get_opaque(&mut bytes).expect("decode");
        assert_eq!(&data[..], b"*IDN?");
        assert_eq!(bytes.remaining(), 0);
    }

    #[test]
    fn call_header_layout() {
        let call = encode_call(7, PORTMAP_PROGRAM, PORTMAP_VERSION, PMAP_GETPORT, &[]);
        let expected: &[u32] = &[
            7,               // xid
            MSG_CALL,        // call
            RPC_VERSION,     // rpcvers
            PORTMAP_PROGRAM, // prog
            PORTMAP_VERSION, // vers
            PMAP_GETPORT,    // proc
            AUTH_NONE,
            0,
            AUTH_NONE,
            0,
        ];
        let mut buf = Bytes::from(call.to_vec());
        for word in expected {
            assert_eq!(buf.get_u32(), *word);
        }
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn reply_decoding_checks_xid_and_status() {
        let mut reply = BytesMut::new();
        reply.put_u32(7); // xid
        reply.put_u32(MSG_REPLY);
        reply.put_u32(REPLY_ACCEPTED);
        reply.put_u32(AUTH_NONE);
        reply.put_u32(0);
        reply.put_u32(ACCEPT_SUCCESS);
        reply.put_u32(0x0619); // payload: the mapped port

        let mut payload = decode_reply(7, reply.clone().freeze()).expect("decode");
        assert_eq!(get_u32(&mut payload).ok(), Some(0x0619));

        assert!(decode_reply(8, reply.freeze()).is_err());
    }

    #[test]
    fn truncated_reply_is_malformed() {
        let reply = Bytes::from(vec![0u8, 0, 0]);
        assert!(matches!(
            decode_reply(0, reply),
            Err(BackendError::Malformed(_))
        ));
    }

    #[test]
    fn io_timeout_code_maps_to_timeout() {
        let timeout = Duration::from_millis(10);
        assert!(matches!(
            check_device_error(ERR_IO_TIMEOUT, timeout),
            Err(BackendError::Timeout(_))
        ));
        assert!(check_device_error(0, timeout).is_ok());
    }

    #[test]
    fn resource_string_format() {
        let ip: Ipv4Addr = "192.168.1.2".parse().expect("ip");
        assert_eq!(resource_string(ip), "TCPIP0::192.168.1.2::INSTR");
    }

    #[tokio::test]
    async fn probe_times_out_on_unroutable_host() {
        // TEST-NET-1 (RFC 5737) is guaranteed unrouted.
        let ip: Ipv4Addr = "192.0.2.1".parse().expect("ip");
        let started = std::time::Instant::now();
        let result = probe(ip, Duration::from_millis(20)).await;
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn getport_round_trip_against_fake_portmapper() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        // One-shot fake portmapper answering GETPORT with port 1024.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let record = recv_record(&mut socket).await.expect("record");
            let mut call = record;
            let xid = get_u32(&mut call).expect("xid");

            let mut reply = BytesMut::new();
            reply.put_u32(xid);
            reply.put_u32(MSG_REPLY);
            reply.put_u32(REPLY_ACCEPTED);
            reply.put_u32(AUTH_NONE);
            reply.put_u32(0);
            reply.put_u32(ACCEPT_SUCCESS);
            reply.put_u32(1024);
            send_record(&mut socket, &reply).await.expect("send");
        });

        // Drive the same code path as `core_channel_port`, but against the
        // fake's port instead of 111.
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let mut args = BytesMut::new();
        args.put_u32(DEVICE_CORE_PROGRAM);
        args.put_u32(DEVICE_CORE_VERSION);
        args.put_u32(IPPROTO_TCP);
        args.put_u32(0);
        let call = encode_call(1, PORTMAP_PROGRAM, PORTMAP_VERSION, PMAP_GETPORT, &args);
        let mut reply = round_trip(&mut stream, 1, &call, Duration::from_secs(1))
            .await
            .expect("round trip");
        assert_eq!(get_u32(&mut reply).ok(), Some(1024));

        server.await.expect("server task");
    }
}
