//! NFQUEUE transport over a raw netfilter netlink socket
//!
//! [`QueueTransport`] is the seam between the session and the kernel: it
//! yields raw queue events and issues verdicts. [`NetlinkQueue`] is the
//! kernel implementation; tests drive the session through an in-memory one.
//!
//! # Wire format
//!
//! Every message is a netlink header (16 bytes, native endian), an
//! `nfgenmsg` (family, version, big-endian queue number) and netlink
//! attributes. Attribute payloads defined by nfnetlink_queue are big endian.

use crate::core::attr::{self, CTA_MARK, NLA_HDRLEN};
use crate::core::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info};

const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NFNETLINK_V0: u8 = 0;
const NFNL_SUBSYS_QUEUE: u16 = 3;

const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;

// Message types within the queue subsystem
const NFQNL_MSG_PACKET: u16 = 0;
const NFQNL_MSG_VERDICT: u16 = 1;
const NFQNL_MSG_CONFIG: u16 = 2;

// Config commands
const NFQNL_CFG_CMD_BIND: u8 = 1;
const NFQNL_CFG_CMD_UNBIND: u8 = 2;

// Config attributes
const NFQA_CFG_CMD: u16 = 1;
const NFQA_CFG_PARAMS: u16 = 2;
const NFQA_CFG_QUEUE_MAXLEN: u16 = 3;
const NFQA_CFG_MASK: u16 = 4;
const NFQA_CFG_FLAGS: u16 = 5;
const NFQA_CFG_F_CONNTRACK: u32 = 1 << 1;
const NFQNL_COPY_PACKET: u8 = 2;

// Packet and verdict attributes
const NFQA_PACKET_HDR: u16 = 1;
const NFQA_VERDICT_HDR: u16 = 2;
const NFQA_PAYLOAD: u16 = 10;
const NFQA_CT: u16 = 11;

const RECV_BUF_LEN: usize = 0xFFFF + 4096;

/// Kernel verdict values
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[repr(u32)]
pub enum KernelVerdict {
    #[strum(serialize = "NF_DROP")]
    Drop = 0,
    #[strum(serialize = "NF_ACCEPT")]
    Accept = 1,
}

/// One queued packet as delivered by the kernel, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub packet_id: Option<u32>,
    pub payload: Option<Vec<u8>>,
    /// Raw `NFQA_CT` attribute stream
    pub conntrack: Option<Vec<u8>>,
}

/// Receives queue events and issues verdicts.
///
/// Verdict methods take `&self` and may be called concurrently from any
/// task while `recv` is pending.
pub trait QueueTransport: Send + Sync + 'static {
    /// Waits for the next batch of events.
    ///
    /// `ENOBUFS` is reported as an `io::Error` carrying that errno.
    fn recv(&self) -> impl Future<Output = io::Result<Vec<RawEvent>>> + Send;

    fn set_verdict(&self, packet_id: u32, verdict: KernelVerdict) -> io::Result<()>;

    /// Issues a verdict and replaces the packet bytes.
    fn set_verdict_modified(
        &self,
        packet_id: u32,
        verdict: KernelVerdict,
        payload: &[u8],
    ) -> io::Result<()>;

    /// Issues a verdict and writes `mark` into the packet's connection.
    fn set_verdict_with_conn_mark(
        &self,
        packet_id: u32,
        verdict: KernelVerdict,
        mark: u32,
    ) -> io::Result<()>;

    /// Unbinds from the queue.
    fn close(&self) -> io::Result<()>;
}

/// Parameters for binding the kernel queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub queue_num: u16,
    /// Bytes of each packet copied to user space
    pub max_packet_len: u32,
    /// Packets the kernel buffers before dropping
    pub max_queue_len: u32,
    pub read_buffer: Option<usize>,
    pub write_buffer: Option<usize>,
}

/// NFQUEUE bound through a `NETLINK_NETFILTER` socket.
pub struct NetlinkQueue {
    fd: AsyncFd<Socket>,
    queue_num: u16,
    seq: AtomicU32,
}

impl NetlinkQueue {
    /// Opens the socket, binds the queue and configures copy mode, queue
    /// length and conntrack delivery.
    ///
    /// Must be called from within a tokio runtime. The socket is closed on
    /// every error path when it is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Setup`] if the socket cannot be created, bound or
    /// configured, or if the kernel rejects the queue configuration.
    pub fn open(opts: &QueueOptions) -> Result<Self> {
        let socket = Socket::new(
            Domain::from(libc::AF_NETLINK),
            Type::from(libc::SOCK_RAW),
            Some(Protocol::from(libc::NETLINK_NETFILTER)),
        )
        .map_err(|e| Error::Setup(format!("failed to open netfilter netlink socket: {e}")))?;

        bind_kernel(socket.as_raw_fd())
            .map_err(|e| Error::Setup(format!("failed to bind netlink socket: {e}")))?;

        if let Some(size) = opts.read_buffer.filter(|s| *s > 0) {
            socket
                .set_recv_buffer_size(size)
                .map_err(|e| Error::Setup(format!("failed to set read buffer to {size}: {e}")))?;
        }
        if let Some(size) = opts.write_buffer.filter(|s| *s > 0) {
            socket
                .set_send_buffer_size(size)
                .map_err(|e| Error::Setup(format!("failed to set write buffer to {size}: {e}")))?;
        }

        let seq = AtomicU32::new(0);
        let configure = |attrs: Vec<u8>| -> io::Result<()> {
            let seq = seq.fetch_add(1, Ordering::Relaxed) + 1;
            let msg = build_message(
                NFQNL_MSG_CONFIG,
                NLM_F_REQUEST | NLM_F_ACK,
                seq,
                opts.queue_num,
                &attrs,
            );
            send_kernel(socket.as_raw_fd(), &msg)?;
            recv_ack(&socket, seq)
        };

        configure(cmd_attr(NFQNL_CFG_CMD_BIND))
            .map_err(|e| Error::Setup(format!("failed to bind queue {}: {e}", opts.queue_num)))?;

        let mut params = Vec::with_capacity(5);
        params.extend_from_slice(&opts.max_packet_len.to_be_bytes());
        params.push(NFQNL_COPY_PACKET);
        let mut attrs = Vec::new();
        attr::put_attr(&mut attrs, NFQA_CFG_PARAMS, &params);
        attr::put_attr(&mut attrs, NFQA_CFG_QUEUE_MAXLEN, &opts.max_queue_len.to_be_bytes());
        attr::put_attr(&mut attrs, NFQA_CFG_FLAGS, &NFQA_CFG_F_CONNTRACK.to_be_bytes());
        attr::put_attr(&mut attrs, NFQA_CFG_MASK, &NFQA_CFG_F_CONNTRACK.to_be_bytes());
        configure(attrs).map_err(|e| {
            Error::Setup(format!("failed to configure queue {}: {e}", opts.queue_num))
        })?;

        let fd = register_socket(socket)?;

        info!(
            "Bound NFQUEUE {} (copy {} bytes, queue length {})",
            opts.queue_num, opts.max_packet_len, opts.max_queue_len
        );

        Ok(Self {
            fd,
            queue_num: opts.queue_num,
            seq: AtomicU32::new(seq.into_inner()),
        })
    }

    fn send(&self, msg_type: u16, flags: u16, attrs: &[u8]) -> io::Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let msg = build_message(msg_type, flags, seq, self.queue_num, attrs);
        send_kernel(self.fd.get_ref().as_raw_fd(), &msg)
    }

    fn verdict(
        &self,
        packet_id: u32,
        verdict: KernelVerdict,
        extra: impl FnOnce(&mut Vec<u8>),
    ) -> io::Result<()> {
        let mut hdr = [0u8; 8];
        hdr[..4].copy_from_slice(&(verdict as u32).to_be_bytes());
        hdr[4..].copy_from_slice(&packet_id.to_be_bytes());

        let mut attrs = Vec::with_capacity(NLA_HDRLEN + hdr.len());
        attr::put_attr(&mut attrs, NFQA_VERDICT_HDR, &hdr);
        extra(&mut attrs);
        self.send(NFQNL_MSG_VERDICT, NLM_F_REQUEST, &attrs)
    }
}

impl QueueTransport for NetlinkQueue {
    async fn recv(&self) -> io::Result<Vec<RawEvent>> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let mut guard = self.fd.readable().await?;
            let read = guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(&mut buf)
            });
            match read {
                Ok(Ok(n)) => return parse_messages(&buf[..n]),
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {}
            }
        }
    }

    fn set_verdict(&self, packet_id: u32, verdict: KernelVerdict) -> io::Result<()> {
        self.verdict(packet_id, verdict, |_| {})
    }

    fn set_verdict_modified(
        &self,
        packet_id: u32,
        verdict: KernelVerdict,
        payload: &[u8],
    ) -> io::Result<()> {
        self.verdict(packet_id, verdict, |attrs| {
            attr::put_attr(attrs, NFQA_PAYLOAD, payload);
        })
    }

    fn set_verdict_with_conn_mark(
        &self,
        packet_id: u32,
        verdict: KernelVerdict,
        mark: u32,
    ) -> io::Result<()> {
        self.verdict(packet_id, verdict, |attrs| {
            let mut ct = Vec::with_capacity(NLA_HDRLEN + 4);
            attr::put_attr(&mut ct, CTA_MARK, &mark.to_be_bytes());
            attr::put_nested(attrs, NFQA_CT, &ct);
        })
    }

    fn close(&self) -> io::Result<()> {
        debug!("Unbinding NFQUEUE {}", self.queue_num);
        self.send(NFQNL_MSG_CONFIG, NLM_F_REQUEST, &cmd_attr(NFQNL_CFG_CMD_UNBIND))
    }
}

/// `NFQA_CFG_CMD` attribute: command, pad, protocol family (unspecified)
fn cmd_attr(cmd: u8) -> Vec<u8> {
    let mut attrs = Vec::with_capacity(8);
    attr::put_attr(&mut attrs, NFQA_CFG_CMD, &[cmd, 0, 0, 0]);
    attrs
}

/// Builds a queue-subsystem netlink message.
fn build_message(msg_type: u16, flags: u16, seq: u32, queue_num: u16, attrs: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + NFGENMSG_LEN + attrs.len();
    let mut msg = Vec::with_capacity(len);
    msg.extend_from_slice(&(len as u32).to_ne_bytes());
    msg.extend_from_slice(&((NFNL_SUBSYS_QUEUE << 8) | msg_type).to_ne_bytes());
    msg.extend_from_slice(&flags.to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    msg.push(libc::AF_UNSPEC as u8);
    msg.push(NFNETLINK_V0);
    msg.extend_from_slice(&queue_num.to_be_bytes());
    msg.extend_from_slice(attrs);
    msg
}

/// Switches the socket to non-blocking mode and registers it with the
/// current runtime's reactor.
fn register_socket(socket: Socket) -> Result<AsyncFd<Socket>> {
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::Setup(format!("failed to make socket non-blocking: {e}")))?;
    // SAFETY: the Socket owns its descriptor and moves into the AsyncFd, so
    // the fd stays open and unchanged until the AsyncFd is dropped
    unsafe { AsyncFd::register(socket) }.map_err(|e| {
        Error::Setup(format!(
            "failed to register socket with runtime: {}",
            io::Error::from(e)
        ))
    })
}

fn kernel_addr() -> libc::sockaddr_nl {
    // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value
    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr
}

fn bind_kernel(fd: RawFd) -> io::Result<()> {
    let addr = kernel_addr();
    // SAFETY: addr outlives the call and the length matches its type
    let rc = unsafe {
        libc::bind(
            fd,
            (&raw const addr).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn send_kernel(fd: RawFd, msg: &[u8]) -> io::Result<()> {
    let addr = kernel_addr();
    // SAFETY: msg and addr outlive the call and the lengths match
    let sent = unsafe {
        libc::sendto(
            fd,
            msg.as_ptr().cast::<libc::c_void>(),
            msg.len(),
            0,
            (&raw const addr).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if sent < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Reads until the ACK for `seq` arrives; packets seen meanwhile are skipped.
fn recv_ack(socket: &Socket, seq: u32) -> io::Result<()> {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let mut reader: &Socket = socket;
        let n = reader.read(&mut buf)?;
        let mut pos = 0;
        while let Some((msg_type, msg_seq, body, next)) = next_message(&buf[..n], pos)? {
            if msg_type == libc::NLMSG_ERROR as u16 && msg_seq == seq {
                return ack_status(body);
            }
            pos = next;
        }
    }
}

/// Splits the message at `pos`: (type, seq, body, next offset).
fn next_message(buf: &[u8], pos: usize) -> io::Result<Option<(u16, u32, &[u8], usize)>> {
    if pos + NLMSG_HDRLEN > buf.len() {
        return Ok(None);
    }
    let header = &buf[pos..pos + NLMSG_HDRLEN];
    let len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let msg_type = u16::from_ne_bytes([header[4], header[5]]);
    let seq = u32::from_ne_bytes([header[8], header[9], header[10], header[11]]);

    if len < NLMSG_HDRLEN || pos + len > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("netlink message at offset {pos} has invalid length {len}"),
        ));
    }

    let body = &buf[pos + NLMSG_HDRLEN..pos + len];
    Ok(Some((msg_type, seq, body, pos + attr::align(len))))
}

/// Interprets an `NLMSG_ERROR` body; error code 0 is a plain ACK.
fn ack_status(body: &[u8]) -> io::Result<()> {
    let code = body
        .get(..4)
        .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short netlink error message"))?;
    if code == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(-code))
    }
}

/// Parses one datagram into queue events.
pub(crate) fn parse_messages(buf: &[u8]) -> io::Result<Vec<RawEvent>> {
    let packet_type = (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET;
    let mut events = Vec::new();
    let mut pos = 0;

    while let Some((msg_type, _seq, body, next)) = next_message(buf, pos)? {
        if msg_type == libc::NLMSG_ERROR as u16 {
            ack_status(body)?;
        } else if msg_type == packet_type {
            events.push(parse_packet(body)?);
        }
        pos = next;
    }

    Ok(events)
}

fn parse_packet(body: &[u8]) -> io::Result<RawEvent> {
    let attrs = body
        .get(NFGENMSG_LEN..)
        .map(attr::parse)
        .unwrap_or(Ok(Vec::new()))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut event = RawEvent::default();
    for a in attrs {
        match a.kind {
            NFQA_PACKET_HDR => event.packet_id = a.be_u32(),
            NFQA_PAYLOAD => event.payload = Some(a.data.to_vec()),
            NFQA_CT => event.conntrack = Some(a.data.to_vec()),
            _ => {}
        }
    }
    Ok(event)
}
