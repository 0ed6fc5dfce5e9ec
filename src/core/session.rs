//! Queue session: packet dispatch, verdicts and divert rule lifecycle
//!
//! A [`QueueSession`] owns one bound kernel queue and one rule backend.
//! [`QueueSession::register`] starts a dispatcher task that classifies each
//! queued packet and hands the inspectable ones to a callback, then installs
//! the divert rules. [`QueueSession::close`] stops dispatch, removes the rules
//! and unbinds the queue.
//!
//! Packets are handed to the callback by value and consumed by
//! [`VerdictHandle::set_verdict`], so each packet is verdicted at most once.
//! Packets the callback never verdicts are released by the kernel when the
//! queue is unbound.
//!
//! Only one session per rule table name may be active on a host: a second
//! session would replace the first one's rules and remove them on close.

use crate::config::QueueConfig;
use crate::core::attr;
use crate::core::backend::{BackendKind, RuleBackend};
use crate::core::classify::{Classification, classify};
use crate::core::error::{Error, Result};
use crate::core::policy::{DEFAULT_QUEUE_SIZE, DivertParams, MAX_PACKET_LEN, SessionPolicy};
use crate::core::queue::{KernelVerdict, NetlinkQueue, QueueOptions, QueueTransport, RawEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A queued packet awaiting a verdict.
#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
    id: u32,
    stream_id: u32,
    data: Vec<u8>,
    session: u64,
}

impl Packet {
    /// Kernel packet id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Kernel connection id, or 0 when the connection is unknown
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Raw IP packet bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Decision for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Verdict {
    /// Let this packet through.
    Accept,
    /// Let this packet through with replaced bytes.
    AcceptModify,
    /// Let this packet and every later packet of its connection through.
    AcceptStream,
    /// Drop this packet.
    Drop,
    /// Drop this packet and every later packet of its connection.
    DropStream,
}

/// What the dispatcher delivers to the callback
#[derive(Debug)]
pub enum QueueEvent {
    Packet(Packet),
    /// Transport failure other than receive-buffer overflow
    Error(Error),
}

/// Callback result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Issues verdicts for packets of one session.
///
/// Cheap to clone; clones can be moved to worker tasks.
pub struct VerdictHandle<T> {
    session: u64,
    transport: Arc<T>,
    accept_mark: u32,
    drop_mark: u32,
}

impl<T> Clone for VerdictHandle<T> {
    fn clone(&self) -> Self {
        Self {
            session: self.session,
            transport: Arc::clone(&self.transport),
            accept_mark: self.accept_mark,
            drop_mark: self.drop_mark,
        }
    }
}

impl<T: QueueTransport> VerdictHandle<T> {
    /// Applies `verdict` to `packet`.
    ///
    /// `replacement` is only used by [`Verdict::AcceptModify`]; without it
    /// the packet is accepted unchanged. Stream verdicts write the accept or
    /// drop mark into the connection so the divert rules settle later
    /// packets of that connection without queueing them.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPacket`] if the packet came from another session (no
    /// kernel call is made), [`Error::Transport`] if the verdict could not be
    /// sent.
    pub fn set_verdict(
        &self,
        packet: Packet,
        verdict: Verdict,
        replacement: Option<&[u8]>,
    ) -> Result<()> {
        if packet.session != self.session {
            return Err(Error::InvalidPacket);
        }

        let t = &self.transport;
        let result = match verdict {
            Verdict::Accept => t.set_verdict(packet.id, KernelVerdict::Accept),
            Verdict::AcceptModify => match replacement {
                Some(bytes) => t.set_verdict_modified(packet.id, KernelVerdict::Accept, bytes),
                None => t.set_verdict(packet.id, KernelVerdict::Accept),
            },
            Verdict::AcceptStream => {
                t.set_verdict_with_conn_mark(packet.id, KernelVerdict::Accept, self.accept_mark)
            }
            Verdict::Drop => t.set_verdict(packet.id, KernelVerdict::Drop),
            Verdict::DropStream => {
                t.set_verdict_with_conn_mark(packet.id, KernelVerdict::Drop, self.drop_mark)
            }
        };
        result.map_err(Error::Transport)
    }
}

/// What the session has done to the firewall so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleState {
    Absent,
    /// An install was attempted and failed part-way
    Partial,
    Installed,
}

/// One bound queue plus its divert rules.
pub struct QueueSession<T: QueueTransport = NetlinkQueue> {
    handle: VerdictHandle<T>,
    backend: RuleBackend,
    policy: SessionPolicy,
    dispatcher: Option<JoinHandle<()>>,
    rules: RuleState,
}

impl QueueSession<NetlinkQueue> {
    /// Selects a rule backend and binds the kernel queue.
    ///
    /// Must be called from within a tokio runtime. Rules are not touched
    /// until [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for local mode with TCP reset, [`Error::Setup`] when
    /// no firewall tool is found or the queue cannot be bound.
    pub fn open(config: &QueueConfig) -> Result<Self> {
        let policy = config.policy()?;

        if !nix::unistd::getuid().is_root() {
            warn!("Not running as root; binding the queue and changing rules will likely fail");
        }

        let params = DivertParams::default().with_table_name(config.table_name.clone())?;
        let backend = RuleBackend::probe(params.clone())?;

        let max_queue_len = if config.queue_size == 0 {
            DEFAULT_QUEUE_SIZE
        } else {
            config.queue_size
        };
        let transport = NetlinkQueue::open(&QueueOptions {
            queue_num: params.queue_num(),
            max_packet_len: MAX_PACKET_LEN,
            max_queue_len,
            read_buffer: config.read_buffer,
            write_buffer: config.write_buffer,
        })?;

        Ok(Self::open_with(transport, backend, policy))
    }
}

impl<T: QueueTransport> QueueSession<T> {
    /// Builds a session around an already bound transport.
    pub fn open_with(transport: T, backend: RuleBackend, policy: SessionPolicy) -> Self {
        let params = backend.params();
        let handle = VerdictHandle {
            session: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            transport: Arc::new(transport),
            accept_mark: params.accept_mark(),
            drop_mark: params.drop_mark(),
        };
        Self {
            handle,
            backend,
            policy,
            dispatcher: None,
            rules: RuleState::Absent,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn verdict_handle(&self) -> VerdictHandle<T> {
        self.handle.clone()
    }

    #[cfg(test)]
    pub(crate) fn test_packet(&self, id: u32, stream_id: u32, data: Vec<u8>) -> Packet {
        Packet {
            id,
            stream_id,
            data,
            session: self.handle.session,
        }
    }

    /// Shorthand for `verdict_handle().set_verdict(..)`.
    pub fn set_verdict(
        &self,
        packet: Packet,
        verdict: Verdict,
        replacement: Option<&[u8]>,
    ) -> Result<()> {
        self.handle.set_verdict(packet, verdict, replacement)
    }

    /// Starts dispatching packets to `callback` and installs the divert
    /// rules.
    ///
    /// The dispatcher runs until the callback returns [`Flow::Stop`],
    /// `shutdown` becomes `true`, or its sender is dropped. Stopping dispatch
    /// leaves the rules installed; [`close`](Self::close) removes them.
    /// Rules are installed once per session; registering again after the
    /// dispatcher stopped only restarts dispatch.
    ///
    /// If installation fails the dispatcher keeps running: rules applied
    /// before the failure may already divert traffic into the queue, and
    /// those packets still need verdicts. Call [`close`](Self::close) to stop
    /// dispatch and remove whatever was applied.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRegistered`] while a dispatcher is running. Rule
    /// installation errors are returned with the dispatcher still running.
    pub async fn register<F>(&mut self, shutdown: watch::Receiver<bool>, callback: F) -> Result<()>
    where
        F: FnMut(QueueEvent) -> Flow + Send + 'static,
    {
        if self.dispatcher.as_ref().is_some_and(|d| !d.is_finished()) {
            return Err(Error::AlreadyRegistered);
        }

        let dispatcher = Dispatcher {
            handle: self.handle.clone(),
            local: self.policy.is_local(),
            callback,
        };
        self.dispatcher = Some(tokio::spawn(dispatcher.run(shutdown)));

        if self.rules != RuleState::Installed {
            if let Err(e) = self.backend.install(&self.policy).await {
                self.rules = RuleState::Partial;
                warn!("Divert rule install failed, packets already queued are still dispatched");
                return Err(e);
            }
            self.rules = RuleState::Installed;
            info!(
                "Divert rules installed ({} backend, {} mode{})",
                self.backend.kind(),
                if self.policy.is_local() { "local" } else { "forward" },
                if self.policy.rst() { ", tcp reset" } else { "" }
            );
        }

        Ok(())
    }

    /// Stops dispatch, removes the divert rules and unbinds the queue.
    ///
    /// Rules left by a failed install are removed too. Rule removal failures
    /// are logged and do not fail the close.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] if unbinding the queue fails.
    pub async fn close(mut self) -> Result<()> {
        if let Some(d) = self.dispatcher.take() {
            d.abort();
            let _ = d.await;
        }

        if self.rules != RuleState::Absent {
            match self.backend.remove(&self.policy).await {
                Ok(()) => info!("Divert rules removed"),
                Err(e) => warn!("Failed to remove divert rules: {e}"),
            }
            self.rules = RuleState::Absent;
        }

        self.handle.transport.close().map_err(Error::Transport)
    }
}

impl<T: QueueTransport> Drop for QueueSession<T> {
    fn drop(&mut self) {
        if let Some(d) = self.dispatcher.take() {
            d.abort();
        }
        if self.rules != RuleState::Absent {
            warn!("Queue session dropped without close; divert rules are still installed");
        }
    }
}

struct Dispatcher<T, F> {
    handle: VerdictHandle<T>,
    local: bool,
    callback: F,
}

impl<T, F> Dispatcher<T, F>
where
    T: QueueTransport,
    F: FnMut(QueueEvent) -> Flow + Send + 'static,
{
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let batch = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                batch = self.handle.transport.recv() => batch,
            };

            let flow = match batch {
                Ok(events) => self.deliver(events),
                Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                    debug!("Queue receive buffer overflowed; packets were dropped by the kernel");
                    Flow::Continue
                }
                Err(e) => (self.callback)(QueueEvent::Error(Error::Transport(e))),
            };
            if flow == Flow::Stop {
                break;
            }
        }
        debug!("Dispatcher for session {} stopped", self.handle.session);
    }

    fn deliver(&mut self, events: Vec<RawEvent>) -> Flow {
        for event in events {
            let flow = match classify(event, self.local) {
                Classification::Unverdictable => {
                    debug!("Ignoring queue event without packet id");
                    Flow::Continue
                }
                Classification::Synthetic { packet_id, verdict } => {
                    debug!("Packet {packet_id}: {verdict} without inspection");
                    match self.handle.transport.set_verdict(packet_id, verdict) {
                        Ok(()) => Flow::Continue,
                        Err(e) => (self.callback)(QueueEvent::Error(Error::Transport(e))),
                    }
                }
                Classification::Eligible {
                    packet_id,
                    payload,
                    conntrack,
                } => (self.callback)(QueueEvent::Packet(Packet {
                    id: packet_id,
                    stream_id: attr::conntrack_id(&conntrack).unwrap_or(0),
                    data: payload,
                    session: self.handle.session,
                })),
            };
            if flow == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{MockTransport, RecordedVerdict, memory_backend};

    fn session(policy: SessionPolicy) -> (QueueSession<MockTransport>, MockTransport) {
        let mock = MockTransport::new();
        let (backend, _) = memory_backend();
        (QueueSession::open_with(mock.clone(), backend, policy), mock)
    }

    fn packet(session: &QueueSession<MockTransport>, id: u32) -> Packet {
        session.test_packet(id, 42, vec![0x45; 40])
    }

    #[test]
    fn test_verdict_mapping() {
        let (s, mock) = session(SessionPolicy::forward());

        s.set_verdict(packet(&s, 1), Verdict::Accept, None).unwrap();
        s.set_verdict(packet(&s, 2), Verdict::Drop, None).unwrap();
        s.set_verdict(packet(&s, 3), Verdict::AcceptStream, None).unwrap();
        s.set_verdict(packet(&s, 4), Verdict::DropStream, None).unwrap();
        s.set_verdict(packet(&s, 5), Verdict::AcceptModify, Some(&[1, 2, 3]))
            .unwrap();

        assert_eq!(
            mock.verdicts(),
            vec![
                RecordedVerdict::plain(1, KernelVerdict::Accept),
                RecordedVerdict::plain(2, KernelVerdict::Drop),
                RecordedVerdict::marked(3, KernelVerdict::Accept, 1001),
                RecordedVerdict::marked(4, KernelVerdict::Drop, 1002),
                RecordedVerdict::modified(5, KernelVerdict::Accept, vec![1, 2, 3]),
            ]
        );
    }

    #[test]
    fn test_accept_modify_without_bytes_is_plain_accept() {
        let (s, mock) = session(SessionPolicy::forward());
        s.set_verdict(packet(&s, 8), Verdict::AcceptModify, None)
            .unwrap();
        assert_eq!(
            mock.verdicts(),
            vec![RecordedVerdict::plain(8, KernelVerdict::Accept)]
        );
    }

    #[test]
    fn test_foreign_packet_rejected() {
        let (a, mock) = session(SessionPolicy::forward());
        let (b, _) = session(SessionPolicy::forward());

        let result = a.set_verdict(packet(&b, 1), Verdict::Accept, None);
        assert!(matches!(result, Err(Error::InvalidPacket)));
        assert!(mock.verdicts().is_empty());
    }

    #[test]
    fn test_verdict_name_parsing() {
        assert_eq!("drop-stream".parse::<Verdict>().unwrap(), Verdict::DropStream);
        assert_eq!(Verdict::AcceptStream.to_string(), "accept-stream");
    }

    #[tokio::test]
    async fn test_register_twice_rejected() {
        let (mut s, _mock) = session(SessionPolicy::forward());
        let (_tx, rx) = watch::channel(false);

        s.register(rx.clone(), |_| Flow::Continue).await.unwrap();
        let second = s.register(rx, |_| Flow::Continue).await;
        assert!(matches!(second, Err(Error::AlreadyRegistered)));

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unbinds_transport() {
        let (mut s, mock) = session(SessionPolicy::local());
        let (_tx, rx) = watch::channel(false);
        s.register(rx, |_| Flow::Continue).await.unwrap();

        s.close().await.unwrap();
        assert!(mock.is_closed());
    }
}
