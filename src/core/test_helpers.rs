//! Shared test utilities for core module tests
//!
//! Provides in-memory stand-ins for the kernel queue and the firewall tools
//! so session behavior can be tested without privileges.
//! This module is only compiled in test mode.

use crate::core::backend::{IptablesCommand, LegacyBackend, NftBackend, RuleBackend, RuleTable};
use crate::core::error::{Error, Result};
use crate::core::ipt::IptRule;
use crate::core::policy::DivertParams;
use crate::core::queue::{KernelVerdict, QueueTransport, RawEvent};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("NFQIO_NFT_COMMAND", "/bin/false");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("NFQIO_NFT_COMMAND");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// In-memory rule table that behaves like `iptables` for one family.
pub struct MemoryTable {
    family: &'static str,
    rules: Mutex<Vec<IptRule>>,
    checks: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryTable {
    pub fn new(family: &'static str) -> Self {
        Self {
            family,
            rules: Mutex::new(Vec::new()),
            checks: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn rules(&self) -> Vec<IptRule> {
        self.rules.lock().unwrap().clone()
    }

    /// Number of existence checks made
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    /// Number of deletions made
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleTable for MemoryTable {
    fn family(&self) -> &str {
        self.family
    }

    async fn exists(&self, rule: &IptRule) -> Result<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.rules.lock().unwrap().contains(rule))
    }

    async fn append(&self, rule: &IptRule) -> Result<()> {
        self.rules.lock().unwrap().push(rule.clone());
        Ok(())
    }

    async fn delete(&self, rule: &IptRule) -> Result<()> {
        let mut rules = self.rules.lock().unwrap();
        let Some(pos) = rules.iter().position(|r| r == rule) else {
            return Err(Error::Iptables {
                message: "Bad rule (does a matching rule exist in that chain?).".to_string(),
                stderr: None,
                exit_code: Some(1),
            });
        };
        rules.remove(pos);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Rule table that accepts a fixed number of appends, then fails.
pub struct FailingTable {
    family: &'static str,
    succeed: usize,
    applied: AtomicUsize,
}

impl FailingTable {
    pub fn new(family: &'static str, succeed: usize) -> Self {
        Self {
            family,
            succeed,
            applied: AtomicUsize::new(0),
        }
    }

    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuleTable for FailingTable {
    fn family(&self) -> &str {
        self.family
    }

    async fn exists(&self, _rule: &IptRule) -> Result<bool> {
        Ok(false)
    }

    async fn append(&self, _rule: &IptRule) -> Result<()> {
        if self.applied() >= self.succeed {
            return Err(Error::Iptables {
                message: "Another app is currently holding the xtables lock.".to_string(),
                stderr: Some("Another app is currently holding the xtables lock.".to_string()),
                exit_code: Some(4),
            });
        }
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, _rule: &IptRule) -> Result<()> {
        Ok(())
    }
}

/// Legacy backend over an in-memory IPv4 table, returned alongside it.
pub fn memory_backend() -> (RuleBackend, Arc<MemoryTable>) {
    let v4 = Arc::new(MemoryTable::new("ipv4"));
    let backend = RuleBackend::Legacy(LegacyBackend::new(
        vec![Box::new(Arc::clone(&v4))],
        DivertParams::default(),
    ));
    (backend, v4)
}

/// nft backend running a shell script that logs every invocation to `log`.
///
/// Each call appends its arguments as one line; `-f -` calls also append
/// the table text read from stdin. `delete` fails when `fail_delete` is set,
/// the way nft fails when the table does not exist.
pub fn logging_nft(log: &Path, fail_delete: bool) -> NftBackend {
    let script = format!(
        r#"echo "$*" >> '{log}'
if [ "$1" = "-f" ]; then cat >> '{log}'; fi
if [ "$1" = "delete" ] && [ "{fail}" = "1" ]; then
  echo "Error: No such file or directory" >&2
  exit 1
fi"#,
        log = log.display(),
        fail = u8::from(fail_delete),
    );
    NftBackend::new("sh", DivertParams::default()).with_prefix_args([
        "-c".to_string(),
        script,
        "nft".to_string(),
    ])
}

/// iptables stand-in: a shell script keeping its rules in a state file.
///
/// Every call appends its arguments to `dir/calls.log`. `-C` exits 0 when
/// the rule is in the state file and 1 otherwise, `-A` and `-D` edit the
/// file. `preamble` runs first and may sleep or exit early.
pub fn fake_iptables(dir: &Path, family: &'static str, preamble: &str) -> IptablesCommand {
    let script = format!(
        r#"echo "$*" >> '{dir}/calls.log'
{preamble}
table="$3"; op="$4"; shift 4; rule="$table $*"
touch '{dir}/rules'
case "$op" in
  -C) grep -qxF -- "$rule" '{dir}/rules' ;;
  -A) echo "$rule" >> '{dir}/rules' ;;
  -D) grep -vxF -- "$rule" '{dir}/rules' > '{dir}/rules.tmp'; mv '{dir}/rules.tmp' '{dir}/rules' ;;
esac"#,
        dir = dir.display(),
    );
    IptablesCommand::new("sh", family).with_prefix_args(["-c".to_string(), script, "iptables".to_string()])
}

/// Lines of `dir/calls.log` whose operation is `op`.
pub fn fake_iptables_calls(dir: &Path, op: &str) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .filter(|line| line.split(' ').nth(3) == Some(op))
        .map(str::to_string)
        .collect()
}

/// A verdict as issued to a [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedVerdict {
    pub packet_id: u32,
    pub verdict: KernelVerdict,
    pub payload: Option<Vec<u8>>,
    pub mark: Option<u32>,
}

impl RecordedVerdict {
    pub fn plain(packet_id: u32, verdict: KernelVerdict) -> Self {
        Self {
            packet_id,
            verdict,
            payload: None,
            mark: None,
        }
    }

    pub fn marked(packet_id: u32, verdict: KernelVerdict, mark: u32) -> Self {
        Self {
            mark: Some(mark),
            ..Self::plain(packet_id, verdict)
        }
    }

    pub fn modified(packet_id: u32, verdict: KernelVerdict, payload: Vec<u8>) -> Self {
        Self {
            payload: Some(payload),
            ..Self::plain(packet_id, verdict)
        }
    }
}

struct MockState {
    feed: mpsc::UnboundedSender<io::Result<Vec<RawEvent>>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Vec<RawEvent>>>>,
    verdicts: Mutex<Vec<RecordedVerdict>>,
    closed: AtomicBool,
}

/// In-memory queue transport.
///
/// Batches pushed with [`push`](Self::push) are returned by `recv` in order;
/// once drained, `recv` waits. Clones share state.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (feed, events) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(MockState {
                feed,
                events: tokio::sync::Mutex::new(events),
                verdicts: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn push(&self, events: Vec<RawEvent>) {
        self.state.feed.send(Ok(events)).unwrap();
    }

    pub fn push_error(&self, error: io::Error) {
        self.state.feed.send(Err(error)).unwrap();
    }

    pub fn verdicts(&self) -> Vec<RecordedVerdict> {
        self.state.verdicts.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Waits until at least `n` verdicts were issued.
    pub async fn wait_for_verdicts(&self, n: usize) -> Vec<RecordedVerdict> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let verdicts = self.verdicts();
                if verdicts.len() >= n {
                    return verdicts;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for verdicts")
    }

    fn record(&self, verdict: RecordedVerdict) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        self.state.verdicts.lock().unwrap().push(verdict);
        Ok(())
    }
}

impl QueueTransport for MockTransport {
    async fn recv(&self) -> io::Result<Vec<RawEvent>> {
        let mut events = self.state.events.lock().await;
        match events.recv().await {
            Some(batch) => batch,
            None => std::future::pending().await,
        }
    }

    fn set_verdict(&self, packet_id: u32, verdict: KernelVerdict) -> io::Result<()> {
        self.record(RecordedVerdict::plain(packet_id, verdict))
    }

    fn set_verdict_modified(
        &self,
        packet_id: u32,
        verdict: KernelVerdict,
        payload: &[u8],
    ) -> io::Result<()> {
        self.record(RecordedVerdict::modified(packet_id, verdict, payload.to_vec()))
    }

    fn set_verdict_with_conn_mark(
        &self,
        packet_id: u32,
        verdict: KernelVerdict,
        mark: u32,
    ) -> io::Result<()> {
        self.record(RecordedVerdict::marked(packet_id, verdict, mark))
    }

    fn close(&self) -> io::Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A raw event for a packet with the given payload length and, optionally,
/// a conntrack blob carrying `ct_id`.
pub fn raw_event(packet_id: u32, payload_len: usize, ct_id: Option<u32>) -> RawEvent {
    let conntrack = ct_id.map(|id| {
        let mut blob = Vec::new();
        crate::core::attr::put_attr(&mut blob, crate::core::attr::CTA_MARK, &0_u32.to_be_bytes());
        crate::core::attr::put_attr(&mut blob, crate::core::attr::CTA_ID, &id.to_be_bytes());
        blob
    });
    let mut payload = vec![0u8; payload_len];
    if let Some(first) = payload.first_mut() {
        *first = 0x45;
    }
    RawEvent {
        packet_id: Some(packet_id),
        payload: Some(payload),
        conntrack,
    }
}
