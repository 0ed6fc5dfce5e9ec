//! Divert rule installation and removal
//!
//! Two mutually exclusive backends apply the generated rules:
//!
//! - [`NftBackend`]: deletes the session table (ignoring failures) and loads
//!   the freshly generated table in one `nft -f -` transaction. Removal
//!   deletes the table by name.
//! - [`LegacyBackend`]: appends each rule to every [`RuleTable`] (IPv4 and
//!   IPv6) unless an identical rule is present, and deletes each rule only
//!   if present. Rules are applied rule-major (each rule to every family
//!   before the next rule). The first failure stops the batch; rules applied
//!   before it are left in place and the error names the rule and family.
//!
//! The backend is chosen once per session by [`RuleBackend::probe`]: nftables
//! when `nft` is available, iptables otherwise.

use crate::core::error::{Error, Result};
use crate::core::exec::{
    IP6TABLES_COMMAND_ENV, IPTABLES_COMMAND_ENV, NFT_COMMAND_ENV, nft_command, resolve_program,
    xtables_command,
};
use crate::core::ipt::{self, IptRule};
use crate::core::nft;
use crate::core::policy::{DivertParams, NFT_FAMILY, SessionPolicy};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use tracing::{debug, error, info};

/// Which firewall backend a session drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum BackendKind {
    #[strum(serialize = "nftables")]
    Nftables,
    #[strum(serialize = "iptables")]
    Iptables,
}

/// Backend selected once at session construction.
pub enum RuleBackend {
    Nftables(NftBackend),
    Legacy(LegacyBackend),
}

impl RuleBackend {
    /// Selects nftables when `nft` is available, otherwise iptables for both
    /// address families.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Setup`] when neither backend's tools are found.
    pub fn probe(params: DivertParams) -> Result<Self> {
        if let Some(program) = resolve_program("nft", NFT_COMMAND_ENV) {
            info!("Using nftables backend ({program})");
            return Ok(Self::Nftables(NftBackend::new(program, params)));
        }

        let v4 = resolve_program("iptables", IPTABLES_COMMAND_ENV);
        let v6 = resolve_program("ip6tables", IP6TABLES_COMMAND_ENV);
        match (v4, v6) {
            (Some(v4), Some(v6)) => {
                info!("nft not found, using iptables backend ({v4}, {v6})");
                Ok(Self::Legacy(LegacyBackend::new(
                    vec![
                        Box::new(IptablesCommand::new(v4, "ipv4")),
                        Box::new(IptablesCommand::new(v6, "ipv6")),
                    ],
                    params,
                )))
            }
            (None, _) => Err(Error::Setup(
                "neither nft nor iptables was found in PATH".to_string(),
            )),
            (Some(_), None) => Err(Error::Setup(
                "nft not found and ip6tables missing for the iptables backend".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Nftables(_) => BackendKind::Nftables,
            Self::Legacy(_) => BackendKind::Iptables,
        }
    }

    pub fn params(&self) -> &DivertParams {
        match self {
            Self::Nftables(b) => &b.params,
            Self::Legacy(b) => &b.params,
        }
    }

    /// Installs the divert rules for `policy`, replacing any stale copy.
    pub async fn install(&self, policy: &SessionPolicy) -> Result<()> {
        match self {
            Self::Nftables(b) => b.install(policy).await,
            Self::Legacy(b) => b.install(policy).await,
        }
    }

    /// Removes the divert rules for `policy`.
    pub async fn remove(&self, policy: &SessionPolicy) -> Result<()> {
        match self {
            Self::Nftables(b) => b.remove(policy).await,
            Self::Legacy(b) => b.remove(policy).await,
        }
    }
}

/// Loads and deletes the session table through `nft`.
pub struct NftBackend {
    program: String,
    prefix_args: Vec<String>,
    params: DivertParams,
}

impl NftBackend {
    pub fn new(program: impl Into<String>, params: DivertParams) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            params,
        }
    }

    /// Arguments placed before every nft argument list, for wrapper
    /// programs such as `sh -c '...' nft`.
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub async fn install(&self, policy: &SessionPolicy) -> Result<()> {
        let table = nft::generate(policy, &self.params)?;

        // Leftovers from a previous run would otherwise make the load fail
        if let Err(e) = self.delete_table().await {
            debug!("No stale table removed before load: {e}");
        }

        info!(
            "Loading nftables table {} {} ({} chains)",
            NFT_FAMILY,
            self.params.table_name(),
            table.chains.len()
        );
        self.run(&["-f", "-"], Some(&table.to_string())).await
    }

    pub async fn remove(&self, policy: &SessionPolicy) -> Result<()> {
        nft::generate(policy, &self.params)?;
        info!(
            "Deleting nftables table {} {}",
            NFT_FAMILY, self.params.table_name()
        );
        self.delete_table().await
    }

    async fn delete_table(&self) -> Result<()> {
        self.run(&["delete", "table", NFT_FAMILY, self.params.table_name()], None)
            .await
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<()> {
        let mut full_args: Vec<&str> = self.prefix_args.iter().map(String::as_str).collect();
        full_args.extend_from_slice(args);

        let mut child = nft_command(&self.program, &full_args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.program);
                Error::Setup(format!("failed to spawn {}: {e}", self.program))
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            use tokio::io::AsyncWriteExt;
            pipe.write_all(input.as_bytes()).await?;
            // Closing stdin lets nft see EOF on `-f -`
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            let (message, stderr) = failure_text(&output, &args.join(" "));
            error!("nft {} failed: {message}", args.join(" "));
            Err(Error::Nftables {
                message,
                stderr,
                exit_code: output.status.code(),
            })
        }
    }
}

/// A legacy rule table for one address family.
///
/// Implemented over the `iptables`/`ip6tables` binaries by
/// [`IptablesCommand`]; tests use an in-memory table.
#[async_trait]
pub trait RuleTable: Send + Sync {
    /// Address family label used in logs and errors
    fn family(&self) -> &str;

    async fn exists(&self, rule: &IptRule) -> Result<bool>;

    async fn append(&self, rule: &IptRule) -> Result<()>;

    async fn delete(&self, rule: &IptRule) -> Result<()>;

    /// Appends `rule` unless an identical rule is already present.
    async fn append_unique(&self, rule: &IptRule) -> Result<()> {
        if self.exists(rule).await? {
            debug!("{}: rule already present: {rule}", self.family());
            return Ok(());
        }
        self.append(rule).await
    }

    /// Deletes `rule` if present.
    async fn delete_if_exists(&self, rule: &IptRule) -> Result<()> {
        if self.exists(rule).await? {
            self.delete(rule).await
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<T: RuleTable + ?Sized> RuleTable for std::sync::Arc<T> {
    fn family(&self) -> &str {
        (**self).family()
    }

    async fn exists(&self, rule: &IptRule) -> Result<bool> {
        (**self).exists(rule).await
    }

    async fn append(&self, rule: &IptRule) -> Result<()> {
        (**self).append(rule).await
    }

    async fn delete(&self, rule: &IptRule) -> Result<()> {
        (**self).delete(rule).await
    }
}

/// Applies the ordered divert rules to every registered family.
pub struct LegacyBackend {
    tables: Vec<Box<dyn RuleTable>>,
    params: DivertParams,
}

impl LegacyBackend {
    pub fn new(tables: Vec<Box<dyn RuleTable>>, params: DivertParams) -> Self {
        Self { tables, params }
    }

    pub async fn install(&self, policy: &SessionPolicy) -> Result<()> {
        let rules = ipt::generate(policy, &self.params)?;
        info!(
            "Appending {} iptables rules to {} families",
            rules.len(),
            self.tables.len()
        );
        for rule in &rules {
            for table in &self.tables {
                table.append_unique(rule).await.inspect_err(|e| {
                    error!("{}: failed to append {rule}: {e}", table.family());
                })?;
            }
        }
        Ok(())
    }

    pub async fn remove(&self, policy: &SessionPolicy) -> Result<()> {
        let rules = ipt::generate(policy, &self.params)?;
        info!("Deleting {} iptables rules", rules.len());
        for rule in &rules {
            for table in &self.tables {
                table.delete_if_exists(rule).await.inspect_err(|e| {
                    error!("{}: failed to delete {rule}: {e}", table.family());
                })?;
            }
        }
        Ok(())
    }
}

/// [`RuleTable`] backed by an `iptables`-compatible binary.
///
/// Every check, append and delete is its own child process, awaited on the
/// runtime rather than blocking a worker thread.
pub struct IptablesCommand {
    program: String,
    prefix_args: Vec<String>,
    family: &'static str,
}

impl IptablesCommand {
    pub fn new(program: impl Into<String>, family: &'static str) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            family,
        }
    }

    /// Arguments placed before every iptables argument list, for wrapper
    /// programs such as `sh -c '...' iptables`.
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn args(op: &str, rule: &IptRule) -> Vec<String> {
        // -w waits for the xtables lock instead of failing immediately
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            rule.table.clone(),
            op.to_string(),
            rule.chain.clone(),
        ];
        args.extend(rule.spec.iter().cloned());
        args
    }

    async fn output(&self, op: &str, rule: &IptRule) -> Result<Output> {
        let mut args = self.prefix_args.clone();
        args.extend(Self::args(op, rule));
        xtables_command(&self.program, &args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.program);
                Error::Setup(format!("failed to spawn {}: {e}", self.program))
            })
    }

    async fn run(&self, op: &str, rule: &IptRule) -> Result<()> {
        let output = self.output(op, rule).await?;
        if output.status.success() {
            Ok(())
        } else {
            let (message, stderr) = failure_text(&output, &format!("{} {op} {rule}", self.program));
            Err(Error::Iptables {
                message,
                stderr,
                exit_code: output.status.code(),
            })
        }
    }
}

#[async_trait]
impl RuleTable for IptablesCommand {
    fn family(&self) -> &str {
        self.family
    }

    async fn exists(&self, rule: &IptRule) -> Result<bool> {
        let output = self.output("-C", rule).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            // Exit status 1 is "no matching rule"; anything else is a failure
            Some(1) => Ok(false),
            code => {
                let (message, stderr) =
                    failure_text(&output, &format!("{} -C {rule}", self.program));
                Err(Error::Iptables {
                    message,
                    stderr,
                    exit_code: code,
                })
            }
        }
    }

    async fn append(&self, rule: &IptRule) -> Result<()> {
        self.run("-A", rule).await
    }

    async fn delete(&self, rule: &IptRule) -> Result<()> {
        self.run("-D", rule).await
    }
}

/// Builds the message/stderr pair for a failed tool invocation.
fn failure_text(output: &Output, what: &str) -> (String, Option<String>) {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        (format!("{what}: exited with {}", output.status), None)
    } else {
        (stderr.clone(), Some(stderr))
    }
}
