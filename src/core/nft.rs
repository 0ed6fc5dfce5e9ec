//! nftables rule generation
//!
//! Builds the `inet` table that diverts traffic into the queue. The table is
//! loaded atomically with `nft -f -` and removed with `nft delete table`, so
//! everything the session installs lives inside this one table.
//!
//! # Example
//!
//! ```
//! use nfqio::core::nft::generate;
//! use nfqio::core::policy::{DivertParams, SessionPolicy};
//!
//! let table = generate(&SessionPolicy::forward(), &DivertParams::default()).unwrap();
//! let text = table.to_string();
//! assert!(text.contains("chain FORWARD {"));
//! assert!(text.contains("counter queue num $QUEUE_NUM bypass"));
//! ```

use crate::core::error::{Error, Result};
use crate::core::policy::{DivertParams, NFT_FAMILY, SessionPolicy};
use std::fmt;

/// A complete nftables table with its `define` preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftTable {
    pub defines: Vec<String>,
    pub family: String,
    pub name: String,
    pub chains: Vec<NftChain>,
}

/// A base chain attached to one netfilter hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftChain {
    pub name: String,
    pub header: String,
    pub rules: Vec<String>,
}

/// Generates the divert table for a policy.
///
/// Local mode hooks `input` and `output`; forward mode hooks `forward` only.
/// Each chain gets the same body: accept by accept mark, optional TCP reset
/// by drop mark, drop by drop mark, then queue with bypass.
///
/// # Errors
///
/// Returns [`Error::PolicyConflict`] for local mode with TCP reset.
pub fn generate(policy: &SessionPolicy, params: &DivertParams) -> Result<NftTable> {
    if policy.is_local() && policy.rst() {
        return Err(Error::PolicyConflict);
    }

    let defines = vec![
        format!("define ACCEPT_CTMARK={}", params.accept_mark()),
        format!("define DROP_CTMARK={}", params.drop_mark()),
        format!("define QUEUE_NUM={}", params.queue_num()),
    ];

    let hooks: &[(&str, &str)] = if policy.is_local() {
        &[("INPUT", "input"), ("OUTPUT", "output")]
    } else {
        &[("FORWARD", "forward")]
    };

    let chains = hooks
        .iter()
        .map(|(name, hook)| NftChain {
            name: (*name).to_string(),
            header: format!("type filter hook {hook} priority filter; policy accept;"),
            rules: chain_body(policy.rst()),
        })
        .collect();

    Ok(NftTable {
        defines,
        family: NFT_FAMILY.to_string(),
        name: params.table_name().to_string(),
        chains,
    })
}

fn chain_body(rst: bool) -> Vec<String> {
    let mut rules = Vec::with_capacity(4);
    rules.push("ct mark $ACCEPT_CTMARK counter accept".to_string());
    if rst {
        rules.push("ip protocol tcp ct mark $DROP_CTMARK counter reject with tcp reset".to_string());
    }
    rules.push("ct mark $DROP_CTMARK counter drop".to_string());
    rules.push("counter queue num $QUEUE_NUM bypass".to_string());
    rules
}

impl fmt::Display for NftTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", self.defines.join("\n"))?;
        writeln!(f)?;
        writeln!(f, "table {} {} {{", self.family, self.name)?;
        for chain in &self.chains {
            write!(f, "{chain}")?;
        }
        writeln!(f)?;
        writeln!(f, "}}")
    }
}

impl fmt::Display for NftChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "  chain {} {{", self.name)?;
        writeln!(f, "    {}", self.header)?;
        writeln!(f, "    {}", self.rules.join("\n    "))?;
        writeln!(f, "  }}")
    }
}
