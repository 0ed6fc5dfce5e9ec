//! iptables rule generation
//!
//! The legacy backend has no atomic table load, so the divert policy is
//! expanded into an ordered list of individual rules. The same list is
//! applied to the IPv4 and IPv6 tables.

use crate::core::error::{Error, Result};
use crate::core::policy::{DivertParams, SessionPolicy};
use std::fmt;

/// Table every divert rule is appended to
pub const FILTER_TABLE: &str = "filter";

/// One rule: table, chain and the rule specification arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptRule {
    pub table: String,
    pub chain: String,
    pub spec: Vec<String>,
}

impl IptRule {
    fn new(chain: &str, spec: &[&str]) -> Self {
        Self {
            table: FILTER_TABLE.to_string(),
            chain: chain.to_string(),
            spec: spec.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl fmt::Display for IptRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} -A {} {}", self.table, self.chain, self.spec.join(" "))
    }
}

/// Generates the ordered divert rules for a policy.
///
/// Per chain: accept by accept mark, optional TCP reset by drop mark, drop
/// by drop mark, then `NFQUEUE` with bypass.
///
/// # Errors
///
/// Returns [`Error::PolicyConflict`] for local mode with TCP reset.
pub fn generate(policy: &SessionPolicy, params: &DivertParams) -> Result<Vec<IptRule>> {
    if policy.is_local() && policy.rst() {
        return Err(Error::PolicyConflict);
    }

    let chains: &[&str] = if policy.is_local() {
        &["INPUT", "OUTPUT"]
    } else {
        &["FORWARD"]
    };

    let accept_mark = params.accept_mark().to_string();
    let drop_mark = params.drop_mark().to_string();
    let queue_num = params.queue_num().to_string();

    let mut rules = Vec::with_capacity(4 * chains.len());
    for chain in chains {
        rules.push(IptRule::new(
            chain,
            &["-m", "connmark", "--mark", &accept_mark, "-j", "ACCEPT"],
        ));
        if policy.rst() {
            rules.push(IptRule::new(
                chain,
                &[
                    "-p",
                    "tcp",
                    "-m",
                    "connmark",
                    "--mark",
                    &drop_mark,
                    "-j",
                    "REJECT",
                    "--reject-with",
                    "tcp-reset",
                ],
            ));
        }
        rules.push(IptRule::new(
            chain,
            &["-m", "connmark", "--mark", &drop_mark, "-j", "DROP"],
        ));
        rules.push(IptRule::new(
            chain,
            &["-j", "NFQUEUE", "--queue-num", &queue_num, "--queue-bypass"],
        ));
    }

    Ok(rules)
}
