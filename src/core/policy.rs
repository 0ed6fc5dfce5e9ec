//! Session policy and divert constants
//!
//! The queue number and the two connection marks are shared between the
//! generated firewall rules and the verdicts the session issues. Both read
//! them from the same [`DivertParams`] value, so a rule set can never be
//! installed with marks the session does not write.

use crate::core::error::{Error, Result};

/// NFQUEUE number packets are diverted to
pub const DEFAULT_QUEUE_NUM: u16 = 100;

/// Connection mark meaning "accept the rest of this connection"
pub const DEFAULT_ACCEPT_MARK: u32 = 1001;

/// Connection mark meaning "drop the rest of this connection"
pub const DEFAULT_DROP_MARK: u32 = 1002;

/// nftables family of the generated table (dual-stack)
pub const NFT_FAMILY: &str = "inet";

/// Default name of the nftables table owned by the session
pub const DEFAULT_TABLE_NAME: &str = "opengfw";

/// Largest packet the kernel copies into user space
pub const MAX_PACKET_LEN: u32 = 0xFFFF;

/// Kernel-side queue length used when the configuration leaves it at 0
pub const DEFAULT_QUEUE_SIZE: u32 = 128;

/// What traffic is diverted and how dropped connections are terminated.
///
/// Immutable for the lifetime of a session. Local mode combined with TCP
/// reset is rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionPolicy {
    local: bool,
    rst: bool,
}

impl SessionPolicy {
    /// Creates a policy, rejecting local mode with TCP reset.
    pub fn new(local: bool, rst: bool) -> Result<Self> {
        if local && rst {
            return Err(Error::PolicyConflict);
        }
        Ok(Self { local, rst })
    }

    /// Forwarded (routed) traffic, silent drops
    pub const fn forward() -> Self {
        Self {
            local: false,
            rst: false,
        }
    }

    /// Locally originated/destined traffic
    pub const fn local() -> Self {
        Self {
            local: true,
            rst: false,
        }
    }

    /// Builds a policy without validation, for exercising downstream checks.
    #[cfg(test)]
    pub(crate) const fn unchecked(local: bool, rst: bool) -> Self {
        Self { local, rst }
    }

    pub const fn is_local(self) -> bool {
        self.local
    }

    pub const fn rst(self) -> bool {
        self.rst
    }
}

/// Queue number, connection marks and table name shared by rules and verdicts.
///
/// Only constructed through [`DivertParams::new`] or [`Default`], so the
/// marks are always distinct and non-zero and the table name is safe to
/// splice into an nft script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivertParams {
    queue_num: u16,
    accept_mark: u32,
    drop_mark: u32,
    table_name: String,
}

impl Default for DivertParams {
    fn default() -> Self {
        Self {
            queue_num: DEFAULT_QUEUE_NUM,
            accept_mark: DEFAULT_ACCEPT_MARK,
            drop_mark: DEFAULT_DROP_MARK,
            table_name: DEFAULT_TABLE_NAME.to_string(),
        }
    }
}

impl DivertParams {
    /// Creates a validated parameter set.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when a mark is 0, both marks are equal, or the table
    /// name is not a plain nftables identifier.
    pub fn new(
        queue_num: u16,
        accept_mark: u32,
        drop_mark: u32,
        table_name: impl Into<String>,
    ) -> Result<Self> {
        let table_name = table_name.into();
        validate_table_name(&table_name)?;
        if accept_mark == 0 || drop_mark == 0 {
            return Err(Error::Config {
                field: "mark".to_string(),
                message: "connection marks must be non-zero".to_string(),
            });
        }
        if accept_mark == drop_mark {
            return Err(Error::Config {
                field: "mark".to_string(),
                message: format!("accept and drop marks are both {accept_mark}"),
            });
        }
        Ok(Self {
            queue_num,
            accept_mark,
            drop_mark,
            table_name,
        })
    }

    /// Same parameters under another table name.
    pub fn with_table_name(self, name: impl Into<String>) -> Result<Self> {
        Self::new(self.queue_num, self.accept_mark, self.drop_mark, name)
    }

    pub const fn queue_num(&self) -> u16 {
        self.queue_num
    }

    pub const fn accept_mark(&self) -> u32 {
        self.accept_mark
    }

    pub const fn drop_mark(&self) -> u32 {
        self.drop_mark
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

/// Rejects table names nft would misparse: empty, or anything beyond ASCII
/// letters, digits, `_` and `-`.
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::Config {
            field: "table_name".to_string(),
            message: format!(
                "'{name}' is not a valid nftables table name (letters, digits, '_' and '-')"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_with_rst_is_rejected() {
        assert!(matches!(
            SessionPolicy::new(true, true),
            Err(Error::PolicyConflict)
        ));
    }

    #[test]
    fn test_valid_policies() {
        for (local, rst) in [(false, false), (false, true), (true, false)] {
            let policy = SessionPolicy::new(local, rst).unwrap();
            assert_eq!(policy.is_local(), local);
            assert_eq!(policy.rst(), rst);
        }
    }

    #[test]
    fn test_marks_do_not_collide() {
        let params = DivertParams::default();
        assert_ne!(params.accept_mark(), params.drop_mark());
        assert_ne!(params.accept_mark(), 0);
        assert_ne!(params.drop_mark(), 0);
    }

    #[test]
    fn test_equal_marks_rejected() {
        let result = DivertParams::new(100, 7, 7, "opengfw");
        assert!(matches!(result, Err(Error::Config { field, .. }) if field == "mark"));
    }

    #[test]
    fn test_zero_mark_rejected() {
        assert!(DivertParams::new(100, 0, 1002, "opengfw").is_err());
        assert!(DivertParams::new(100, 1001, 0, "opengfw").is_err());
    }

    #[test]
    fn test_unsafe_table_names_rejected() {
        for name in ["", "a b", "x}; flush ruleset; table inet y {", "t\n"] {
            let result = DivertParams::default().with_table_name(name);
            assert!(
                matches!(result, Err(Error::Config { ref field, .. }) if field == "table_name"),
                "accepted {name:?}"
            );
        }
    }

    #[test]
    fn test_valid_params_keep_values() {
        let params = DivertParams::new(7, 42, 43, "nfq-test_1").unwrap();
        assert_eq!(params.queue_num(), 7);
        assert_eq!(params.accept_mark(), 42);
        assert_eq!(params.drop_mark(), 43);
        assert_eq!(params.table_name(), "nfq-test_1");
    }
}
