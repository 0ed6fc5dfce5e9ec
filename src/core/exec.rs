//! External firewall tool invocation
//!
//! The session drives `nft`, `iptables` and `ip6tables` as child processes.
//! Only these three programs are ever spawned, and arguments are passed
//! directly without shell interpolation.
//!
//! # Environment Variables
//!
//! - `NFQIO_NFT_COMMAND`: program used in place of `nft`.
//! - `NFQIO_IPTABLES_COMMAND` / `NFQIO_IP6TABLES_COMMAND`: programs used in
//!   place of `iptables` / `ip6tables`.
//!
//! The overrides exist for hosts with non-standard install paths
//! (`/usr/sbin/nft` outside `PATH`) and for tests.

use std::path::PathBuf;
use tokio::process::Command;

/// Environment override for the nft binary
pub const NFT_COMMAND_ENV: &str = "NFQIO_NFT_COMMAND";

/// Environment override for the iptables binary
pub const IPTABLES_COMMAND_ENV: &str = "NFQIO_IPTABLES_COMMAND";

/// Environment override for the ip6tables binary
pub const IP6TABLES_COMMAND_ENV: &str = "NFQIO_IP6TABLES_COMMAND";

/// Searches `PATH` for a binary and returns its full path.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full_path = dir.join(name);
            if full_path.is_file() {
                Some(full_path)
            } else {
                None
            }
        })
    })
}

/// Checks if a binary exists in `PATH`
pub fn binary_exists(name: &str) -> bool {
    find_binary(name).is_some()
}

/// Resolves the program for a tool, honouring its environment override.
///
/// Returns `None` when neither the override nor the default binary is found.
pub fn resolve_program(default: &str, env_override: &str) -> Option<String> {
    if let Ok(program) = std::env::var(env_override)
        && !program.is_empty()
    {
        return Some(program);
    }
    binary_exists(default).then(|| default.to_string())
}

/// Creates a `nft` command for the given program and arguments.
pub fn nft_command(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Creates an `iptables`/`ip6tables` command for the given program and arguments.
pub fn xtables_command(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}
