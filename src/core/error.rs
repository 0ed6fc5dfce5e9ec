use thiserror::Error;

/// Core error types for nfqio
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Kernel queue could not be opened or configured, or no backend is usable
    #[error("setup error: {0}")]
    Setup(String),

    /// Non-transient error reported by the queue transport
    #[error("queue transport error: {0}")]
    Transport(std::io::Error),

    /// Packet was not produced by this session's queue
    #[error("invalid packet: not produced by this queue session")]
    InvalidPacket,

    /// Local mode cannot reset TCP connections
    #[error("tcp reset is not supported in local mode")]
    PolicyConflict,

    /// `register` was called while a dispatcher is still running
    #[error("queue session is already registered")]
    AlreadyRegistered,

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// iptables/ip6tables command execution failed
    #[error("iptables error: {message}")]
    Iptables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Configuration value rejected
    #[error("configuration error in {field}: {message}")]
    Config { field: String, message: String },
}

impl Error {
    /// Returns an operator hint for known nft/iptables failure patterns.
    pub fn hint(&self) -> Option<&'static str> {
        let stderr: &str = match self {
            Error::Nftables { message, stderr, .. } | Error::Iptables { message, stderr, .. } => {
                stderr.as_deref().unwrap_or(message)
            }
            Error::Setup(message) => message.as_str(),
            _ => return None,
        };
        hint_for(stderr)
    }
}

fn hint_for(msg: &str) -> Option<&'static str> {
    let lower = msg.to_lowercase();

    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        return Some("run as root or grant CAP_NET_ADMIN");
    }
    if lower.contains("could not process rule") && lower.contains("no such file") {
        return Some("load the nf_tables and nfnetlink_queue kernel modules");
    }
    if lower.contains("xtables lock") {
        return Some("another process holds the xtables lock, retry once it is released");
    }
    if lower.contains("no such file") || lower.contains("command not found") {
        return Some("install nftables, or iptables for the legacy backend");
    }
    if lower.contains("queue") && lower.contains("not supported") {
        return Some("load the nfnetlink_queue kernel module: modprobe nfnetlink_queue");
    }
    if lower.contains("netlink") {
        return Some("check that nfnetlink is available: lsmod | grep nfnetlink");
    }
    None
}

pub type Result<T> = std::result::Result<T, Error>;
