//! Protocol constants and configuration defaults

/// Default Asterisk Manager Interface port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Default FastAGI port
pub const DEFAULT_AGI_PORT: u16 = 4573;

/// Socket read size for the reader loop (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Line terminator written on the wire. Inbound `\r` is tolerated and stripped.
pub const LINE_TERMINATOR: &str = "\n";

/// Separator between the internal and the caller-supplied part of an `ActionID`.
///
/// Chosen so it never appears in ids the connection generates.
pub const INTERNAL_ACTION_ID_DELIMITER: char = '#';

/// Banner prefixes accepted as a manager protocol identifier.
pub const BANNER_PREFIXES: &[&str] = &[
    "Asterisk Call Manager",
    "Asterisk Call Manager Proxy",
    "OpenPBX Call Manager",
    "CallWeaver Call Manager",
];

/// Terminates a `Response: Follows` command block.
pub const END_COMMAND_SENTINEL: &str = "--end command--";

/// Trailing text that opens a command block on newer servers.
pub const COMMAND_OUTPUT_FOLLOWS: &str = "command output follows";

/// Header fields that may interleave with raw command output.
pub const BLOCK_HEADER_FIELDS: &[&str] = &["privilege", "actionid", "timestamp", "server"];

/// Separator used when a packet repeats a key.
pub const DUPLICATE_FIELD_SEPARATOR: &str = "\n";

/// TCP connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Overall login budget (banner + challenge + login) in milliseconds
pub const DEFAULT_LOGIN_TIMEOUT_MS: u64 = 5000;

/// Default response timeout for blocking sends in milliseconds
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2000;

/// Keepalive ping interval in milliseconds
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 20_000;

/// Reader idle poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Fast reconnect interval, used right after a disconnect (server likely restarting)
pub const DEFAULT_FAST_RECONNECT_INTERVAL_MS: u64 = 50;

/// Number of attempts made at the fast interval
pub const DEFAULT_FAST_RECONNECT_ATTEMPTS: usize = 10;

/// Slow reconnect interval once the fast attempts are used up
pub const DEFAULT_SLOW_RECONNECT_INTERVAL_MS: u64 = 5000;

/// Maximum number of reconnect attempts before giving up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: usize = 1000;

/// Maximum number of queued unhandled events before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;

/// AGI status codes
pub const AGI_SC_TRYING: u16 = 100;
pub const AGI_SC_SUCCESS: u16 = 200;
pub const AGI_SC_INVALID_OR_UNKNOWN_COMMAND: u16 = 510;
pub const AGI_SC_DEAD_CHANNEL: u16 = 511;
pub const AGI_SC_INVALID_COMMAND_SYNTAX: u16 = 520;

/// Literal line Asterisk sends when the AGI channel hangs up
pub const AGI_HANGUP: &str = "HANGUP";
