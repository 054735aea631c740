//! Outbound commands.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::pid::Pid;

/// Line terminator appended to every command.
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Default deadline for AT commands.
pub const DEFAULT_AT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default deadline for PID queries. Covers the adapter's protocol search on
/// the first query after `ATSP0`.
pub const DEFAULT_PID_TIMEOUT: Duration = Duration::from_secs(2);

/// Opaque sequence number of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub(crate) u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What reply grammar a command expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Adapter control command answered with `OK` or a banner.
    At,
    /// Service 01 query answered with `41 <pid> <data>`.
    Pid(Pid),
}

/// A command the caller wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    text: String,
    kind: CommandKind,
    timeout: Duration,
}

impl CommandRequest {
    /// Create a request with explicit text, kind and deadline.
    pub fn new(text: impl Into<String>, kind: CommandKind, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            kind,
            timeout,
        }
    }

    /// An AT command with [`DEFAULT_AT_TIMEOUT`].
    pub fn at(text: impl Into<String>) -> Self {
        Self::new(text, CommandKind::At, DEFAULT_AT_TIMEOUT)
    }

    /// A service 01 query for `pid` with [`DEFAULT_PID_TIMEOUT`].
    pub fn pid(pid: Pid) -> Self {
        Self::new(pid.request_text(), CommandKind::Pid(pid), DEFAULT_PID_TIMEOUT)
    }

    /// Replace the deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command text without terminator.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Expected reply grammar.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Deadline for the reply.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check the text is a single printable ASCII line and the deadline is
    /// non-zero.
    pub fn validate(&self) -> Result<()> {
        let printable = self
            .text
            .bytes()
            .all(|b| b.is_ascii_graphic() || b == b' ');

        if self.text.trim().is_empty() || !printable {
            return Err(Error::InvalidParameter {
                name: "text".to_string(),
                value: format!("{:?}", self.text),
            });
        }

        if self.timeout.is_zero() {
            return Err(Error::InvalidParameter {
                name: "timeout".to_string(),
                value: format!("{:?}", self.timeout),
            });
        }

        Ok(())
    }
}

/// A command that has been handed to the correlator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    id: CommandId,
    text: String,
    kind: CommandKind,
    submitted_at: Instant,
    timeout: Duration,
}

impl Command {
    pub(crate) fn new(id: CommandId, request: CommandRequest, submitted_at: Instant) -> Self {
        Self {
            id,
            text: request.text,
            kind: request.kind,
            submitted_at,
            timeout: request.timeout,
        }
    }

    /// Sequence number.
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Command text without terminator.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Expected reply grammar.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// When the command was submitted.
    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Deadline for the reply.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Point in time after which the command is considered lost.
    pub fn deadline(&self) -> Instant {
        self.submitted_at + self.timeout
    }

    /// Bytes put on the wire: the text followed by `\r`.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.text.len() + 1);
        bytes.extend_from_slice(self.text.as_bytes());
        bytes.push(COMMAND_TERMINATOR);
        bytes
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} `{}`", self.id, self.text)
    }
}
