//! Decoding of reply frames against the command that produced them.
//!
//! Decoding is pure: it reads a [`Command`] and a [`Frame`] and returns a
//! typed reply or a [`DecodeError`]. Nothing is stored on failure.

use thiserror::Error;
use tracing::trace;

use crate::protocol::command::{Command, CommandKind};
use crate::protocol::frame::Frame;
use crate::protocol::pid::{Pid, PidTable, MODE_CURRENT_DATA_RESPONSE};
use crate::telemetry::TelemetryValue;
use crate::utils::parse_hex_pairs;

/// Line prefixes identifying an adapter banner.
pub const KNOWN_BANNERS: &[&str] = &["ELM327", "OBDLINK", "STN1", "STN2", "VLINK"];

/// Why a frame could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No `41` response header in the frame.
    #[error("no mode 01 response header in reply")]
    MalformedHeader,

    /// The reply is for a different PID than the one requested.
    #[error("reply is for PID `{actual}`, expected {expected}")]
    PidMismatch {
        /// The PID that was requested.
        expected: Pid,
        /// The two characters found where the PID should be.
        actual: String,
    },

    /// The reply carried fewer data bytes than the PID needs.
    #[error("PID {pid} needs {required} data bytes, reply carried {actual}")]
    InsufficientData {
        /// The PID being decoded.
        pid: Pid,
        /// Bytes the decode rule needs.
        required: usize,
        /// Bytes present.
        actual: usize,
    },

    /// The reply is well formed but no decode rule is registered.
    #[error("no decode rule registered for PID {pid}")]
    UnsupportedPid {
        /// The PID with no rule.
        pid: Pid,
    },

    /// The PID's decode function panicked on the reply data.
    #[error("decode rule for PID {pid} failed on the reply data")]
    RuleFailed {
        /// The PID whose rule failed.
        pid: Pid,
    },

    /// An AT command got neither `OK` nor a banner.
    #[error("unexpected reply to `{command}`: {reply:?}")]
    UnexpectedReply {
        /// The command text.
        command: String,
        /// The reply with echo removed.
        reply: String,
    },
}

/// A successfully decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedReply {
    /// An AT command was accepted.
    Acknowledged {
        /// The adapter banner, if the reply carried one.
        banner: Option<String>,
    },
    /// A PID query produced a value.
    Telemetry(TelemetryValue),
}

impl DecodedReply {
    /// The telemetry value, if this is a PID reply.
    pub fn telemetry(&self) -> Option<&TelemetryValue> {
        match self {
            Self::Telemetry(value) => Some(value),
            Self::Acknowledged { .. } => None,
        }
    }

    /// The banner, if this acknowledgement carried one.
    pub fn banner(&self) -> Option<&str> {
        match self {
            Self::Acknowledged { banner } => banner.as_deref(),
            Self::Telemetry(_) => None,
        }
    }
}

/// Uppercase with all whitespace removed.
fn compact(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Decodes frames using a [`PidTable`].
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    table: PidTable,
}

impl Decoder {
    /// Create a decoder with the given table.
    pub fn new(table: PidTable) -> Self {
        Self { table }
    }

    /// The table used for PID replies.
    pub fn table(&self) -> &PidTable {
        &self.table
    }

    /// Decode `frame` as the reply to `command`.
    pub fn decode(&self, command: &Command, frame: &Frame) -> Result<DecodedReply, DecodeError> {
        let lines = strip_echo(command.text(), frame);
        trace!("Decoding {} against {:?}", command, lines);

        match command.kind() {
            CommandKind::At => decode_at(command.text(), &lines),
            CommandKind::Pid(pid) => self.decode_pid(pid, &lines, frame),
        }
    }

    fn decode_pid(
        &self,
        expected: Pid,
        lines: &[String],
        frame: &Frame,
    ) -> Result<DecodedReply, DecodeError> {
        let header = format!("{:02X}", MODE_CURRENT_DATA_RESPONSE);

        let payload = lines
            .iter()
            .map(|line| compact(line))
            .find_map(|line| line.find(&header).map(|idx| line[idx + header.len()..].to_string()))
            .ok_or(DecodeError::MalformedHeader)?;

        let pid_hex = payload.get(..2).unwrap_or(&payload);
        if pid_hex != expected.to_string() {
            return Err(DecodeError::PidMismatch {
                expected,
                actual: pid_hex.to_string(),
            });
        }

        let rule = self
            .table
            .get(expected)
            .ok_or(DecodeError::UnsupportedPid { pid: expected })?;

        let data = parse_hex_pairs(&payload[2..]);
        if data.len() < rule.required_bytes {
            return Err(DecodeError::InsufficientData {
                pid: expected,
                required: rule.required_bytes,
                actual: data.len(),
            });
        }

        // Rules can be registered by callers; one that panics must not take
        // down the frame reader.
        let bytes = &data[..rule.required_bytes];
        let value = std::panic::catch_unwind(|| (rule.decode)(bytes))
            .map_err(|_| DecodeError::RuleFailed { pid: expected })?;
        Ok(DecodedReply::Telemetry(TelemetryValue::new(
            expected,
            value,
            rule.unit,
            frame.completed_at(),
        )))
    }
}

/// Frame lines with the adapter's echo of `command` removed.
///
/// A line equal to the command (ignoring case and spacing) is dropped; a
/// line starting with it keeps only the compacted remainder.
fn strip_echo(command: &str, frame: &Frame) -> Vec<String> {
    let echo = compact(command);

    frame
        .lines()
        .filter_map(|line| match compact(line).strip_prefix(echo.as_str()) {
            Some("") => None,
            Some(rest) => Some(rest.to_string()),
            None => Some(line.to_string()),
        })
        .collect()
}

fn decode_at(command: &str, lines: &[String]) -> Result<DecodedReply, DecodeError> {
    let banner = lines
        .iter()
        .find(|line| {
            let upper = line.to_ascii_uppercase();
            KNOWN_BANNERS.iter().any(|b| upper.starts_with(b))
        })
        .cloned();

    let acknowledged = lines.iter().any(|line| compact(line).contains("OK"));

    if banner.is_some() || acknowledged {
        return Ok(DecodedReply::Acknowledged { banner });
    }

    Err(DecodeError::UnexpectedReply {
        command: command.to_string(),
        reply: lines.join(" "),
    })
}
