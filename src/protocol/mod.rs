//! Protocol module for the adapter's line-oriented ASCII grammar.
//!
//! This module contains the implementations for:
//! - Frame reassembly from notification chunks
//! - Outbound command construction
//! - Reply decoding against the PID table

pub mod command;
pub mod decoder;
pub mod frame;
pub mod pid;

pub use command::{Command, CommandId, CommandKind, CommandRequest};
pub use decoder::{DecodeError, DecodedReply, Decoder};
pub use frame::{Frame, FrameAssembler, FrameEvent};
pub use pid::{Pid, PidRule, PidTable, Unit};
