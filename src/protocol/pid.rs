//! Mode 01 parameter IDs and the table of decode rules.
//!
//! The [`PidTable`] is the single place telemetry is added: each entry maps
//! a PID to the number of data bytes its reply must carry and a function
//! that turns those bytes into a value.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// OBD-II service 01 ("show current data") request prefix.
pub const MODE_CURRENT_DATA: u8 = 0x01;

/// Positive response byte for service 01 (`0x01 + 0x40`).
pub const MODE_CURRENT_DATA_RESPONSE: u8 = 0x41;

/// A one-byte service 01 parameter identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Pid(u8);

impl Pid {
    /// Calculated engine load (0x04).
    pub const ENGINE_LOAD: Pid = Pid(0x04);
    /// Engine coolant temperature (0x05).
    pub const COOLANT_TEMPERATURE: Pid = Pid(0x05);
    /// Intake manifold absolute pressure (0x0B).
    pub const INTAKE_MANIFOLD_PRESSURE: Pid = Pid(0x0B);
    /// Engine speed (0x0C).
    pub const RPM: Pid = Pid(0x0C);
    /// Vehicle speed (0x0D).
    pub const SPEED: Pid = Pid(0x0D);
    /// Throttle position (0x11).
    pub const THROTTLE_POSITION: Pid = Pid(0x11);

    /// Create a PID from its raw byte.
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Get the raw byte.
    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// The ASCII request line for this PID, e.g. `010C`.
    pub fn request_text(&self) -> String {
        format!("{:02X}{:02X}", MODE_CURRENT_DATA, self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

impl From<u8> for Pid {
    fn from(raw: u8) -> Self {
        Self(raw)
    }
}

/// Unit of a decoded telemetry value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Unit {
    /// Revolutions per minute.
    Rpm,
    /// Kilometres per hour.
    KilometersPerHour,
    /// Degrees Celsius.
    Celsius,
    /// Percent.
    Percent,
    /// Kilopascals.
    Kilopascal,
}

impl Unit {
    /// Short display symbol.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Rpm => "rpm",
            Self::KilometersPerHour => "km/h",
            Self::Celsius => "°C",
            Self::Percent => "%",
            Self::Kilopascal => "kPa",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Function turning a PID's data bytes into a value.
///
/// Called only with at least [`PidRule::required_bytes`] bytes.
pub type DecodeFn = fn(&[u8]) -> f64;

/// How to decode one PID.
#[derive(Debug, Clone, Copy)]
pub struct PidRule {
    /// Human-readable name.
    pub name: &'static str,
    /// Unit of the decoded value.
    pub unit: Unit,
    /// Minimum number of data bytes in a reply.
    pub required_bytes: usize,
    /// Decode function.
    pub decode: DecodeFn,
}

impl PidRule {
    /// Create a new rule.
    pub const fn new(
        name: &'static str,
        unit: Unit,
        required_bytes: usize,
        decode: DecodeFn,
    ) -> Self {
        Self {
            name,
            unit,
            required_bytes,
            decode,
        }
    }
}

fn decode_rpm(data: &[u8]) -> f64 {
    (256.0 * f64::from(data[0]) + f64::from(data[1])) / 4.0
}

fn decode_single_byte(data: &[u8]) -> f64 {
    f64::from(data[0])
}

fn decode_offset_temperature(data: &[u8]) -> f64 {
    f64::from(data[0]) - 40.0
}

fn decode_percent(data: &[u8]) -> f64 {
    f64::from(data[0]) * 100.0 / 255.0
}

/// Map from PID to decode rule.
#[derive(Debug, Clone)]
pub struct PidTable {
    rules: HashMap<Pid, PidRule>,
}

impl PidTable {
    /// Create a table with no rules.
    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Create a table with the built-in rules.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.insert(
            Pid::ENGINE_LOAD,
            PidRule::new("Engine load", Unit::Percent, 1, decode_percent),
        );
        table.insert(
            Pid::COOLANT_TEMPERATURE,
            PidRule::new(
                "Coolant temperature",
                Unit::Celsius,
                1,
                decode_offset_temperature,
            ),
        );
        table.insert(
            Pid::INTAKE_MANIFOLD_PRESSURE,
            PidRule::new(
                "Intake manifold pressure",
                Unit::Kilopascal,
                1,
                decode_single_byte,
            ),
        );
        table.insert(
            Pid::RPM,
            PidRule::new("Engine RPM", Unit::Rpm, 2, decode_rpm),
        );
        table.insert(
            Pid::SPEED,
            PidRule::new(
                "Vehicle speed",
                Unit::KilometersPerHour,
                1,
                decode_single_byte,
            ),
        );
        table.insert(
            Pid::THROTTLE_POSITION,
            PidRule::new("Throttle position", Unit::Percent, 1, decode_percent),
        );
        table
    }

    /// Add or replace a rule, returning the previous one.
    ///
    /// # Errors
    ///
    /// Rejects a rule with `required_bytes == 0`; its decode function could
    /// be handed an empty slice.
    pub fn register(&mut self, pid: Pid, rule: PidRule) -> Result<Option<PidRule>> {
        if rule.required_bytes == 0 {
            return Err(Error::InvalidParameter {
                name: format!("required_bytes for PID {}", pid),
                value: "0".to_string(),
            });
        }
        Ok(self.insert(pid, rule))
    }

    fn insert(&mut self, pid: Pid, rule: PidRule) -> Option<PidRule> {
        self.rules.insert(pid, rule)
    }

    /// Look up the rule for a PID.
    pub fn get(&self, pid: Pid) -> Option<&PidRule> {
        self.rules.get(&pid)
    }

    /// Check whether a PID has a rule.
    pub fn contains(&self, pid: Pid) -> bool {
        self.rules.contains_key(&pid)
    }

    /// All PIDs with a rule, in ascending order.
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<_> = self.rules.keys().copied().collect();
        pids.sort();
        pids
    }
}

impl Default for PidTable {
    fn default() -> Self {
        Self::standard()
    }
}
