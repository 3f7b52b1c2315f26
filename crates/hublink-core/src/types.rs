/*!
 * Core identifier types for HubLink.
 *
 * This module defines the hardware identifier used throughout the library to
 * address a single function of a device, and the derivation of a function
 * class name from it.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A fully-qualified function identifier, `serialNumber.functionId`
///
/// The serial number identifies the physical device; the function id
/// identifies one of its capabilities (e.g. `temperature1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareId(String);

impl HardwareId {
    /// Create a hardware id from its serial number and function id parts
    pub fn new<S: AsRef<str>, F: AsRef<str>>(serial: S, function_id: F) -> Self {
        Self(format!("{}.{}", serial.as_ref(), function_id.as_ref()))
    }

    /// Parse a dotted hardware id string
    pub fn parse<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let dot = s.find('.').ok_or_else(|| {
            Error::invalid_argument(format!("Invalid hardware id (missing dot): {}", s))
        })?;
        if dot == 0 || dot + 1 == s.len() {
            return Err(Error::invalid_argument(format!(
                "Invalid hardware id (empty part): {}",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the device serial number part
    pub fn serial(&self) -> &str {
        // Constructors guarantee the dot is present
        &self.0[..self.0.find('.').unwrap_or(self.0.len())]
    }

    /// Get the function id part
    pub fn function_id(&self) -> &str {
        match self.0.find('.') {
            Some(dot) => &self.0[dot + 1..],
            None => "",
        }
    }

    /// Get the function class name this hardware id belongs to
    pub fn function_class(&self) -> String {
        function_class(self.function_id())
    }
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the function class name for a function id
///
/// The class name is the function id with its trailing instance digits
/// stripped and the first letter capitalized: `temperature1` -> `Temperature`.
/// The mapping is pure and idempotent; it never depends on any registered hub.
pub fn function_class(function_id: &str) -> String {
    let stem = function_id.trim_end_matches(|c: char| c.is_ascii_digit());
    let mut chars = stem.chars();
    match chars.next() {
        Some(first) => {
            let mut name = String::with_capacity(stem.len());
            name.push(first.to_ascii_uppercase());
            name.push_str(chars.as_str());
            name
        }
        None => String::new(),
    }
}
