//! Declarative machine configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::log::LogStream;

/// Default guest memory size, in emulator `-m` syntax.
const DEFAULT_MEMORY: &str = "1G";

/// Resource sizing and networking for a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct MachineConfig {
    /// Guest memory size (e.g. `"512M"`, `"2G"`).
    pub memory: String,
    /// Number of virtual CPUs. `None` leaves the emulator default.
    pub cpus: Option<u32>,
    /// Host-to-guest forward rules in emulator `hostfwd` syntax
    /// (e.g. `"tcp::2222-:22"`).
    pub ports: Vec<String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory: DEFAULT_MEMORY.to_owned(),
            cpus: None,
            ports: Vec::new(),
        }
    }
}

/// Reference to the image a machine boots from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Image {
    /// Image reference (e.g. `debian:12`).
    pub reference: String,
}

impl Image {
    /// Creates an image reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference)
    }
}

/// Options for [`Machine::start`](crate::Machine::start).
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct StartOptions {
    /// Host port of the metadata service the guest fetches its
    /// configuration from during first boot.
    pub imds_port: u16,
    /// Stream that receives the emulator's stderr.
    pub output: Option<LogStream>,
}

impl StartOptions {
    /// Options with the given metadata-service port and no output capture.
    pub const fn new(imds_port: u16) -> Self {
        Self {
            imds_port,
            output: None,
        }
    }

    /// Copies the emulator's stderr into `stream`.
    #[must_use]
    pub fn output(mut self, stream: LogStream) -> Self {
        self.output = Some(stream);
        self
    }
}
