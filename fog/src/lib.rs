//! Runtime core of the fog virtual-machine supervisor.
//!
//! `fog` boots QEMU guest processes, keeps a durable connection to each
//! guest's serial socket, and merges the output of many named log sources
//! into a single readable stream.
//!
//! # Quick start
//!
//! ```no_run
//! use fog::{Image, Machine, MachineConfig, StartOptions};
//!
//! let mut config = MachineConfig::default();
//! config.ports = vec!["tcp::2222-:22".into()];
//! let machine = Machine::new("web", config, Image::new("debian:12"), "/var/lib/fog/debian.qcow2");
//!
//! machine.start(&StartOptions::new(8080)).expect("failed to start machine");
//! let conn = machine.conn().expect("guest serial socket never came up");
//! # drop(conn);
//! ```
//!
//! Log multiplexing needs a tokio runtime for its flush timers:
//!
//! ```no_run
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> fog::Result<()> {
//! use std::io::Write;
//!
//! let mux = fog::LogMux::new(std::io::stdout())?;
//! let mut web = mux.stream("web");
//! let mut db = mux.stream("db");
//! mux.refresh_colors();
//!
//! writeln!(web, "listening on :80")?;
//! writeln!(db, "ready to accept connections")?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod id;
#[cfg(unix)]
mod launch;
pub mod log;
#[cfg(unix)]
mod machine;
mod retry;

pub use config::{Image, MachineConfig, StartOptions};
pub use error::{Error, Result};
pub use id::generate_id;
#[cfg(unix)]
pub use launch::{Launcher, SystemLauncher};
pub use log::{ColorMode, LogMux, LogMuxBuilder, LogStream, Style};
#[cfg(unix)]
pub use machine::{Conn, Dial, Machine, MachineBuilder, UnixDialer};
pub use retry::RetryPolicy;
