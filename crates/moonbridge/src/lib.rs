//! moonbridge: a bridge between a home-automation host and a Moonraker
//! (Klipper) 3D-printer API.
//!
//! The host constructs one [`Coordinator`] per configured printer, drives
//! its refresh entrypoint (or starts the socket session), reads typed
//! state through snapshots and [`bindings`], and submits G-code commands.

pub mod bindings;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod printer;
pub mod protocol;
pub mod transport;

pub use command::{Command, GcodeTemplate};
pub use config::{Config, LogLevel, PrinterConfig, TransportMode};
pub use coordinator::{Coordinator, SyncPhase};
pub use error::{
    CommandError, ConfigError, ConnectionError, FetchFailure, ProtocolError, UpdateError,
};
pub use printer::{DeviceInfo, PrinterState, ProcStats};
