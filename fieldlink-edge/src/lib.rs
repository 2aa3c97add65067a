//! Fieldlink edge translator.
//!
//! The translator turns a remotely fetched configuration into running device
//! pollers and a bus publisher:
//!
//! - [`config`] - Agent configuration model and legacy-shape flattening
//! - [`driver`] - The driver capability set (parse, run, poll, status)
//! - [`drivers`] - Concrete drivers and the protocol registry
//! - [`translator`] - Poll scheduling and lifecycle state machine
//! - [`publisher`] - Alias assignment and birth/data/death publishing
//! - [`supervisor`] - Remote-config polling and the restart-without-exit loop

pub mod config;
pub mod driver;
pub mod drivers;
pub mod publisher;
pub mod supervisor;
pub mod translator;

pub use config::{AgentConfig, ConnectionConfig, DeviceSpec, TagSpec};
pub use driver::{Address, ConnectionStatus, Driver};
pub use drivers::DriverRegistry;
pub use supervisor::ShutdownReason;
pub use translator::{NodeIdentity, Translator};
