//! Polling and state coordination for Swegon CASA ventilation units over Modbus TCP, based on [tokio-modbus](https://github.com/slowtec/tokio-modbus).

//! ## Overview
//!
//! The crate keeps an in-memory copy of the unit's datapoints and refreshes it periodically:
//!
//! - [`registers::RegisterMap`] describes every datapoint: group, key, address, encoding and access,
//! - [`transport::ModbusTransport`] owns the single TCP session to the unit and reconnects on failure,
//! - [`store::DatapointStore`] holds the last known value of each datapoint (`Unknown` until read),
//! - [`scheduler::PollScheduler`] decides which groups a refresh cycle reads and when the next cycle runs,
//! - [`coordinator::DeviceCoordinator`] ties them together and is the only API presentation code needs.
//!
//! After any write the coordinator polls at the fast interval for six cycles, then falls back
//! to the normal interval.
//!
//! ## Configuration
//!
//! [`config::UnitConfig`] is loaded from defaults, an optional TOML file and `SWEGON_*` environment variables.
//! The polling intervals are bounded: `scan_interval` to 5..=999 s and `scan_interval_fast` to 1..=999 s.
//!
//! ## Example
//!
//! ```no_run
//! # async fn run() -> swegon_casa::Result<()> {
//! use std::sync::Arc;
//! use swegon_casa::{registers, DeviceCoordinator, UnitConfig};
//!
//! let config = UnitConfig::load(None)?;
//! let coordinator = Arc::new(DeviceCoordinator::from_config(&config)?);
//! let polling = coordinator.spawn_polling();
//!
//! coordinator
//!     .write_value(registers::COMMANDS, "Fireplace_Mode", true)
//!     .await?;
//! println!("{}", coordinator.get_value(registers::SENSORS, registers::FRESH_TEMP));
//! # polling.abort();
//! # Ok(())
//! # }
//! ```

/// Utilities for encoding from and decoding to Modbus registers
pub mod codec;
/// Connection and polling settings
pub mod config;
pub mod coordinator;
pub mod error;
/// Register layout of the unit
pub mod registers;
pub mod scheduler;
pub mod store;
pub mod transport;
pub mod value;

/// CASA unit simulator (based on tokio-modbus [servers examples](https://github.com/slowtec/tokio-modbus/tree/main/examples))
#[cfg(feature = "simulator")]
pub mod simulator;

pub use config::{DeviceModel, UnitConfig};
pub use coordinator::{DatapointChange, DeviceCoordinator, DeviceIdentity};
pub use error::{Error, Result, TransportError};
pub use scheduler::PollMode;
pub use value::{Value, ValueKind};
