//! A library for collecting telemetry from Modbus/TCP servers.
//!
//! Every poll cycle reads a configured list of holding registers from each
//! server, decodes the 32-bit values, applies the configured unit conversion
//! and stores one row per server and cycle in SQLite. Failures stay local:
//! an unreachable server only leaves its row empty, a failed register only
//! leaves its column empty.
//!
//! The building blocks are
//!
//! - [`protocol`]: wire types and the big-endian decoder,
//! - [`conversion`]: unit conversion and rounding,
//! - [`descriptor`]: server and register descriptions,
//! - [`transport`]: the Modbus/TCP connection layer,
//! - [`storage`] and [`recorder`]: persistence of poll records,
//! - [`reporter`]: console and MQTT output,
//! - [`engine`]: the poll cycle tying everything together.
//!
//! ## Quick Start
//!
//! ```no_run
//! use modcol_lib::{
//!     descriptor::{RegisterDescriptor, ServerDescriptor},
//!     engine::PollEngine,
//!     protocol::WireType,
//!     recorder::Recorder,
//!     reporter::ConsoleReporter,
//!     storage::SqliteStore,
//!     transport::TcpTransport,
//! };
//! use std::{sync::Arc, time::Duration};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let inverter = ServerDescriptor::new("Inverter", "192.168.1.100", 502, 1)?
//!         .with_register(RegisterDescriptor::new("AC_power", 40091, WireType::Float32, "W")?);
//!
//!     let store = SqliteStore::open("collector.db").await?;
//!     let transport = TcpTransport::new(Duration::from_secs(3), Duration::from_secs(1));
//!     let mut engine = PollEngine::new(
//!         vec![inverter],
//!         transport,
//!         Recorder::new(store),
//!         Arc::new(ConsoleReporter::new()),
//!     );
//!     engine.prepare().await?;
//!     let summary = engine.poll_cycle().await?;
//!     println!("{} values read", summary.value_count());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conversion;
pub mod descriptor;
pub mod engine;
mod error;
pub mod protocol;
pub mod recorder;
pub mod reporter;
pub mod storage;
pub mod transport;

pub use error::{Error, Result};
