//! Serial side of the Pylontech bridge.
//!
//! Opens the BMS debug console, keeps an authorized session alive and turns
//! every `getpwr` response into published telemetry.
//!
//! # Example:
//!
//! ```no_run
//! use pylon_rust::config::BridgeConfig;
//! use pylon_rust::poll_loop::PollLoop;
//! use pylon_rust::session::PylonSession;
//! use pylon_rust::sink::JsonLinesSink;
//!
//! let mut config = BridgeConfig::default();
//! config.device.barcode = "PPTAP01419B15082".to_string();
//!
//! let session = PylonSession::open(&config.serial, &config.protocol).unwrap();
//! let mut poll_loop = PollLoop::new(session, JsonLinesSink::stdout(), &config);
//! poll_loop.run().unwrap();
//! ```

pub mod config;
pub mod link;
pub mod mock_serial;
pub mod poll_loop;
pub mod publisher;
pub mod session;
pub mod sink;

pub use config::BridgeConfig;
pub use poll_loop::PollLoop;
pub use session::PylonSession;
