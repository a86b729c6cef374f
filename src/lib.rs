//! Master-board side of the roti machine.
//!
//! The master talks to a single slave board that hosts every actuator module
//! (dispensers, kneader, vertical tray, wedge press, kicker, heaters). Layers, from
//! the wire up:
//!
//! - [`protocol`]: frame codec (`[module][sub][payload]`, little-endian, Q16.16)
//! - [`transport`]: request/response exchange with the resend policy
//! - [`modules`]: one typed driver per slave module, plus the completion poller
//! - [`sequencer`]: recipe steps, the module gate and the step sequencer
//! - [`workers`]: background stage workers with a start/done handshake
//!
//! [`config`] and [`logging`] carry the ambient setup shared by the binary and tests.

pub mod config;
pub mod error;
pub mod logging;
pub mod modules;
pub mod protocol;
pub mod sequencer;
pub mod transport;
pub mod workers;

pub use error::{AppResult, MasterError};
