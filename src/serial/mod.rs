//! # Serial Module
//!
//! Port-level building blocks: line-discipline settings and the open
//! connection with its framing reads and background read watch.

pub mod connection;
pub mod settings;

pub use connection::{CARRIAGE_RETURN, LINE_FEED, SerialConnection};
pub use settings::{DataBits, Parity, TerminalSettings};
