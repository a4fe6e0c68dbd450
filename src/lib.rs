//! # usbserial
//!
//! Serial (UART-over-USB) device discovery, connection lifecycle, and
//! byte-stream I/O engine.
//!
//! The crate is organized around three actors:
//!
//! - the [`monitor::DeviceMonitor`], a background task scanning the OS
//!   device namespace and emitting arrival/removal events;
//! - the [`serial::SerialConnection`], one open device handle with termios
//!   configuration, blocking writes, framed blocking reads, and a background
//!   read watch republishing carriage-return-framed lines;
//! - the [`session::SerialSession`] boundary, which ties the two together
//!   behind typed command methods and one merged outbound event channel.
//!
//! ```no_run
//! use usbserial::prelude::*;
//!
//! # async fn demo() -> usbserial::error::Result<()> {
//! let session = SerialSession::start();
//! let mut events = session.subscribe();
//! if let Ok(SessionEvent::AddDevice(device)) = events.recv().await {
//!     session.connect(&device.path)?;
//!     session.configure(&TerminalSettings::default())?;
//!     session.write_string("AT\r")?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod monitor;
pub mod serial;
pub mod session;

/// Commonly used items.
pub mod prelude {
    pub use crate::error::{PortError, Result};
    pub use crate::monitor::{DeviceEvent, DeviceIdentity, DeviceMonitor, DeviceRegistry};
    pub use crate::serial::{DataBits, Parity, SerialConnection, TerminalSettings};
    pub use crate::session::{SerialSession, SessionEvent};
}
