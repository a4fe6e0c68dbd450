//! # Session Module
//!
//! [`SerialSession`] is the process boundary of the engine: typed command
//! methods on one side, a single merged [`SessionEvent`] channel on the
//! other. It owns the device monitor and at most one connected
//! [`SerialConnection`]; connecting while a session is open closes the
//! previous one first, and removal of the connected device closes it too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::info;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{PortError, Result};
use crate::monitor::{
    DEFAULT_SCAN_INTERVAL, DeviceEnumerator, DeviceEvent, DeviceIdentity, DeviceMonitor,
    DeviceRegistry, UsbEnumerator,
};
use crate::serial::{SerialConnection, TerminalSettings};

/// Outbound event of the engine boundary.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// A serial device appeared.
    AddDevice(DeviceIdentity),
    /// A serial device vanished.
    RemoveDevice(DeviceIdentity),
    /// One carriage-return-framed transmission from the connected device,
    /// or a formatted error string when the background read failed.
    ReceivedTransmission { data: String },
}

/// Engine boundary: device list, single connection slot, merged events.
pub struct SerialSession {
    registry: Arc<DeviceRegistry>,
    connection: Arc<Mutex<Option<SerialConnection>>>,
    events: broadcast::Sender<SessionEvent>,
    monitor_stop: Arc<AtomicBool>,
}

impl SerialSession {
    /// Starts the engine with the OS-backed enumerator and the default scan
    /// cadence. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start() -> Self {
        Self::with_enumerator(Arc::new(UsbEnumerator), DEFAULT_SCAN_INTERVAL)
    }

    /// Starts the engine over a caller-supplied enumerator and cadence.
    #[must_use]
    pub fn with_enumerator(
        enumerator: Arc<dyn DeviceEnumerator>,
        scan_interval: Duration,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let monitor =
            DeviceMonitor::new(Arc::clone(&registry), enumerator).with_interval(scan_interval);
        let monitor_stop = monitor.stop_handle();
        let device_events = monitor.subscribe();
        let (events, _) = broadcast::channel(100);

        let session = SerialSession {
            registry,
            connection: Arc::new(Mutex::new(None)),
            events,
            monitor_stop,
        };

        tokio::spawn(monitor.run());
        tokio::spawn(forward_device_events(
            device_events,
            session.events.clone(),
            Arc::clone(&session.connection),
        ));

        session
    }

    /// Subscribes to the merged outbound event channel.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Discovery-ordered snapshot of the currently attached devices.
    #[must_use]
    pub fn list_devices(&self) -> Vec<DeviceIdentity> {
        self.registry.snapshot()
    }

    /// Connects to `path`.
    ///
    /// An unknown path is a no-op returning `Ok(false)`. A known path closes
    /// any existing session, opens the device for receive and transmit, and
    /// starts forwarding its transmissions into the event channel.
    pub fn connect(&self, path: &str) -> Result<bool> {
        let Some(identity) = self.registry.get(path) else {
            return Ok(false);
        };

        let mut slot = self.connection_slot();
        if let Some(mut previous) = slot.take() {
            previous.close();
        }

        let mut connection = SerialConnection::new(identity);
        connection.open(true, true)?;
        tokio::spawn(forward_transmissions(
            connection.subscribe(),
            self.events.clone(),
        ));
        *slot = Some(connection);

        info!("session connected to {path}");
        Ok(true)
    }

    /// Applies line-discipline settings to the connected device. No session
    /// is a documented no-op returning `Ok(false)`.
    pub fn configure(&self, settings: &TerminalSettings) -> Result<bool> {
        match self.connection_slot().as_ref() {
            Some(connection) => connection.configure(settings),
            None => Ok(false),
        }
    }

    /// Writes a string to the connected device.
    pub fn write_string(&self, data: &str) -> Result<usize> {
        match self.connection_slot().as_ref() {
            Some(connection) => connection.write_str(data),
            None => Err(PortError::MustBeOpen),
        }
    }

    /// Writes the first `length` bytes of `data` to the connected device.
    ///
    /// A length beyond the buffer is rejected rather than clamped.
    pub fn write_bytes(&self, data: &[u8], length: usize) -> Result<usize> {
        if length > data.len() {
            return Err(PortError::invalid_argument(format!(
                "write length {length} exceeds buffer of {} bytes",
                data.len()
            )));
        }
        match self.connection_slot().as_ref() {
            Some(connection) => connection.write_bytes(&data[..length]),
            None => Err(PortError::MustBeOpen),
        }
    }

    /// Closes the current session if any. Returns true when no handle
    /// remains open afterwards, which is always the case; disconnecting an
    /// idle session succeeds too.
    pub fn disconnect(&self) -> bool {
        if let Some(mut connection) = self.connection_slot().take() {
            connection.close();
            info!("session disconnected from {}", connection.identity().path);
        }
        true
    }

    /// Disconnects and stops the monitor loop.
    pub fn shutdown(&self) {
        self.disconnect();
        self.monitor_stop.store(true, Ordering::SeqCst);
    }

    fn connection_slot(&self) -> MutexGuard<'_, Option<SerialConnection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Forwards monitor lifecycle events into the session channel, closing the
/// active connection when its device is the one removed.
async fn forward_device_events(
    mut device_events: broadcast::Receiver<DeviceEvent>,
    events: broadcast::Sender<SessionEvent>,
    connection: Arc<Mutex<Option<SerialConnection>>>,
) {
    loop {
        let event = match device_events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match event {
            DeviceEvent::Added(identity) => {
                let _ = events.send(SessionEvent::AddDevice(identity));
            }
            DeviceEvent::Removed(identity) => {
                let mut slot = connection.lock().unwrap_or_else(PoisonError::into_inner);
                if slot
                    .as_ref()
                    .is_some_and(|c| c.identity().path == identity.path)
                {
                    // Bounded by the watch poll interval.
                    if let Some(mut gone) = slot.take() {
                        gone.close();
                    }
                    info!("connected device {} removed, session closed", identity.path);
                }
                drop(slot);
                let _ = events.send(SessionEvent::RemoveDevice(identity));
            }
        }
    }
}

/// Forwards one connection's transmissions into the session channel until
/// the connection is dropped.
async fn forward_transmissions(
    mut transmissions: broadcast::Receiver<String>,
    events: broadcast::Sender<SessionEvent>,
) {
    loop {
        match transmissions.recv().await {
            Ok(data) => {
                let _ = events.send(SessionEvent::ReceivedTransmission { data });
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}
