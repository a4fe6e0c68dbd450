//! # Device Monitor Module
//!
//! Background device-presence monitoring. The [`DeviceMonitor`] scans the OS
//! device namespace on a fixed cadence, diffs the result against the
//! [`DeviceRegistry`] and emits one lifecycle event per arrived or departed
//! path. Enumeration failures are logged and retried on the next iteration;
//! the loop never terminates because of one.

pub mod registry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio_serial::{SerialPortInfo, SerialPortType, available_ports};

use crate::error::{PortError, Result};

pub use registry::{DeviceIdentity, DeviceRegistry};

/// Default pause between two scans of the device namespace.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Lifecycle event for one device path.
#[derive(Clone, Debug)]
pub enum DeviceEvent {
    /// A path appeared; carries the full identity metadata.
    Added(DeviceIdentity),
    /// A path vanished; carries at least the path.
    Removed(DeviceIdentity),
}

/// Source of the current set of serial-capable device nodes.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceEnumerator: Send + Sync {
    /// Enumerates all currently attached serial devices.
    fn enumerate(&self) -> Result<Vec<DeviceIdentity>>;
}

/// Enumerator backed by the OS serial port list, resolving identity metadata
/// from the USB ancestry where available.
#[derive(Debug, Default)]
pub struct UsbEnumerator;

impl DeviceEnumerator for UsbEnumerator {
    fn enumerate(&self) -> Result<Vec<DeviceIdentity>> {
        let ports =
            available_ports().map_err(|e| PortError::Io(std::io::Error::other(e)))?;
        Ok(ports.into_iter().map(identity_from_port).collect())
    }
}

fn identity_from_port(port: SerialPortInfo) -> DeviceIdentity {
    match port.port_type {
        SerialPortType::UsbPort(usb) => DeviceIdentity {
            path: port.port_name,
            name: usb.product,
            vendor_name: usb.manufacturer,
            serial_number: usb.serial_number,
            vendor_id: Some(usb.vid),
            product_id: Some(usb.pid),
        },
        _ => DeviceIdentity::new(port.port_name),
    }
}

/// Background device-presence monitor.
///
/// Owns the registry mutation side and an output channel of [`DeviceEvent`]s.
/// Runs for the lifetime of the process unless its stop handle is raised.
pub struct DeviceMonitor {
    registry: Arc<DeviceRegistry>,
    enumerator: Arc<dyn DeviceEnumerator>,
    events: broadcast::Sender<DeviceEvent>,
    scan_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl DeviceMonitor {
    /// Creates a monitor over `registry` fed by `enumerator`.
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>, enumerator: Arc<dyn DeviceEnumerator>) -> Self {
        let (events, _) = broadcast::channel(100);
        DeviceMonitor {
            registry,
            enumerator,
            events,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Overrides the scan cadence.
    #[must_use]
    pub fn with_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Shared flag that ends [`run`](Self::run) when raised.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Runs the scan loop until the stop handle is raised.
    pub async fn run(self) {
        info!("device monitor started");
        while !self.stop.load(Ordering::SeqCst) {
            self.scan_once();
            tokio::time::sleep(self.scan_interval).await;
        }
        info!("device monitor stopped");
    }

    /// One enumerate-diff-emit iteration.
    ///
    /// No registry lock is held across an event send; mutation and emission
    /// are the only side effects.
    fn scan_once(&self) {
        let found = match self.enumerator.enumerate() {
            Ok(found) => found,
            Err(e) => {
                warn!("device enumeration failed, retrying next scan: {e}");
                return;
            }
        };

        let known = self.registry.snapshot();
        for departed in known
            .into_iter()
            .filter(|d| !found.iter().any(|f| f.path == d.path))
        {
            self.registry.remove(&departed.path);
            debug!("device removed: {}", departed.path);
            let _ = self.events.send(DeviceEvent::Removed(departed));
        }

        for identity in found {
            if self.registry.insert(identity.clone()) {
                debug!("device added: {}", identity.path);
                let _ = self.events.send(DeviceEvent::Added(identity));
            }
        }
    }
}
