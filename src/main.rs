//! Demo binary: start the engine, connect to the first device that appears,
//! and print every event until interrupted.

use log::{error, info};
use usbserial::prelude::*;

#[tokio::main]
async fn main() {
    env_logger::init();

    let session = SerialSession::start();
    let mut events = session.subscribe();

    for device in session.list_devices() {
        info!("known device: {}", device.path);
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::AddDevice(device)) => {
                    info!(
                        "device added: {} ({})",
                        device.path,
                        device.name.as_deref().unwrap_or("unknown")
                    );
                    match session.connect(&device.path) {
                        Ok(true) => {
                            if let Err(e) = session.configure(&TerminalSettings::default()) {
                                error!("configure failed: {e}");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => error!("connect failed: {e}"),
                    }
                }
                Ok(SessionEvent::RemoveDevice(device)) => {
                    info!("device removed: {}", device.path);
                }
                Ok(SessionEvent::ReceivedTransmission { data }) => {
                    println!("{data}");
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                session.shutdown();
                break;
            }
        }
    }
}
