//! # Serial Connection Module
//!
//! One [`SerialConnection`] owns the open file handle for one device path:
//! open/close lifecycle, line-discipline configuration, blocking writes, and
//! blocking reads with several framing strategies (fixed length, terminator,
//! end-of-stream). Device removal is detected by inspecting the handle's link
//! count before each read. While the port is open a background read watch
//! polls the handle and republishes carriage-return-framed lines as events.
//!
//! The terminator and end-of-stream reads keep the byte-at-a-time observable
//! contract of a classic serial line reader, but internally read in chunks
//! and retain the unconsumed remainder for the next call.

use std::collections::VecDeque;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use rustix::fs::{FlockOperation, Mode, OFlags, fcntl_getfl, fcntl_setfl, flock, fstat, open};
use tokio::sync::broadcast;

use crate::error::{PortError, Result};
use crate::monitor::DeviceIdentity;
use crate::serial::settings::{self, TerminalSettings};

/// Carriage return, the default transmission terminator.
pub const CARRIAGE_RETURN: u8 = 13;

/// Line feed.
pub const LINE_FEED: u8 = 10;

/// Chunk size for buffered framing reads.
const READ_CHUNK: usize = 256;

/// Poll interval for the background read watch; bounds how long `close`
/// waits for the watch thread to notice the stop flag.
const WATCH_POLL_MS: u16 = 200;

/// Wait between retries when a read returned no bytes.
const IDLE_WAIT_MS: u16 = 50;

/// State shared between the connection and its read watch thread.
struct Shared {
    /// Present if and only if the port is open.
    handle: RwLock<Option<Arc<OwnedFd>>>,
    /// Bytes read but not yet consumed by a framing strategy.
    buffer: Mutex<VecDeque<u8>>,
    /// True until the first watch delivery of a session completes.
    /// Bookkeeping only; no read path branches on it.
    fresh_session: AtomicBool,
}

impl Shared {
    fn handle(&self) -> Option<Arc<OwnedFd>> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn require_handle(&self) -> Result<Arc<OwnedFd>> {
        self.handle().ok_or(PortError::MustBeOpen)
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background watch attached to an open connection.
struct ReadWatch {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl ReadWatch {
    /// Raises the stop flag and waits for the thread to exit. The watch
    /// never closes the port itself; that already happened (or is about to)
    /// in `close`.
    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.thread.join();
    }
}

/// A serial device session over one open file handle.
pub struct SerialConnection {
    identity: DeviceIdentity,
    shared: Arc<Shared>,
    watch: Option<ReadWatch>,
    transmissions: broadcast::Sender<String>,
}

impl SerialConnection {
    /// Creates a closed connection for `identity`.
    #[must_use]
    pub fn new(identity: DeviceIdentity) -> Self {
        let (transmissions, _) = broadcast::channel(100);
        SerialConnection {
            identity,
            shared: Arc::new(Shared {
                handle: RwLock::new(None),
                buffer: Mutex::new(VecDeque::new()),
                fresh_session: AtomicBool::new(true),
            }),
            watch: None,
            transmissions,
        }
    }

    /// Identity of the device this connection is bound to.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Returns true while a handle is held.
    pub fn is_open(&self) -> bool {
        self.shared.handle().is_some()
    }

    /// True until the first watch delivery of the current session.
    pub fn is_fresh_session(&self) -> bool {
        self.shared.fresh_session.load(Ordering::SeqCst)
    }

    /// Subscribes to carriage-return-framed transmissions delivered by the
    /// read watch. The payload is the decoded line, or a formatted error
    /// string when the watch read failed.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.transmissions.subscribe()
    }

    /// Opens the device path and starts the read watch.
    ///
    /// Any existing handle is closed first, so reopening is idempotent. The
    /// node is opened exclusively (non-blocking `flock`), without becoming
    /// the controlling terminal, and in blocking I/O mode.
    pub fn open(&mut self, receive: bool, transmit: bool) -> Result<()> {
        self.close();

        if self.identity.path.is_empty() {
            return Err(PortError::InvalidPath);
        }

        let access = match (receive, transmit) {
            (true, true) => OFlags::RDWR,
            (true, false) => OFlags::RDONLY,
            (false, true) => OFlags::WRONLY,
            (false, false) => return Err(PortError::MustReceiveOrTransmit),
        };

        let path = self.identity.path.clone();
        let fd = open(
            path.as_str(),
            access | OFlags::NOCTTY | OFlags::NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| PortError::failed_to_open(path.as_str(), e.into()))?;

        flock(&fd, FlockOperation::NonBlockingLockExclusive)
            .map_err(|e| PortError::failed_to_open(path.as_str(), e.into()))?;

        // NONBLOCK guarded the open call against a hung modem line; all
        // subsequent I/O is blocking.
        let flags = fcntl_getfl(&fd).map_err(|e| PortError::failed_to_open(path.as_str(), e.into()))?;
        fcntl_setfl(&fd, flags & !OFlags::NONBLOCK)
            .map_err(|e| PortError::failed_to_open(path.as_str(), e.into()))?;

        *self
            .shared
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(fd));
        self.shared.fresh_session.store(true, Ordering::SeqCst);
        self.start_watch();

        info!("opened serial port {path}");
        Ok(())
    }

    /// Applies `settings` to the open handle.
    ///
    /// Returns `Ok(false)` without touching anything when the port is
    /// closed; configuring a closed connection is documented as a no-op,
    /// not an error.
    pub fn configure(&self, settings: &TerminalSettings) -> Result<bool> {
        match self.shared.handle() {
            None => Ok(false),
            Some(fd) => {
                settings::apply(fd.as_fd(), settings)?;
                debug!("configured serial port {}", self.identity.path);
                Ok(true)
            }
        }
    }

    /// Writes raw bytes, returning the count actually written.
    ///
    /// A short write returns the actual count and is not an error; a caller
    /// that needs exact delivery must loop.
    pub fn write_bytes(&self, data: &[u8]) -> Result<usize> {
        let fd = self.shared.require_handle()?;
        rustix::io::write(fd.as_fd(), data).map_err(io_err)
    }

    /// Writes a string as its UTF-8 bytes.
    pub fn write_str(&self, data: &str) -> Result<usize> {
        self.write_bytes(data.as_bytes())
    }

    /// One blocking read into `out`, preceded by the link-count check.
    ///
    /// Bytes retained by a previous framing read are served first. `Ok(0)`
    /// means end of stream and is returned verbatim.
    pub fn read_bytes(&self, out: &mut [u8]) -> Result<usize> {
        let fd = self.shared.require_handle()?;
        check_connected(&fd)?;

        {
            let mut buffer = self.shared.buffer();
            if !buffer.is_empty() {
                let count = out.len().min(buffer.len());
                for slot in out.iter_mut().take(count) {
                    // non-empty per count bound
                    if let Some(byte) = buffer.pop_front() {
                        *slot = byte;
                    }
                }
                return Ok(count);
            }
        }

        read_fd(&fd, out)
    }

    /// Reads up to `length` bytes as an owned buffer.
    ///
    /// A read that produced no bytes yields an empty buffer rather than an
    /// error, mirroring the non-positive-count contract of [`read_bytes`]
    /// (a buffer is never sized from a negative count). Precondition
    /// failures (`MustBeOpen`, `DeviceNotConnected`) still propagate.
    ///
    /// [`read_bytes`]: Self::read_bytes
    pub fn read_data(&self, length: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; length];
        match self.read_bytes(&mut data) {
            Ok(count) => {
                data.truncate(count);
                Ok(data)
            }
            Err(PortError::Io(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Reads until `length` bytes have been decoded as UTF-8.
    ///
    /// A decode failure ends the loop and returns what accumulated so far;
    /// this is documented lossy behavior, not an error. Blocks until the
    /// requested length is satisfied or decoding truncates it.
    pub fn read_string(&self, length: usize) -> Result<String> {
        let mut remaining = length;
        let mut result = String::new();

        while remaining > 0 {
            let data = self.read_data(remaining)?;
            if data.is_empty() {
                let fd = self.shared.require_handle()?;
                wait_readable(&fd, IDLE_WAIT_MS)?;
                continue;
            }
            match std::str::from_utf8(&data) {
                Ok(text) => {
                    result.push_str(text);
                    remaining -= data.len();
                }
                Err(_) => return Ok(result),
            }
        }

        Ok(result)
    }

    /// Reads until `terminator` arrives, returning the accumulated text with
    /// the terminator excluded. The remainder of the last chunk is retained
    /// for the next read.
    ///
    /// Any byte above the 7-bit ASCII range fails the whole call with
    /// [`PortError::UnableToConvertByteToCharacter`] and returns no partial
    /// data. Blocks without a timeout until the terminator or an error; a
    /// caller needing a deadline must wrap this externally.
    pub fn read_until_byte(&self, terminator: u8) -> Result<String> {
        let fd = self.shared.require_handle()?;
        let mut buffer = self.shared.buffer();

        loop {
            match scan_frame(&buffer, Some(terminator)) {
                Scan::HighByte(index) => {
                    buffer.drain(..=index);
                    return Err(PortError::UnableToConvertByteToCharacter);
                }
                Scan::Terminator(index) => {
                    let frame: Vec<u8> = buffer.drain(..index).collect();
                    buffer.pop_front();
                    return String::from_utf8(frame).map_err(|_| PortError::StringsMustBeUtf8);
                }
                Scan::Incomplete => {}
            }

            check_connected(&fd)?;
            let mut chunk = [0u8; READ_CHUNK];
            let count = read_fd(&fd, &mut chunk)?;
            if count == 0 {
                // End of stream without a terminator: stay blocked, as the
                // terminator contract demands, but yield between attempts.
                wait_readable(&fd, IDLE_WAIT_MS)?;
                continue;
            }
            buffer.extend(&chunk[..count]);
        }
    }

    /// Reads until the stream ends (a zero-length read), returning the
    /// accumulated text. Same 7-bit and UTF-8 rules as [`read_until_byte`].
    ///
    /// [`read_until_byte`]: Self::read_until_byte
    pub fn read_until_eof(&self) -> Result<String> {
        let fd = self.shared.require_handle()?;
        let mut buffer = self.shared.buffer();

        loop {
            if let Scan::HighByte(index) = scan_frame(&buffer, None) {
                buffer.drain(..=index);
                return Err(PortError::UnableToConvertByteToCharacter);
            }

            check_connected(&fd)?;
            let mut chunk = [0u8; READ_CHUNK];
            let count = read_fd(&fd, &mut chunk)?;
            if count == 0 {
                let frame: Vec<u8> = buffer.drain(..).collect();
                return String::from_utf8(frame).map_err(|_| PortError::StringsMustBeUtf8);
            }
            buffer.extend(&chunk[..count]);
        }
    }

    /// Reads one carriage-return-terminated transmission.
    pub fn read_cr_line(&self) -> Result<String> {
        self.read_until_byte(CARRIAGE_RETURN)
    }

    /// Reads one line-feed-terminated line.
    pub fn read_line(&self) -> Result<String> {
        self.read_until_byte(LINE_FEED)
    }

    /// Blocks until exactly one byte is available and returns it.
    ///
    /// Zero-length reads are retried after a short readiness wait rather
    /// than spun on.
    pub fn read_byte(&self) -> Result<u8> {
        let fd = self.shared.require_handle()?;

        if let Some(byte) = self.shared.buffer().pop_front() {
            return Ok(byte);
        }

        loop {
            check_connected(&fd)?;
            let mut one = [0u8; 1];
            if read_fd(&fd, &mut one)? > 0 {
                return Ok(one[0]);
            }
            wait_readable(&fd, IDLE_WAIT_MS)?;
        }
    }

    /// [`read_byte`](Self::read_byte) interpreted as a Unicode scalar in the
    /// Latin-1 range.
    pub fn read_char(&self) -> Result<char> {
        Ok(char::from(self.read_byte()?))
    }

    /// Stops the watch, releases the handle and clears retained state.
    ///
    /// Idempotent; closing an already-closed connection is a no-op.
    pub fn close(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.stop();
        }

        let had_handle = self
            .shared
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        self.shared.buffer().clear();
        self.shared.fresh_session.store(true, Ordering::SeqCst);

        if had_handle {
            info!("closed serial port {}", self.identity.path);
        }
    }

    fn start_watch(&mut self) {
        let shared = Arc::clone(&self.shared);
        let transmissions = self.transmissions.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let path = self.identity.path.clone();

        let spawned = thread::Builder::new()
            .name(format!("serial-watch-{path}"))
            .spawn(move || watch_loop(&shared, &transmissions, &flag, &path));

        match spawned {
            Ok(thread) => self.watch = Some(ReadWatch { stop, thread }),
            Err(e) => warn!(
                "failed to start read watch for {}: {e}",
                self.identity.path
            ),
        }
    }

    /// Wraps an already-open handle, without a watch. Test seam for
    /// pty/pipe-backed connections.
    #[cfg(test)]
    fn from_fd(identity: DeviceIdentity, fd: OwnedFd) -> Self {
        let mut connection = Self::new(identity);
        *connection
            .shared
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(fd));
        connection
    }
}

impl Drop for SerialConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn io_err(errno: rustix::io::Errno) -> PortError {
    PortError::Io(errno.into())
}

/// Fails with [`PortError::DeviceNotConnected`] when the device node backing
/// the handle has been unlinked. The link count is the disconnection proxy;
/// it avoids depending on a read error to notice a physically removed device.
fn check_connected(fd: &OwnedFd) -> Result<()> {
    let stat = fstat(fd).map_err(io_err)?;
    if stat.st_nlink != 1 {
        return Err(PortError::DeviceNotConnected);
    }
    Ok(())
}

/// One blocking read syscall, retried on EINTR.
fn read_fd(fd: &OwnedFd, out: &mut [u8]) -> Result<usize> {
    loop {
        match rustix::io::read(fd.as_fd(), &mut *out) {
            Err(rustix::io::Errno::INTR) => continue,
            other => return other.map_err(io_err),
        }
    }
}

/// Waits up to `timeout_ms` for the handle to become readable.
///
/// A hang-up or error condition with no readable data left is terminal;
/// retrying would spin on an instantly-ready but forever-empty handle.
fn wait_readable(fd: &OwnedFd, timeout_ms: u16) -> Result<()> {
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    let ready = match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(ready) => ready,
        Err(nix::errno::Errno::EINTR) => return Ok(()),
        Err(e) => return Err(PortError::Io(e.into())),
    };
    if ready > 0 {
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if !revents.intersects(PollFlags::POLLIN)
            && revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
        {
            return Err(PortError::DeviceNotConnected);
        }
    }
    Ok(())
}

enum Scan {
    /// A byte above the 7-bit range at this index.
    HighByte(usize),
    /// The terminator at this index.
    Terminator(usize),
    Incomplete,
}

fn scan_frame(buffer: &VecDeque<u8>, terminator: Option<u8>) -> Scan {
    for (index, &byte) in buffer.iter().enumerate() {
        if byte > 127 {
            return Scan::HighByte(index);
        }
        if Some(byte) == terminator {
            return Scan::Terminator(index);
        }
    }
    Scan::Incomplete
}

/// Read watch loop: emit buffered lines, then poll the handle and pull one
/// chunk per readiness signal. Exits when stopped, when the handle is gone,
/// or when the stream ends.
fn watch_loop(
    shared: &Shared,
    transmissions: &broadcast::Sender<String>,
    stop: &AtomicBool,
    path: &str,
) {
    debug!("read watch started for {path}");

    while !stop.load(Ordering::SeqCst) {
        let Some(fd) = shared.handle() else { break };

        match take_buffered_line(shared) {
            BufferedLine::Line(line) => {
                let _ = transmissions.send(line);
                shared.fresh_session.store(false, Ordering::SeqCst);
                continue;
            }
            BufferedLine::Failed(e) => {
                let _ = transmissions.send(format!("Error: {e}"));
                shared.fresh_session.store(false, Ordering::SeqCst);
                continue;
            }
            BufferedLine::Busy => {
                // A foreground framing read holds the buffer; back off.
                thread::sleep(Duration::from_millis(10));
                continue;
            }
            BufferedLine::Incomplete => {}
        }

        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        let ready = match poll(&mut fds, PollTimeout::from(WATCH_POLL_MS)) {
            Ok(ready) => ready,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("read watch poll failed for {path}: {e}");
                break;
            }
        };
        if ready == 0 {
            continue;
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if !revents.intersects(PollFlags::POLLIN) {
            if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
                let _ = transmissions.send(format!("Error: {}", PortError::DeviceNotConnected));
                break;
            }
            continue;
        }

        match fill_buffer(shared, &fd) {
            Ok(Some(0)) => break, // end of stream
            Ok(Some(_)) => {}
            Ok(None) => {
                // Foreground framing read owns the fd right now; back off.
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                let _ = transmissions.send(format!("Error: {e}"));
                break;
            }
        }
    }

    debug!("read watch stopped for {path}");
}

enum BufferedLine {
    Line(String),
    Failed(PortError),
    Busy,
    Incomplete,
}

fn take_buffered_line(shared: &Shared) -> BufferedLine {
    let Ok(mut buffer) = shared.buffer.try_lock() else {
        return BufferedLine::Busy;
    };
    match scan_frame(&buffer, Some(CARRIAGE_RETURN)) {
        Scan::HighByte(index) => {
            buffer.drain(..=index);
            BufferedLine::Failed(PortError::UnableToConvertByteToCharacter)
        }
        Scan::Terminator(index) => {
            let frame: Vec<u8> = buffer.drain(..index).collect();
            buffer.pop_front();
            match String::from_utf8(frame) {
                Ok(line) => BufferedLine::Line(line),
                Err(_) => BufferedLine::Failed(PortError::StringsMustBeUtf8),
            }
        }
        Scan::Incomplete => BufferedLine::Incomplete,
    }
}

/// Pulls one chunk from the handle into the shared buffer. `Ok(Some(0))` is
/// end of stream; `Ok(None)` means a foreground framing read holds the
/// buffer lock and the chunk was not read.
///
/// The lock is taken before the read syscall: the buffer lock serializes
/// every fd read, so the watch can never steal bytes out from under a
/// foreground framing read blocked on the same handle.
fn fill_buffer(shared: &Shared, fd: &OwnedFd) -> Result<Option<usize>> {
    let Ok(mut buffer) = shared.buffer.try_lock() else {
        return Ok(None);
    };
    check_connected(fd)?;
    let mut chunk = [0u8; READ_CHUNK];
    let count = read_fd(fd, &mut chunk)?;
    buffer.extend(&chunk[..count]);
    Ok(Some(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};

    fn identity(path: &str) -> DeviceIdentity {
        DeviceIdentity::new(path)
    }

    /// Pty pair as (master writer handle, slave-backed connection).
    fn pty_connection() -> (nix::pty::PtyMaster, SerialConnection) {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).expect("posix_openpt");
        grantpt(&master).expect("grantpt");
        unlockpt(&master).expect("unlockpt");
        let path = ptsname_r(&master).expect("ptsname_r");

        let slave = open(
            path.as_str(),
            OFlags::RDWR | OFlags::NOCTTY,
            Mode::empty(),
        )
        .expect("open pty slave");
        // A fresh pty line is canonical; the framing tests need raw mode.
        settings::apply(slave.as_fd(), &TerminalSettings::default()).expect("raw mode");

        (master, SerialConnection::from_fd(identity(&path), slave))
    }

    fn master_write(master: &nix::pty::PtyMaster, data: &[u8]) {
        rustix::io::write(master, data).expect("master write");
    }

    #[test]
    fn test_open_empty_path_fails() {
        let mut connection = SerialConnection::new(identity(""));
        assert!(matches!(
            connection.open(true, true),
            Err(PortError::InvalidPath)
        ));
        assert!(!connection.is_open());
    }

    #[test]
    fn test_open_requires_receive_or_transmit() {
        let mut connection = SerialConnection::new(identity("/dev/null"));
        assert!(matches!(
            connection.open(false, false),
            Err(PortError::MustReceiveOrTransmit)
        ));
        assert!(!connection.is_open());
    }

    #[test]
    fn test_open_missing_device_fails() {
        let mut connection = SerialConnection::new(identity("/dev/ttyUSB-does-not-exist"));
        assert!(matches!(
            connection.open(true, true),
            Err(PortError::FailedToOpen { .. })
        ));
        assert!(!connection.is_open());
    }

    #[test]
    fn test_open_pty_by_path_and_close() {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
        grantpt(&master).unwrap();
        unlockpt(&master).unwrap();
        let path = ptsname_r(&master).unwrap();

        let mut connection = SerialConnection::new(identity(&path));
        connection.open(true, true).expect("open pty slave by path");
        assert!(connection.is_open());
        assert!(connection.is_fresh_session());

        connection.close();
        assert!(!connection.is_open());
        connection.close(); // idempotent

        let mut buf = [0u8; 1];
        assert!(matches!(
            connection.read_bytes(&mut buf),
            Err(PortError::MustBeOpen)
        ));
        assert!(matches!(
            connection.write_bytes(b"x"),
            Err(PortError::MustBeOpen)
        ));
    }

    #[test]
    fn test_configure_closed_is_noop() {
        let connection = SerialConnection::new(identity("/dev/ttyUSB0"));
        assert!(matches!(
            connection.configure(&TerminalSettings::default()),
            Ok(false)
        ));
    }

    #[test]
    fn test_configure_open_applies() {
        let (_master, connection) = pty_connection();
        assert!(matches!(
            connection.configure(&TerminalSettings::default()),
            Ok(true)
        ));
    }

    #[test]
    fn test_write_returns_byte_count() {
        let (master, connection) = pty_connection();
        assert_eq!(connection.write_str("hello").unwrap(), 5);

        let mut echo = [0u8; 5];
        rustix::io::read(&master, &mut echo).unwrap();
        assert_eq!(&echo, b"hello");
    }

    #[test]
    fn test_read_data_round_trip() {
        let (master, connection) = pty_connection();
        master_write(&master, b"hello");
        assert_eq!(connection.read_data(5).unwrap(), b"hello");
    }

    #[test]
    fn test_read_until_byte_excludes_terminator_and_retains_rest() {
        let (master, connection) = pty_connection();
        master_write(&master, b"AB\rCD");

        assert_eq!(connection.read_cr_line().unwrap(), "AB");
        // "CD" stays buffered for the next read
        assert_eq!(connection.read_data(2).unwrap(), b"CD");
    }

    #[test]
    fn test_read_until_byte_rejects_high_byte() {
        let (master, connection) = pty_connection();
        master_write(&master, &[b'A', 0xC3, b'\r']);

        assert!(matches!(
            connection.read_cr_line(),
            Err(PortError::UnableToConvertByteToCharacter)
        ));
    }

    #[test]
    fn test_read_until_eof_on_pipe() {
        let (reader, writer) = nix::unistd::pipe().expect("pipe");
        let connection = SerialConnection::from_fd(identity("pipe"), reader);

        rustix::io::write(&writer, b"done").unwrap();
        drop(writer);

        assert_eq!(connection.read_until_eof().unwrap(), "done");
    }

    #[test]
    fn test_read_string_truncates_on_decode_failure() {
        let (master, connection) = pty_connection();

        master_write(&master, b"Hi");
        assert_eq!(connection.read_string(2).unwrap(), "Hi");

        master_write(&master, &[0xFF]);
        assert_eq!(connection.read_string(1).unwrap(), "");
    }

    #[test]
    fn test_read_byte_and_char() {
        let (master, connection) = pty_connection();

        master_write(&master, b"Z");
        assert_eq!(connection.read_byte().unwrap(), b'Z');

        master_write(&master, &[0xE9]);
        assert_eq!(connection.read_char().unwrap(), 'é');
    }

    #[tokio::test]
    async fn test_watch_emits_cr_framed_lines() {
        let (master, mut connection) = pty_connection();
        let mut rx = connection.subscribe();
        connection.start_watch();

        master_write(&master, b"ping\rpong\rrest");

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("first line")
            .unwrap();
        assert_eq!(first, "ping");

        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("second line")
            .unwrap();
        assert_eq!(second, "pong");

        assert!(!connection.is_fresh_session());

        connection.close();
        assert!(!connection.is_open());
        assert!(connection.is_fresh_session());
    }

    #[test]
    fn test_unlinked_node_reads_as_disconnected() {
        let path = std::env::temp_dir().join(format!("usbserial-nlink-{}", std::process::id()));
        let fd = open(
            &path,
            OFlags::RDWR | OFlags::CREATE,
            Mode::RUSR | Mode::WUSR,
        )
        .expect("create temp node");
        std::fs::remove_file(&path).expect("unlink temp node");
        let connection = SerialConnection::from_fd(identity("unlinked"), fd);

        let mut buf = [0u8; 1];
        assert!(matches!(
            connection.read_bytes(&mut buf),
            Err(PortError::DeviceNotConnected)
        ));
    }

    #[test]
    fn test_long_transmission_spans_multiple_chunks() {
        let (master, connection) = pty_connection();
        let payload: Vec<u8> = (0..4096u32).map(|i| b'a' + (i % 26) as u8).collect();
        let expected: String = payload.iter().map(|&b| char::from(b)).collect();

        // The kernel tty buffer is smaller than the payload; keep writing
        // from a second thread while the foreground read drains the line.
        let writer = thread::spawn(move || {
            let mut rest: &[u8] = &payload;
            while !rest.is_empty() {
                let written = rustix::io::write(&master, rest).expect("master write");
                rest = &rest[written..];
            }
            rustix::io::write(&master, b"\r").expect("terminator write");
            master
        });

        let line = connection.read_cr_line().unwrap();
        assert_eq!(line.len(), 4096);
        assert_eq!(line, expected);
        let _master = writer.join().expect("writer thread");
    }

    #[test]
    fn test_read_byte_errors_after_hangup() {
        let (reader, writer) = nix::unistd::pipe().expect("pipe");
        let connection = SerialConnection::from_fd(identity("pipe"), reader);
        drop(writer);

        assert!(matches!(
            connection.read_byte(),
            Err(PortError::DeviceNotConnected)
        ));
    }

    #[test]
    fn test_watch_defers_fd_reads_to_framing_lock_holder() {
        let (master, mut connection) = pty_connection();
        let mut rx = connection.subscribe();
        connection.start_watch();
        // let the watch park in its poll wait
        thread::sleep(Duration::from_millis(50));

        {
            let _guard = connection.shared.buffer.lock().unwrap();
            master_write(&master, b"held\r");
            // spans two watch poll intervals
            thread::sleep(Duration::from_millis(500));
            assert!(
                rx.try_recv().is_err(),
                "watch must not pull fd bytes past the framing lock"
            );
        }

        let line = rx.blocking_recv().expect("line after lock release");
        assert_eq!(line, "held");
        connection.close();
    }

    #[tokio::test]
    async fn test_watch_reports_read_errors_as_events() {
        let (master, mut connection) = pty_connection();
        let mut rx = connection.subscribe();
        connection.start_watch();

        master_write(&master, &[0xC3, b'\r']);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("error event")
            .unwrap();
        assert!(event.starts_with("Error:"), "got: {event}");

        connection.close();
    }
}
