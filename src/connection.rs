//! Connection lifecycle: open, handshake, steady state, reset, close.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, PollMode};
use crate::error::{Error, Result};
use crate::firmata;
use crate::link::{Link, Poller};
use crate::sampler::SampleTable;
use crate::transport::{Connector, Transport};

const HANDSHAKE_PROBE: &[u8] = b"comtest\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful `disconnect()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnected {
    Closed,
    AlreadyDisconnected,
}

/// Sole owner of the transport.
pub struct ConnectionManager {
    config: DeviceConfig,
    connector: Box<dyn Connector>,
    table: Arc<SampleTable>,
    state: ConnectionState,
    link: Option<Arc<Link>>,
    poller: Option<Poller>,
}

impl ConnectionManager {
    pub fn new(
        config: DeviceConfig,
        connector: Box<dyn Connector>,
        table: Arc<SampleTable>,
    ) -> Self {
        Self {
            config,
            connector,
            table,
            state: ConnectionState::Disconnected,
            link: None,
            poller: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Current state. A link that failed underneath is reported (and torn
    /// down) as `Disconnected`.
    pub fn state(&mut self) -> ConnectionState {
        if self.link.as_ref().map_or(false, |link| link.is_faulted()) {
            self.mark_faulted();
        }
        self.state
    }

    pub fn is_connected(&mut self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The live link, or `NotConnected`.
    pub fn link(&mut self) -> Result<Arc<Link>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.link.clone().ok_or(Error::NotConnected)
    }

    /// Opens the port and waits for the board to answer a `comtest` probe.
    ///
    /// Any failure leaves the manager `Disconnected` with the port closed.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            debug!(port = %self.config.port, "already connected");
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        let port = self.config.port.clone();
        info!(%port, baud = self.config.baud_rate, "connecting");

        let opened = self
            .connector
            .open(&port, self.config.baud_rate, self.config.probe_interval());
        let mut transport = match opened {
            Ok(transport) => transport,
            Err(source) => {
                self.state = ConnectionState::Disconnected;
                warn!(%port, error = %source, "open failed");
                return Err(Error::ConnectIo { port, source });
            }
        };

        let settled = handshake(transport.as_mut(), &self.config).and_then(|answered| {
            if answered {
                transport.clear_input()?;
                transport.set_timeout(self.config.poll_interval())?;
            }
            Ok(answered)
        });
        match settled {
            Ok(true) => {}
            Ok(false) => {
                drop(transport);
                self.state = ConnectionState::Disconnected;
                warn!(%port, "no handshake reply");
                return Err(Error::ConnectTimeout {
                    port,
                    timeout: self.config.handshake_timeout(),
                });
            }
            Err(e) => {
                drop(transport);
                self.state = ConnectionState::Disconnected;
                warn!(%port, error = %e, "handshake failed");
                return Err(Error::Io(e));
            }
        }

        let link = Arc::new(Link::new(transport, Arc::clone(&self.table), self.config.poll_mode));
        if self.config.poll_mode == PollMode::Background {
            match Poller::spawn(Arc::clone(&link)) {
                Ok(poller) => self.poller = Some(poller),
                Err(e) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(Error::Io(e));
                }
            }
        }
        self.link = Some(link);
        self.state = ConnectionState::Connected;
        info!(%port, "connected");
        Ok(())
    }

    /// Resets the board and closes the port. Idempotent.
    pub fn disconnect(&mut self) -> Result<Disconnected> {
        if self.state() != ConnectionState::Connected {
            return Ok(Disconnected::AlreadyDisconnected);
        }
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        if let Some(link) = self.link.take() {
            if let Err(e) = link.send(&[firmata::SYSTEM_RESET]) {
                warn!(error = %e, "reset before close failed");
            }
        }
        self.state = ConnectionState::Disconnected;
        info!(port = %self.config.port, "disconnected");
        Ok(Disconnected::Closed)
    }

    pub fn reconnect(&mut self) -> Result<()> {
        self.disconnect()?;
        self.connect()
    }

    /// Drops a link that failed while connected.
    pub fn mark_faulted(&mut self) {
        if self.link.is_none() && self.state == ConnectionState::Disconnected {
            return;
        }
        warn!(port = %self.config.port, "link fault, now disconnected");
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        self.link = None;
        self.state = ConnectionState::Disconnected;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Probes with `comtest` every probe interval until a non-empty line comes
/// back or the handshake timeout runs out.
fn handshake(transport: &mut dyn Transport, config: &DeviceConfig) -> std::io::Result<bool> {
    let deadline = Instant::now() + config.handshake_timeout();
    while Instant::now() < deadline {
        transport.send(HANDSHAKE_PROBE)?;
        let attempt_end = (Instant::now() + config.probe_interval()).min(deadline);
        if let Some(line) = read_line(transport, attempt_end)? {
            debug!(%line, "handshake reply");
            return Ok(true);
        }
        let now = Instant::now();
        if now < attempt_end {
            thread::sleep(attempt_end - now);
        }
    }
    Ok(false)
}

/// Reads one non-empty text line, giving up at `until`.
fn read_line(transport: &mut dyn Transport, until: Instant) -> std::io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while Instant::now() < until {
        if transport.recv(&mut byte)? == 0 {
            continue;
        }
        match byte[0] {
            b'\n' => {
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if !text.is_empty() {
                    return Ok(Some(text));
                }
                line.clear();
            }
            b if b & 0x80 == 0 => line.push(b),
            _ => {}
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{BoardSimulator, SimConnector};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn fast_config() -> DeviceConfig {
        DeviceConfig {
            port: "sim0".to_string(),
            handshake_timeout_ms: 300,
            probe_interval_ms: 50,
            ..DeviceConfig::default()
        }
    }

    fn manager(config: DeviceConfig) -> (Arc<Mutex<BoardSimulator>>, ConnectionManager) {
        let board = Arc::new(Mutex::new(BoardSimulator::new()));
        let connector = SimConnector::new(Arc::clone(&board));
        let table = Arc::new(SampleTable::new());
        let manager = ConnectionManager::new(config, Box::new(connector), table);
        (board, manager)
    }

    #[test]
    fn connect_performs_handshake() {
        let (board, mut conn) = manager(fast_config());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.connect().unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(board.lock().received().starts_with(b"comtest\n"));
        assert!(conn.link().is_ok());
    }

    #[test]
    fn silent_board_times_out_and_stays_disconnected() {
        let (board, mut conn) = manager(fast_config());
        board.lock().set_silent(true);
        let started = Instant::now();
        let err = conn.connect().unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout { ref port, .. } if port == "sim0"));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(conn.link(), Err(Error::NotConnected)));
        // Probed more than once.
        let probes = board.lock().received().windows(8).filter(|w| *w == b"comtest\n").count();
        assert!(probes > 1);
    }

    #[test]
    fn open_failure_is_reported() {
        let (board, mut conn) = manager(fast_config());
        board.lock().set_unplugged(true);
        let err = conn.connect().unwrap_err();
        assert!(matches!(err, Error::ConnectIo { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn disconnect_resets_board_and_is_idempotent() {
        let (board, mut conn) = manager(fast_config());
        conn.connect().unwrap();
        assert_eq!(conn.disconnect().unwrap(), Disconnected::Closed);
        assert_eq!(board.lock().reset_count(), 1);
        assert_eq!(conn.disconnect().unwrap(), Disconnected::AlreadyDisconnected);
        assert_eq!(board.lock().reset_count(), 1);
    }

    #[test]
    fn reconnect_cycles_the_link() {
        let (board, mut conn) = manager(fast_config());
        conn.connect().unwrap();
        conn.reconnect().unwrap();
        assert!(conn.is_connected());
        assert_eq!(board.lock().reset_count(), 1);
    }

    #[test]
    fn link_fault_forces_disconnected() {
        let (board, mut conn) = manager(fast_config());
        conn.connect().unwrap();
        let link = conn.link().unwrap();
        board.lock().set_faulty(true);
        assert!(link.send(b"comtest\n").is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(conn.link(), Err(Error::NotConnected)));
    }

    #[test]
    fn background_mode_runs_a_poller() {
        let config = DeviceConfig {
            poll_mode: PollMode::Background,
            ..fast_config()
        };
        let (_board, mut conn) = manager(config);
        conn.connect().unwrap();
        assert!(conn.poller.is_some());
        conn.disconnect().unwrap();
        assert!(conn.poller.is_none());
    }
}
