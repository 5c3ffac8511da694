//! A connected transport shared between the caller and the report poller.
//!
//! All bytes go out through [`Link::send`] and all bytes come in through
//! [`Link::poll_once`], each behind the port lock, so command lines from
//! different writers never interleave. Inbound traffic is split into protocol
//! lines (queued for the response reader) and Firmata reports (applied to the
//! [`SampleTable`] straight away).

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::PollMode;
use crate::firmata::{self, Inbound, InboundParser};
use crate::response::LineSource;
use crate::sampler::SampleTable;
use crate::transport::Transport;

const MAX_QUEUED_LINES: usize = 1024;

#[derive(Default)]
struct InboundQueue {
    parser: InboundParser,
    lines: VecDeque<String>,
}

pub struct Link {
    port: Mutex<Box<dyn Transport>>,
    inbound: Mutex<InboundQueue>,
    line_ready: Condvar,
    table: Arc<SampleTable>,
    mode: PollMode,
    faulted: AtomicBool,
}

impl Link {
    pub fn new(port: Box<dyn Transport>, table: Arc<SampleTable>, mode: PollMode) -> Self {
        Self {
            port: Mutex::new(port),
            inbound: Mutex::new(InboundQueue::default()),
            line_ready: Condvar::new(),
            table,
            mode,
            faulted: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> PollMode {
        self.mode
    }

    /// True once any read or write on the transport has failed.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
        trace!(len = bytes.len(), "tx");
        let result = self.port.lock().send(bytes);
        result.map_err(|e| self.fault(e))
    }

    /// Performs one read from the transport and dispatches what arrived.
    ///
    /// Returns the number of bytes read; 0 means the read timed out.
    pub fn poll_once(&self) -> io::Result<usize> {
        let mut buf = [0u8; 256];
        let n = {
            let mut port = self.port.lock();
            port.recv(&mut buf)
        }
        .map_err(|e| self.fault(e))?;
        if n == 0 {
            return Ok(0);
        }

        let mut units = Vec::new();
        let mut inbound = self.inbound.lock();
        inbound.parser.feed(&buf[..n], &mut units);
        let mut got_line = false;
        for unit in units {
            match unit {
                Inbound::Line(line) => {
                    trace!(%line, "rx line");
                    if inbound.lines.len() >= MAX_QUEUED_LINES {
                        warn!("inbound line queue full, dropping oldest line");
                        inbound.lines.pop_front();
                    }
                    inbound.lines.push_back(line);
                    got_line = true;
                }
                Inbound::Analog { pin, value } => self.table.record_periodic(pin, value),
                Inbound::Sysex { command, data }
                    if command == firmata::REPORT_ANALOG_NOW_RESPONSE =>
                {
                    self.table.record_ack(&firmata::decode_report_now(&data));
                }
                other => trace!(?other, "ignored inbound message"),
            }
        }
        if got_line {
            self.line_ready.notify_all();
        }
        Ok(n)
    }

    /// Next protocol line, waiting at most `timeout`.
    ///
    /// In manual mode the wait itself drives [`Link::poll_once`]; in
    /// background mode it waits for the poller to queue a line.
    pub fn next_line(&self, timeout: Duration) -> io::Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        match self.mode {
            PollMode::Background => {
                let mut inbound = self.inbound.lock();
                loop {
                    if let Some(line) = inbound.lines.pop_front() {
                        return Ok(Some(line));
                    }
                    if self.is_faulted() {
                        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link faulted"));
                    }
                    if self.line_ready.wait_until(&mut inbound, deadline).timed_out() {
                        return Ok(inbound.lines.pop_front());
                    }
                }
            }
            PollMode::Manual => loop {
                if let Some(line) = self.inbound.lock().lines.pop_front() {
                    return Ok(Some(line));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                self.poll_once()?;
            },
        }
    }

    /// Drops queued lines nobody asked for.
    pub fn discard_lines(&self) {
        let mut inbound = self.inbound.lock();
        if !inbound.lines.is_empty() {
            debug!(count = inbound.lines.len(), "discarding unsolicited lines");
            inbound.lines.clear();
        }
    }

    fn fault(&self, e: io::Error) -> io::Error {
        if !self.faulted.swap(true, Ordering::AcqRel) {
            warn!(error = %e, "serial link failed");
        }
        self.line_ready.notify_all();
        e
    }
}

impl LineSource for &Link {
    fn next_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        Link::next_line(*self, timeout)
    }
}

/// Background thread draining the link until stopped or the link fails.
pub struct Poller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn spawn(link: Arc<Link>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("board-poller".to_string())
            .spawn(move || {
                debug!("poller started");
                while !flag.load(Ordering::Acquire) {
                    if let Err(e) = link.poll_once() {
                        warn!(error = %e, "poller stopped on link error");
                        break;
                    }
                }
                debug!("poller stopped");
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("poller thread panicked");
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
