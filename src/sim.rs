//! # Board simulator
//!
//! Emulates the analog I/O board firmware closely enough to run the whole
//! controller without hardware. It understands the line protocol
//! (`comtest`, `vset`, `vread`, `verbose`) and the Firmata messages the
//! controller sends (immediate analog report, sampling interval, pin modes,
//! digital port writes, analog reporting, system reset), and answers the
//! same way the real firmware does.
//!
//! Analog inputs 0-3 are looped back from PWM outputs 3, 9, 10 and 11
//! (`value * 4`) unless a test overrides them with
//! [`BoardSimulator::set_analog_input`].

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::command::{Command, GroupAssembler};
use crate::firmata::{self, Inbound, InboundParser};
use crate::pins::{PWM_PINS, SWITCH_PINS};
use crate::response::{FRAME_READY, FRAME_START};
use crate::transport::{Connector, Transport};

// The main struct that holds the state of the simulated board.
#[derive(Debug)]
pub struct BoardSimulator {
    parser: InboundParser,
    groups: GroupAssembler,
    outbound: VecDeque<u8>,
    received: Vec<u8>,
    // PWM duty per digital pin.
    pwm: [u8; 14],
    analog: [u16; 6],
    analog_fixed: [bool; 6],
    pin_modes: [u8; 14],
    port0: u8,
    verbose: bool,
    reporting: [bool; 6],
    sampling_interval: Duration,
    last_report: Option<Instant>,
    resets: usize,
    // --- Fault injection ---
    silent: bool,
    faulty: bool,
    unplugged: bool,
}

impl Default for BoardSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl BoardSimulator {
    pub fn new() -> Self {
        Self {
            parser: InboundParser::new(),
            groups: GroupAssembler::default(),
            outbound: VecDeque::new(),
            received: Vec::new(),
            pwm: [0; 14],
            analog: [0; 6],
            analog_fixed: [false; 6],
            pin_modes: [0; 14],
            port0: 0,
            verbose: true,
            reporting: [false; 6],
            sampling_interval: Duration::from_millis(19),
            last_report: None,
            resets: 0,
            silent: false,
            faulty: false,
            unplugged: false,
        }
    }

    /// Every byte the board has received so far.
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    pub fn clear_received(&mut self) {
        self.received.clear();
    }

    pub fn pwm(&self, pin: u8) -> u8 {
        self.pwm.get(pin as usize).copied().unwrap_or(0)
    }

    pub fn pin_mode(&self, pin: u8) -> u8 {
        self.pin_modes.get(pin as usize).copied().unwrap_or(0)
    }

    /// Levels of the four switch control lines, in logical order.
    pub fn switch_lines(&self) -> [bool; 4] {
        SWITCH_PINS.map(|pin| self.port0 & (1 << pin) != 0)
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_reporting(&self, pin: u8) -> bool {
        self.reporting.get(pin as usize).copied().unwrap_or(false)
    }

    pub fn sampling_interval(&self) -> Duration {
        self.sampling_interval
    }

    pub fn reset_count(&self) -> usize {
        self.resets
    }

    /// Pins an analog input to a raw 10-bit reading.
    pub fn set_analog_input(&mut self, pin: u8, raw: u16) {
        if let Some(slot) = self.analog.get_mut(pin as usize) {
            *slot = raw.min(1023);
            self.analog_fixed[pin as usize] = true;
        }
    }

    /// A silent board still applies what it receives but never answers.
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// A faulty board fails every read and write on an open port.
    pub fn set_faulty(&mut self, faulty: bool) {
        self.faulty = faulty;
    }

    /// An unplugged board cannot be opened.
    pub fn set_unplugged(&mut self, unplugged: bool) {
        self.unplugged = unplugged;
    }

    /// Processes bytes written by the host.
    pub fn process(&mut self, bytes: &[u8]) {
        self.received.extend_from_slice(bytes);
        let mut units = Vec::new();
        self.parser.feed(bytes, &mut units);
        for unit in units {
            self.handle(unit);
        }
    }

    /// Moves pending output into `buf`, emitting due periodic reports first.
    pub fn drain(&mut self, buf: &mut [u8]) -> usize {
        self.tick(Instant::now());
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        n
    }

    fn tick(&mut self, now: Instant) {
        if !self.reporting.contains(&true) {
            return;
        }
        let due = self
            .last_report
            .map_or(true, |last| now.duration_since(last) >= self.sampling_interval);
        if !due {
            return;
        }
        self.last_report = Some(now);
        for pin in 0..6u8 {
            if self.reporting[pin as usize] {
                let raw = self.analog[pin as usize];
                self.emit(&[firmata::ANALOG_MESSAGE | pin, (raw & 0x7F) as u8, (raw >> 7) as u8]);
            }
        }
    }

    fn emit(&mut self, bytes: &[u8]) {
        if !self.silent {
            self.outbound.extend(bytes);
        }
    }

    fn frame(&mut self, data: &[String]) {
        let mut reply = format!("{}\n", FRAME_START);
        for line in data {
            reply.push_str(line);
            reply.push('\n');
        }
        reply.push_str(FRAME_READY);
        reply.push('\n');
        self.emit(reply.as_bytes());
    }

    fn handle(&mut self, unit: Inbound) {
        match unit {
            Inbound::Line(line) => match self.groups.push(&line) {
                Some(Ok(command)) => self.execute(command),
                Some(Err(e)) => self.frame(&[format!("ERROR: {}", e)]),
                None => {}
            },
            Inbound::Sysex { command, data } => self.handle_sysex(command, &data),
            Inbound::Digital { port: 0, mask } => self.port0 = mask,
            Inbound::PinMode { pin, mode } => {
                if let Some(slot) = self.pin_modes.get_mut(pin as usize) {
                    *slot = mode;
                }
            }
            Inbound::ReportAnalog { pin, enable } => {
                if let Some(slot) = self.reporting.get_mut(pin as usize) {
                    *slot = enable;
                }
            }
            Inbound::Reset => self.reset(),
            _ => {}
        }
    }

    fn handle_sysex(&mut self, command: u8, data: &[u8]) {
        match command {
            firmata::REPORT_ANALOG_NOW_QUERY => {
                let mask = data.first().copied().unwrap_or(0);
                let mut triples = Vec::new();
                for pin in 0..6u8 {
                    if mask & (1 << pin) != 0 {
                        let raw = self.analog[pin as usize];
                        triples.extend([pin, (raw & 0x7F) as u8, (raw >> 7) as u8]);
                    }
                }
                let reply = firmata::sysex(firmata::REPORT_ANALOG_NOW_RESPONSE, &triples);
                self.emit(&reply);
            }
            firmata::SAMPLING_INTERVAL if data.len() >= 2 => {
                let millis = data[0] as u64 + ((data[1] as u64) << 7);
                self.sampling_interval = Duration::from_millis(millis);
            }
            _ => {}
        }
    }

    /// Executes a decoded line-group and queues its reply frame.
    fn execute(&mut self, command: Command) {
        match command {
            Command::Comtest => self.frame(&["comtest".to_string()]),
            Command::Vset {
                pins,
                values,
                settling,
            } => {
                let mut data = Vec::new();
                for (&pin, &value) in pins.iter().zip(&values) {
                    self.pwm[pin as usize] = value;
                    if let Some(input) = PWM_PINS.iter().position(|&p| p == pin) {
                        if !self.analog_fixed[input] {
                            self.analog[input] = value as u16 * 4;
                        }
                    }
                    if self.verbose {
                        data.push(format!(
                            "vset pin={} value={} settling={}",
                            pin, value, settling
                        ));
                    }
                }
                self.frame(&data);
            }
            Command::Vread { pins } => {
                let data: Vec<String> = pins
                    .iter()
                    .map(|&pin| self.analog[pin as usize].to_string())
                    .collect();
                self.frame(&data);
            }
            Command::Verbose(on) => {
                self.verbose = on;
                self.frame(&[]);
            }
        }
    }

    fn reset(&mut self) {
        self.pwm = [0; 14];
        self.port0 = 0;
        self.pin_modes = [0; 14];
        self.reporting = [false; 6];
        self.verbose = true;
        self.groups = GroupAssembler::default();
        self.resets += 1;
    }
}

/// Transport end of a simulated board.
pub struct SimPort {
    board: Arc<Mutex<BoardSimulator>>,
    timeout: Duration,
}

impl SimPort {
    pub fn new(board: Arc<Mutex<BoardSimulator>>) -> Self {
        Self {
            board,
            timeout: Duration::from_millis(10),
        }
    }
}

fn fault() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "simulated board fault")
}

impl Transport for SimPort {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut board = self.board.lock();
        if board.faulty {
            return Err(fault());
        }
        board.process(bytes);
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        loop {
            {
                let mut board = self.board.lock();
                if board.faulty {
                    return Err(fault());
                }
                let n = board.drain(buf);
                if n > 0 {
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Ok(0);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.board.lock().outbound.clear();
        Ok(())
    }
}

/// Opens [`SimPort`]s onto one shared simulated board.
#[derive(Clone)]
pub struct SimConnector {
    board: Arc<Mutex<BoardSimulator>>,
}

impl SimConnector {
    pub fn new(board: Arc<Mutex<BoardSimulator>>) -> Self {
        Self { board }
    }
}

impl Connector for SimConnector {
    fn open(
        &self,
        port: &str,
        _baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, serialport::Error> {
        if self.board.lock().unplugged {
            return Err(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                format!("{}: no such device", port),
            ));
        }
        let mut sim = SimPort::new(Arc::clone(&self.board));
        sim.timeout = timeout;
        Ok(Box::new(sim))
    }
}
