//! The controller facade used by every collaborator.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::command::Command;
use crate::config::DeviceConfig;
use crate::connection::{ConnectionManager, ConnectionState, Disconnected};
use crate::error::{Error, Result};
use crate::firmata;
use crate::link::Link;
use crate::pins::{ANALOG_PINS, PWM_PINS};
use crate::response::{Response, ResponseReader};
use crate::sampler::{self, SampleTable, SynchronousSampler};
use crate::switch::{SwitchController, SwitchState};
use crate::transport::{Connector, SerialConnector};

/// Structured outcome of [`DeviceController::serial_write`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteResult {
    pub success: bool,
    pub data: Value,
    pub info: Option<String>,
}

impl WriteResult {
    fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            info: None,
        }
    }

    fn failed(data: Value, info: String) -> Self {
        Self {
            success: false,
            data,
            info: Some(info),
        }
    }
}

/// Owns the connection plus the process-wide board state (switch routing and
/// cached analog values), both reset on every successful connect.
pub struct DeviceController {
    connection: ConnectionManager,
    sampler: SynchronousSampler,
    switch: SwitchController,
    reply_timeout: Duration,
}

impl DeviceController {
    pub fn new(config: DeviceConfig, connector: Box<dyn Connector>) -> Self {
        let table = Arc::new(SampleTable::new());
        let sampler = SynchronousSampler::new(
            Arc::clone(&table),
            config.sample_timeout(),
            config.sample_granularity(),
        );
        let reply_timeout = config.reply_timeout();
        Self {
            connection: ConnectionManager::new(config, connector, table),
            sampler,
            switch: SwitchController::new(),
            reply_timeout,
        }
    }

    /// A controller for a real serial port.
    pub fn serial(config: DeviceConfig) -> Self {
        Self::new(config, Box::new(SerialConnector))
    }

    pub fn config(&self) -> &DeviceConfig {
        self.connection.config()
    }

    pub fn connection_state(&mut self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&mut self) -> bool {
        self.connection.is_connected()
    }

    pub fn switch_state(&self) -> SwitchState {
        self.switch.state()
    }

    /// Last cached value of an analog pin, from either report kind.
    pub fn latest(&self, pin: u8) -> Option<f64> {
        self.sampler.table().latest(pin)
    }

    /// Connects and brings the board to known defaults.
    pub fn connect(&mut self) -> Result<()> {
        if self.connection.is_connected() {
            return Ok(());
        }
        self.sampler.table().reset();
        self.switch.forget();
        self.connection.connect()?;
        self.apply_defaults();
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<Disconnected> {
        let result = self.connection.disconnect();
        self.switch.forget();
        result
    }

    pub fn reconnect(&mut self) -> Result<()> {
        self.disconnect()?;
        self.connect()
    }

    // Follow-ups of a successful connect; a board that answered the handshake
    // but fails these is still usable, so failures are only logged.
    fn apply_defaults(&mut self) {
        let link = match self.connection.link() {
            Ok(link) => link,
            Err(_) => return,
        };
        if let Err(e) = self.switch.init(&link) {
            warn!(error = %e, "could not initialise switch pins");
        }
        if self.config().zero_outputs_on_connect {
            let zeros = vec![0; PWM_PINS.len()];
            if let Err(e) = self.write("vset", &[json!(PWM_PINS), json!(zeros), json!(0)]) {
                warn!(error = %e, "could not zero outputs");
            }
        }
        if !self.config().verbose {
            if let Err(e) = self.write("verbose", &[json!(0)]) {
                warn!(error = %e, "could not disable verbose output");
            }
        }
    }

    /// Validates, encodes and sends a line-protocol command, then reads one
    /// reply per emitted line-group.
    ///
    /// Nothing is written unless connected and the parameters validate.
    pub fn write(&mut self, command: &str, params: &[Value]) -> Result<Vec<Response>> {
        let link = self.connection.link()?;
        let command = Command::parse(command, params)?;
        let result = self.transact(&link, &command);
        self.settle(result)
    }

    fn transact(&self, link: &Link, command: &Command) -> Result<Vec<Response>> {
        let groups = command.encode();
        debug!(command = command.name(), groups = groups.len(), "write");
        link.discard_lines();
        // Groups go out one by one; a failure part way does not undo the
        // groups already sent.
        for group in &groups {
            link.send(group)?;
        }
        let collected = ResponseReader::new(link, groups.len(), self.reply_timeout).collect_all()?;
        if collected.is_complete() {
            return Ok(collected.responses);
        }
        Err(Error::ReadTimeout {
            expected: collected.expected,
            received: collected.responses,
            partial: collected.timed_out.unwrap_or_default(),
        })
    }

    /// Fresh reading of `pins`, `None` if the board did not answer in time.
    pub fn sample(&mut self, pins: &[u8]) -> Result<Option<Vec<f64>>> {
        let link = self.connection.link()?;
        let result = self.sampler.read(&link, pins);
        self.settle(result)
    }

    /// Steps `out_pins` through `steps` and samples `in_pins` after each step.
    ///
    /// A step is one `vset` of every output with `settling_ms` applied once,
    /// after the last output changed; the sample is requested only once the
    /// board has answered the step. A reading is `None` where no sample came
    /// back in time.
    ///
    /// Every step and input pin is validated before the first write.
    pub fn sweep(
        &mut self,
        out_pins: &[u8],
        in_pins: &[u8],
        steps: &[Vec<u8>],
        settling_ms: u16,
    ) -> Result<Vec<Option<Vec<f64>>>> {
        let steps: Vec<Value> = steps.iter().map(|values| json!(values)).collect();
        self.run_sweep(&json!(out_pins), in_pins, &steps, &json!(settling_ms))
    }

    fn run_sweep(
        &mut self,
        out_pins: &Value,
        in_pins: &[u8],
        steps: &[Value],
        settling: &Value,
    ) -> Result<Vec<Option<Vec<f64>>>> {
        let link = self.connection.link()?;
        sampler::check_pins(in_pins)?;
        let commands = steps
            .iter()
            .map(|values| {
                Command::parse("vset", &[out_pins.clone(), values.clone(), settling.clone()])
            })
            .collect::<Result<Vec<_>>>()?;

        let mut readings = Vec::with_capacity(commands.len());
        for (step, command) in commands.iter().enumerate() {
            let result = self
                .transact(&link, command)
                .and_then(|_| self.sampler.read(&link, in_pins));
            let reading = self.settle(result)?;
            debug!(step, ?reading, "sweep step");
            readings.push(reading);
        }
        Ok(readings)
    }

    pub fn set_switch(&mut self, state: SwitchState) -> Result<()> {
        let link = self.connection.link()?;
        let result = self.switch.set(&link, state);
        self.settle(result)
    }

    pub fn flip(&mut self) -> Result<SwitchState> {
        let link = self.connection.link()?;
        let result = self.switch.flip(&link);
        self.settle(result)
    }

    pub fn pulse(&mut self, state: SwitchState, duration: Duration) -> Result<()> {
        let link = self.connection.link()?;
        let result = self.switch.pulse(&link, state, duration);
        self.settle(result)
    }

    /// Turns on periodic reports of every analog pin at `interval_ms`.
    pub fn enable_reporting(&mut self, interval_ms: u16) -> Result<()> {
        let link = self.connection.link()?;
        let mut bytes = Vec::new();
        for &pin in ANALOG_PINS {
            bytes.extend(firmata::report_analog(pin, true));
        }
        bytes.extend(firmata::sampling_interval(interval_ms));
        let result = link.send(&bytes).map_err(Error::from);
        self.settle(result)
    }

    // I/O failures leave the link unusable.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::Io(_)) = &result {
            self.connection.mark_faulted();
        }
        result
    }

    /// Collaborator entry point: never fails, always answers with a
    /// [`WriteResult`].
    ///
    /// Besides the line-protocol commands it accepts `sample [pins]`,
    /// `switch state [duration_ms]`, `flip`, `reporting [interval_ms]` and
    /// `sweep out_pins in_pins steps settling_ms`.
    pub fn serial_write(&mut self, command: &str, params: &[Value]) -> WriteResult {
        let outcome = match command {
            "sample" => self.sample_request(params),
            "switch" => self.switch_request(params),
            "flip" => expect_params("flip", params, 0)
                .and_then(|_| self.flip())
                .map(|state| json!(state.to_string())),
            "reporting" => self.reporting_request(params),
            "sweep" => self.sweep_request(params),
            _ => self.write(command, params).map(|responses| json!(responses)),
        };
        match outcome {
            Ok(data) => WriteResult::ok(data),
            Err(Error::ReadTimeout {
                expected,
                received,
                partial,
            }) => {
                let info = format!(
                    "Timeout expired after {} of {} replies",
                    received.len(),
                    expected
                );
                warn!("ERROR {}", info);
                let mut data = received;
                data.push(partial);
                WriteResult::failed(json!(data), info)
            }
            Err(e) => {
                warn!("ERROR {}", e);
                WriteResult::failed(Value::Null, e.to_string())
            }
        }
    }

    fn sample_request(&mut self, params: &[Value]) -> Result<Value> {
        expect_params("sample", params, 1)?;
        let pins = pin_params("sample", &params[0])?;
        Ok(match self.sample(&pins)? {
            Some(values) => json!(values),
            None => Value::Null,
        })
    }

    fn sweep_request(&mut self, params: &[Value]) -> Result<Value> {
        expect_params("sweep", params, 4)?;
        let in_pins = pin_params("sweep", &params[1])?;
        let steps = params[2].as_array().ok_or_else(|| Error::InvalidParam {
            command: "sweep",
            reason: "steps must be a list of value lists".to_string(),
        })?;
        let readings = self.run_sweep(&params[0], &in_pins, steps, &params[3])?;
        Ok(json!(readings))
    }

    // Without a parameter the configured interval applies.
    fn reporting_request(&mut self, params: &[Value]) -> Result<Value> {
        let interval_ms = match params {
            [] => self.config().reporting_interval_ms,
            [ms] => integer("reporting", ms, u16::MAX as u64)? as u16,
            _ => {
                return Err(Error::ArityMismatch {
                    command: "reporting",
                    expected: 1,
                    got: params.len(),
                })
            }
        };
        self.enable_reporting(interval_ms)?;
        Ok(json!(interval_ms))
    }

    fn switch_request(&mut self, params: &[Value]) -> Result<Value> {
        // `0` may arrive as a number.
        let name = params.first().map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        let state: SwitchState = match name {
            Some(name) => name.parse()?,
            None => {
                return Err(Error::InvalidParam {
                    command: "switch",
                    reason: "expected a state name".to_string(),
                })
            }
        };
        match params.len() {
            1 => self.set_switch(state)?,
            2 => {
                let ms = integer("switch", &params[1], u32::MAX as u64)?;
                self.pulse(state, Duration::from_millis(ms))?
            }
            got => {
                return Err(Error::ArityMismatch {
                    command: "switch",
                    expected: 2,
                    got,
                })
            }
        }
        Ok(json!(self.switch.state().to_string()))
    }
}

fn expect_params(command: &'static str, params: &[Value], expected: usize) -> Result<()> {
    if params.len() == expected {
        Ok(())
    } else {
        Err(Error::ArityMismatch {
            command,
            expected,
            got: params.len(),
        })
    }
}

fn pin_params(command: &'static str, value: &Value) -> Result<Vec<u8>> {
    value
        .as_array()
        .ok_or_else(|| Error::InvalidParam {
            command,
            reason: "pins must be a list".to_string(),
        })?
        .iter()
        .map(|p| {
            p.as_u64()
                .and_then(|pin| u8::try_from(pin).ok())
                .ok_or_else(|| Error::Pin {
                    command,
                    pin: p.to_string(),
                    valid: ANALOG_PINS,
                })
        })
        .collect()
}

fn integer(command: &'static str, value: &Value, max: u64) -> Result<u64> {
    match value.as_u64() {
        Some(v) if v <= max => Ok(v),
        _ => Err(Error::InvalidParam {
            command,
            reason: format!("{} is not an integer in 0-{}", value, max),
        }),
    }
}
