//! The subset of Firmata the board firmware speaks next to the line protocol.
//!
//! Firmata bytes and protocol text share one serial stream. Firmata command
//! bytes always have the high bit set while ASCII text never does, so
//! [`InboundParser`] can split the stream into lines and Firmata messages.

pub const ANALOG_MESSAGE: u8 = 0xE0;
pub const DIGITAL_MESSAGE: u8 = 0x90;
pub const REPORT_ANALOG: u8 = 0xC0;
pub const REPORT_DIGITAL: u8 = 0xD0;
pub const SET_PIN_MODE: u8 = 0xF4;
pub const REPORT_VERSION: u8 = 0xF9;
pub const START_SYSEX: u8 = 0xF0;
pub const END_SYSEX: u8 = 0xF7;
pub const SYSTEM_RESET: u8 = 0xFF;

pub const SAMPLING_INTERVAL: u8 = 0x7A;
/// Vendor SysEx: request an immediate report of the analog pins in a mask.
pub const REPORT_ANALOG_NOW_QUERY: u8 = 0x01;
/// Vendor SysEx: reply to [`REPORT_ANALOG_NOW_QUERY`], `(pin, lsb, msb)` triples.
pub const REPORT_ANALOG_NOW_RESPONSE: u8 = 0x02;

pub const PIN_MODE_OUTPUT: u8 = 0x01;

/// Longest sampling interval representable in two 7-bit bytes.
pub const MAX_SAMPLING_INTERVAL_MS: u16 = 16383;

const MAX_SYSEX_LEN: usize = 256;

pub fn sysex(command: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 3);
    out.push(START_SYSEX);
    out.push(command & 0x7F);
    out.extend(data.iter().map(|b| b & 0x7F));
    out.push(END_SYSEX);
    out
}

pub fn report_analog_now_query(mask: u8) -> Vec<u8> {
    sysex(REPORT_ANALOG_NOW_QUERY, &[mask & 0x7F])
}

pub fn sampling_interval(millis: u16) -> Vec<u8> {
    let millis = millis.min(MAX_SAMPLING_INTERVAL_MS);
    sysex(SAMPLING_INTERVAL, &[(millis % 128) as u8, (millis >> 7) as u8])
}

pub fn report_analog(pin: u8, enable: bool) -> [u8; 2] {
    [REPORT_ANALOG | (pin & 0x0F), enable as u8]
}

pub fn set_pin_mode(pin: u8, mode: u8) -> [u8; 3] {
    [SET_PIN_MODE, pin & 0x7F, mode & 0x7F]
}

/// Writes all eight pins of a digital port at once.
pub fn digital_port(port: u8, mask: u8) -> [u8; 3] {
    [DIGITAL_MESSAGE | (port & 0x0F), mask & 0x7F, (mask >> 7) & 0x01]
}

/// Scales a 10-bit reading to 0..1, rounded to 4 decimals.
pub fn normalize(lsb: u8, msb: u8) -> f64 {
    let raw = ((msb as u32) << 7) + lsb as u32;
    (raw as f64 / 1023.0 * 10_000.0).round() / 10_000.0
}

/// Decodes the payload of a [`REPORT_ANALOG_NOW_RESPONSE`].
///
/// A trailing incomplete triple is ignored.
pub fn decode_report_now(data: &[u8]) -> Vec<(u8, f64)> {
    data.chunks_exact(3)
        .map(|t| (t[0], normalize(t[1], t[2])))
        .collect()
}

/// One unit of inbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A text line, without its terminator.
    Line(String),
    /// A periodic analog report.
    Analog { pin: u8, value: f64 },
    /// A digital port report.
    Digital { port: u8, mask: u8 },
    /// `SET_PIN_MODE` (only ever seen by a board).
    PinMode { pin: u8, mode: u8 },
    /// `REPORT_ANALOG` toggle (only ever seen by a board).
    ReportAnalog { pin: u8, enable: bool },
    Version { major: u8, minor: u8 },
    Sysex { command: u8, data: Vec<u8> },
    Reset,
}

#[derive(Debug, Default)]
enum ParseState {
    #[default]
    Text,
    /// A channel message waiting for `need` data bytes.
    Message { command: u8, need: usize, data: Vec<u8> },
    Sysex(Vec<u8>),
}

/// Byte-at-a-time splitter of the mixed text/Firmata stream.
#[derive(Debug, Default)]
pub struct InboundParser {
    state: ParseState,
    line: Vec<u8>,
}

impl InboundParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a buffer, appending completed units to `out`.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<Inbound>) {
        for &b in bytes {
            if let Some(unit) = self.push(b) {
                out.push(unit);
            }
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<Inbound> {
        match std::mem::take(&mut self.state) {
            ParseState::Sysex(mut data) => {
                if byte == END_SYSEX {
                    return match data.split_first() {
                        Some((&command, rest)) => Some(Inbound::Sysex {
                            command,
                            data: rest.to_vec(),
                        }),
                        None => None,
                    };
                }
                if byte & 0x80 != 0 {
                    // Unterminated SysEx; restart on the new command byte.
                    return self.command_byte(byte);
                }
                if data.len() < MAX_SYSEX_LEN {
                    data.push(byte);
                }
                self.state = ParseState::Sysex(data);
                None
            }
            ParseState::Message {
                command,
                need,
                mut data,
            } => {
                if byte & 0x80 != 0 {
                    return self.command_byte(byte);
                }
                data.push(byte);
                if data.len() < need {
                    self.state = ParseState::Message {
                        command,
                        need,
                        data,
                    };
                    return None;
                }
                Self::channel_message(command, &data)
            }
            ParseState::Text => {
                if byte & 0x80 != 0 {
                    return self.command_byte(byte);
                }
                match byte {
                    b'\n' => {
                        let line = String::from_utf8_lossy(&self.line)
                            .trim_end_matches('\r')
                            .to_string();
                        self.line.clear();
                        Some(Inbound::Line(line))
                    }
                    _ => {
                        self.line.push(byte);
                        None
                    }
                }
            }
        }
    }

    fn command_byte(&mut self, byte: u8) -> Option<Inbound> {
        let need = match byte {
            START_SYSEX => {
                self.state = ParseState::Sysex(Vec::new());
                return None;
            }
            SYSTEM_RESET => return Some(Inbound::Reset),
            SET_PIN_MODE | REPORT_VERSION => 2,
            b if b & 0xF0 == ANALOG_MESSAGE || b & 0xF0 == DIGITAL_MESSAGE => 2,
            b if b & 0xF0 == REPORT_ANALOG || b & 0xF0 == REPORT_DIGITAL => 1,
            _ => return None,
        };
        self.state = ParseState::Message {
            command: byte,
            need,
            data: Vec::with_capacity(need),
        };
        None
    }

    fn channel_message(command: u8, data: &[u8]) -> Option<Inbound> {
        match command {
            SET_PIN_MODE => Some(Inbound::PinMode {
                pin: data[0],
                mode: data[1],
            }),
            REPORT_VERSION => Some(Inbound::Version {
                major: data[0],
                minor: data[1],
            }),
            c if c & 0xF0 == ANALOG_MESSAGE => Some(Inbound::Analog {
                pin: c & 0x0F,
                value: normalize(data[0], data[1]),
            }),
            c if c & 0xF0 == DIGITAL_MESSAGE => Some(Inbound::Digital {
                port: c & 0x0F,
                mask: data[0] | (data[1] << 7),
            }),
            c if c & 0xF0 == REPORT_ANALOG => Some(Inbound::ReportAnalog {
                pin: c & 0x0F,
                enable: data[0] != 0,
            }),
            _ => None,
        }
    }
}
