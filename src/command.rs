//! Command registry and line-protocol codec.
//!
//! Every command the board understands is described once in [`COMMANDS`].
//! Parameters arrive as JSON values (the shape used by every collaborator) and
//! are fully validated into a [`Command`] before anything is encoded, so a bad
//! request never reaches the wire.
//!
//! On the wire a command is one or more *line-groups*: the command name on its
//! own line followed by one line per argument. The board answers each group
//! with exactly one `OK:start ... OK:ready` frame.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::pins::{ANALOG_PINS, PWM_PINS};

/// Static description of a registered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: &'static str,
    /// Number of parameters accepted by [`Command::parse`].
    pub params: usize,
    /// Number of argument lines in one encoded line-group.
    pub group_args: usize,
}

pub const COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor {
        name: "comtest",
        params: 0,
        group_args: 0,
    },
    CommandDescriptor {
        name: "vset",
        params: 3,
        group_args: 3,
    },
    CommandDescriptor {
        name: "vread",
        params: 1,
        group_args: 1,
    },
    CommandDescriptor {
        name: "verbose",
        params: 1,
        group_args: 1,
    },
];

pub fn descriptor(name: &str) -> Option<&'static CommandDescriptor> {
    COMMANDS.iter().find(|d| d.name == name)
}

/// A validated line-protocol command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Comtest,
    /// Set PWM outputs. `pins` and `values` have equal, non-zero length.
    Vset {
        pins: Vec<u8>,
        values: Vec<u8>,
        settling: u16,
    },
    Vread { pins: Vec<u8> },
    Verbose(bool),
}

impl Command {
    /// Looks up `name` and validates `params` against its schema.
    pub fn parse(name: &str, params: &[Value]) -> Result<Command> {
        let desc = descriptor(name).ok_or_else(|| Error::UnknownCommand(name.to_string()))?;
        if desc.params != params.len() {
            return Err(Error::ArityMismatch {
                command: desc.name,
                expected: desc.params,
                got: params.len(),
            });
        }

        match desc.name {
            "comtest" => Ok(Command::Comtest),
            "vset" => {
                let pins = pin_list("vset", &params[0], PWM_PINS)?;
                let raw_values = list("vset", &params[1], "values")?;
                if pins.len() != raw_values.len() {
                    return Err(Error::LengthMismatch {
                        pins: pins.len(),
                        values: raw_values.len(),
                    });
                }
                let values = raw_values
                    .iter()
                    .map(|v| ranged("Value", v, 0, 255).map(|v| v as u8))
                    .collect::<Result<Vec<_>>>()?;
                let settling = ranged("Settling", &params[2], 0, 65535)? as u16;
                Ok(Command::Vset {
                    pins,
                    values,
                    settling,
                })
            }
            "vread" => Ok(Command::Vread {
                pins: pin_list("vread", &params[0], ANALOG_PINS)?,
            }),
            "verbose" => Ok(Command::Verbose(flag("Verbosity", &params[0])?)),
            other => Err(Error::UnknownCommand(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Comtest => "comtest",
            Command::Vset { .. } => "vset",
            Command::Vread { .. } => "vread",
            Command::Verbose(_) => "verbose",
        }
    }

    /// Encodes the command into its line-groups, one per expected reply.
    ///
    /// For a multi-pin `vset` only the last group carries the settling time,
    /// so the board waits once after every output has changed.
    pub fn encode(&self) -> Vec<Vec<u8>> {
        match self {
            Command::Comtest => vec![b"comtest\n".to_vec()],
            Command::Vset {
                pins,
                values,
                settling,
            } => {
                let last = pins.len() - 1;
                pins.iter()
                    .zip(values)
                    .enumerate()
                    .map(|(i, (pin, value))| {
                        let settle = if i == last { *settling } else { 0 };
                        format!("vset\n{}\n{}\n{}\n", pin, value, settle).into_bytes()
                    })
                    .collect()
            }
            Command::Vread { pins } => pins
                .iter()
                .map(|pin| format!("vread\n{}\n", pin).into_bytes())
                .collect(),
            Command::Verbose(on) => vec![format!("verbose\n{}\n", *on as u8).into_bytes()],
        }
    }

    /// Decodes wire bytes back into one command per line-group.
    pub fn decode(bytes: &[u8]) -> Result<Vec<Command>> {
        let text = String::from_utf8_lossy(bytes);
        let mut groups = GroupAssembler::default();
        let mut commands = Vec::new();
        for line in text.lines() {
            if let Some(cmd) = groups.push(line) {
                commands.push(cmd?);
            }
        }
        if groups.is_pending() {
            return Err(Error::InvalidParam {
                command: groups.pending_name().unwrap_or("?"),
                reason: "truncated line-group".to_string(),
            });
        }
        Ok(commands)
    }
}

/// Accumulates received lines into complete line-groups.
#[derive(Debug, Default)]
pub struct GroupAssembler {
    current: Option<(&'static CommandDescriptor, Vec<String>)>,
}

impl GroupAssembler {
    /// Feeds one line; returns a command once its group is complete.
    pub fn push(&mut self, line: &str) -> Option<Result<Command>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match self.current.take() {
            None => match descriptor(line) {
                Some(desc) if desc.group_args == 0 => Some(group_to_command(desc, &[])),
                Some(desc) => {
                    self.current = Some((desc, Vec::with_capacity(desc.group_args)));
                    None
                }
                None => Some(Err(Error::UnknownCommand(line.to_string()))),
            },
            Some((desc, mut args)) => {
                args.push(line.to_string());
                if args.len() < desc.group_args {
                    self.current = Some((desc, args));
                    None
                } else {
                    Some(group_to_command(desc, &args))
                }
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.current.is_some()
    }

    fn pending_name(&self) -> Option<&'static str> {
        self.current.as_ref().map(|(d, _)| d.name)
    }
}

fn group_to_command(desc: &CommandDescriptor, args: &[String]) -> Result<Command> {
    let num = |s: &String| -> Value {
        s.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::from(s.as_str()))
    };
    match desc.name {
        "vset" => Command::parse(
            "vset",
            &[
                Value::Array(vec![num(&args[0])]),
                Value::Array(vec![num(&args[1])]),
                num(&args[2]),
            ],
        ),
        "vread" => Command::parse("vread", &[Value::Array(vec![num(&args[0])])]),
        "verbose" => Command::parse("verbose", &[num(&args[0])]),
        name => Command::parse(name, &[]),
    }
}

/// Integer conversion with the leniency callers rely on: floats truncate,
/// numeric strings parse, booleans count as 0/1.
fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn ranged(what: &'static str, value: &Value, min: i64, max: i64) -> Result<i64> {
    match as_integer(value) {
        Some(v) if (min..=max).contains(&v) => Ok(v),
        _ => Err(Error::Range {
            what,
            value: value.to_string(),
            min,
            max,
        }),
    }
}

/// Strict 0/1 switch: an integral number or a boolean, nothing else.
fn flag(what: &'static str, value: &Value) -> Result<bool> {
    let v = match value {
        Value::Bool(b) => Some(*b as i64),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        _ => None,
    };
    match v {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(Error::Range {
            what,
            value: value.to_string(),
            min: 0,
            max: 1,
        }),
    }
}

fn list<'a>(command: &'static str, value: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| Error::InvalidParam {
        command,
        reason: format!("{} must be a list, got {}", what, value),
    })
}

fn pin_list(command: &'static str, value: &Value, valid: &'static [u8]) -> Result<Vec<u8>> {
    let raw = list(command, value, "pins")?;
    if raw.is_empty() {
        return Err(Error::InvalidParam {
            command,
            reason: "at least one pin is required".to_string(),
        });
    }
    raw.iter()
        .map(|p| {
            let pin = p
                .as_i64()
                .or_else(|| p.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .and_then(|pin| u8::try_from(pin).ok());
            match pin {
                Some(pin) if valid.contains(&pin) => Ok(pin),
                _ => Err(Error::Pin {
                    command,
                    pin: p.to_string(),
                    valid,
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vset(pins: Value, values: Value, settling: Value) -> Result<Command> {
        Command::parse("vset", &[pins, values, settling])
    }

    // --- Registry ---

    #[test]
    fn reject_unknown_command() {
        let err = Command::parse("vjump", &[]).unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(ref name) if name == "vjump"));
    }

    #[test]
    fn reject_wrong_arity() {
        let err = Command::parse("vread", &[json!([0]), json!(1)]).unwrap_err();
        assert!(matches!(
            err,
            Error::ArityMismatch { command: "vread", expected: 1, got: 2 }
        ));
        assert!(err.is_validation());
    }

    // --- vset ---

    #[test]
    fn vset_emits_one_group_per_pin_with_settling_last() {
        let cmd = vset(json!([3, 9, 11]), json!([0, 128, 255]), json!(500)).unwrap();
        let groups = cmd.encode();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0], b"vset\n3\n0\n0\n");
        assert_eq!(groups[1], b"vset\n9\n128\n0\n");
        assert_eq!(groups[2], b"vset\n11\n255\n500\n");
    }

    #[test]
    fn vset_single_pin_keeps_its_settling() {
        let cmd = vset(json!([10]), json!([7]), json!(20)).unwrap();
        assert_eq!(cmd.encode(), vec![b"vset\n10\n7\n20\n".to_vec()]);
    }

    #[test]
    fn vset_rejects_pins_outside_pwm_set() {
        let err = vset(json!([3, 4]), json!([1, 2]), json!(0)).unwrap_err();
        assert!(matches!(err, Error::Pin { command: "vset", ref pin, .. } if pin == "4"));
        let err = vset(json!([-1]), json!([1]), json!(0)).unwrap_err();
        assert!(matches!(err, Error::Pin { ref pin, .. } if pin == "-1"));
    }

    #[test]
    fn non_member_pins_are_pin_errors_whatever_their_type() {
        for bad in [json!("3"), json!("7"), json!(3.5), json!(null), json!(300)] {
            let err = vset(json!([bad.clone()]), json!([1]), json!(0)).unwrap_err();
            assert!(matches!(err, Error::Pin { command: "vset", .. }), "{} gave {:?}", bad, err);
        }
        let err = Command::parse("vread", &[json!(["0"])]).unwrap_err();
        assert!(matches!(err, Error::Pin { ref pin, .. } if pin == "\"0\""));
    }

    #[test]
    fn vset_rejects_length_mismatch() {
        let err = vset(json!([3, 9]), json!([1]), json!(0)).unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { pins: 2, values: 1 }));
    }

    #[test]
    fn vset_rejects_out_of_range_values() {
        let err = vset(json!([3]), json!([256]), json!(0)).unwrap_err();
        assert!(matches!(err, Error::Range { what: "Value", .. }));
        let err = vset(json!([3]), json!(["high"]), json!(0)).unwrap_err();
        assert!(matches!(err, Error::Range { what: "Value", .. }));
        let err = vset(json!([3]), json!([10]), json!(65536)).unwrap_err();
        assert!(matches!(err, Error::Range { what: "Settling", .. }));
        let err = vset(json!([3]), json!([10]), json!(-1)).unwrap_err();
        assert!(matches!(err, Error::Range { what: "Settling", .. }));
    }

    #[test]
    fn vset_converts_values_like_integers() {
        let cmd = vset(json!([3, 9]), json!([12.9, "40"]), json!("100")).unwrap();
        assert_eq!(
            cmd,
            Command::Vset {
                pins: vec![3, 9],
                values: vec![12, 40],
                settling: 100,
            }
        );
    }

    #[test]
    fn vset_requires_list_params() {
        let err = vset(json!(3), json!([1]), json!(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidParam { command: "vset", .. }));
        let err = vset(json!([]), json!([]), json!(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidParam { .. }));
    }

    #[test]
    fn vset_decode_reconstructs_triples() {
        let cmd = vset(json!([3, 9, 10, 11]), json!([1, 2, 3, 4]), json!(65535)).unwrap();
        let wire: Vec<u8> = cmd.encode().concat();
        let decoded = Command::decode(&wire).unwrap();
        let triples: Vec<(u8, u8, u16)> = decoded
            .iter()
            .map(|c| match c {
                Command::Vset {
                    pins,
                    values,
                    settling,
                } => (pins[0], values[0], *settling),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(triples, vec![(3, 1, 0), (9, 2, 0), (10, 3, 0), (11, 4, 65535)]);
    }

    // --- vread / verbose ---

    #[test]
    fn vread_emits_one_group_per_pin() {
        let cmd = Command::parse("vread", &[json!([0, 5])]).unwrap();
        assert_eq!(cmd.encode(), vec![b"vread\n0\n".to_vec(), b"vread\n5\n".to_vec()]);
    }

    #[test]
    fn vread_rejects_non_analog_pin() {
        let err = Command::parse("vread", &[json!([0, 6])]).unwrap_err();
        assert!(matches!(err, Error::Pin { command: "vread", ref pin, .. } if pin == "6"));
    }

    #[test]
    fn verbose_accepts_only_zero_or_one() {
        assert_eq!(Command::parse("verbose", &[json!(0)]).unwrap(), Command::Verbose(false));
        assert_eq!(
            Command::parse("verbose", &[json!(1)]).unwrap().encode(),
            vec![b"verbose\n1\n".to_vec()]
        );
        let err = Command::parse("verbose", &[json!(2)]).unwrap_err();
        assert!(matches!(err, Error::Range { what: "Verbosity", .. }));
    }

    #[test]
    fn verbose_does_not_truncate_or_parse_strings() {
        for bad in [json!(0.5), json!(1.9), json!("1"), json!("0"), json!(null)] {
            let err = Command::parse("verbose", &[bad.clone()]).unwrap_err();
            assert!(matches!(err, Error::Range { what: "Verbosity", .. }), "{} accepted", bad);
        }
        assert_eq!(Command::parse("verbose", &[json!(true)]).unwrap(), Command::Verbose(true));
        assert_eq!(Command::parse("verbose", &[json!(1.0)]).unwrap(), Command::Verbose(true));
    }

    #[test]
    fn decode_mixed_stream() {
        let decoded = Command::decode(b"comtest\nverbose\n0\nvread\n2\n").unwrap();
        assert_eq!(
            decoded,
            vec![Command::Comtest, Command::Verbose(false), Command::Vread { pins: vec![2] }]
        );
    }

    #[test]
    fn decode_rejects_truncated_group() {
        assert!(Command::decode(b"vset\n3\n10\n").is_err());
    }
}
