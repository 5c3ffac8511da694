//! Routing state machine of the 4-line analog switch network.

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::firmata;
use crate::link::Link;
use crate::pins::SWITCH_PINS;

/// Named routing of the four control lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchState {
    A,
    B,
    Vplus,
    Zero,
    HiZ,
    /// Nothing has been driven since connect.
    #[default]
    Undefined,
}

impl SwitchState {
    /// Levels of the control lines, driven-high = true. `None` for `Undefined`.
    pub fn pattern(self) -> Option<[bool; 4]> {
        let bits = match self {
            SwitchState::A => [1, 0, 0, 1],
            SwitchState::B => [0, 1, 1, 0],
            SwitchState::Vplus => [1, 0, 1, 0],
            SwitchState::Zero => [0, 1, 0, 1],
            SwitchState::HiZ => [0, 0, 0, 0],
            SwitchState::Undefined => return None,
        };
        Some(bits.map(|b| b == 1))
    }

    /// The state `flip()` moves to.
    pub fn flipped(self) -> SwitchState {
        match self {
            SwitchState::A => SwitchState::B,
            SwitchState::B => SwitchState::A,
            _ => SwitchState::A,
        }
    }

    /// Digital port 0 value that drives this state.
    pub fn port_mask(self) -> Option<u8> {
        let pattern = self.pattern()?;
        Some(
            SWITCH_PINS
                .iter()
                .zip(pattern)
                .filter(|(_, high)| *high)
                .fold(0, |mask, (&pin, _)| mask | (1 << pin)),
        )
    }
}

impl FromStr for SwitchState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" => Ok(SwitchState::A),
            "b" => Ok(SwitchState::B),
            "v+" | "vplus" => Ok(SwitchState::Vplus),
            "0" | "zero" => Ok(SwitchState::Zero),
            "z" | "hiz" | "hi-z" => Ok(SwitchState::HiZ),
            _ => Err(Error::InvalidParam {
                command: "switch",
                reason: format!("unknown switch state '{}'", s),
            }),
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwitchState::A => "A",
            SwitchState::B => "B",
            SwitchState::Vplus => "V+",
            SwitchState::Zero => "0",
            SwitchState::HiZ => "HiZ",
            SwitchState::Undefined => "undefined",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub struct SwitchController {
    state: SwitchState,
}

impl SwitchController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SwitchState {
        self.state
    }

    /// Back to `Undefined`, without touching the pins.
    pub fn forget(&mut self) {
        self.state = SwitchState::Undefined;
    }

    /// Puts the control pins in output mode and drives `HiZ`.
    pub fn init(&mut self, link: &Link) -> Result<()> {
        let mut bytes = Vec::with_capacity(SWITCH_PINS.len() * 3);
        for pin in SWITCH_PINS {
            bytes.extend(firmata::set_pin_mode(pin, firmata::PIN_MODE_OUTPUT));
        }
        link.send(&bytes)?;
        self.set(link, SwitchState::HiZ)
    }

    /// Drives a named state. All four lines change in one port write.
    pub fn set(&mut self, link: &Link, state: SwitchState) -> Result<()> {
        let mask = state.port_mask().ok_or_else(|| Error::InvalidParam {
            command: "switch",
            reason: "cannot drive the undefined state".to_string(),
        })?;
        link.send(&firmata::digital_port(0, mask))?;
        debug!(from = %self.state, to = %state, "switch");
        self.state = state;
        Ok(())
    }

    /// Toggles between `A` and `B`; any other state goes to `A`.
    pub fn flip(&mut self, link: &Link) -> Result<SwitchState> {
        let next = self.state.flipped();
        self.set(link, next)?;
        Ok(next)
    }

    /// Drives `state` for `duration`, blocking the caller, then forces `HiZ`.
    pub fn pulse(&mut self, link: &Link, state: SwitchState, duration: Duration) -> Result<()> {
        self.set(link, state)?;
        thread::sleep(duration);
        self.set(link, SwitchState::HiZ)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollMode;
    use crate::sampler::SampleTable;
    use crate::sim::{BoardSimulator, SimPort};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Instant;

    fn board_link() -> (Arc<Mutex<BoardSimulator>>, Link) {
        let board = Arc::new(Mutex::new(BoardSimulator::new()));
        let link = Link::new(
            Box::new(SimPort::new(Arc::clone(&board))),
            Arc::new(SampleTable::new()),
            PollMode::Manual,
        );
        (board, link)
    }

    #[test]
    fn patterns_match_the_wiring() {
        assert_eq!(SwitchState::A.pattern(), Some([true, false, false, true]));
        assert_eq!(SwitchState::Vplus.pattern(), Some([true, false, true, false]));
        assert_eq!(SwitchState::Zero.pattern(), Some([false, true, false, true]));
        assert_eq!(SwitchState::HiZ.port_mask(), Some(0));
        assert_eq!(SwitchState::Undefined.pattern(), None);
        // A drives pins 2 and 6.
        assert_eq!(SwitchState::A.port_mask(), Some(0b0100_0100));
    }

    #[test]
    fn flip_toggles_a_and_b() {
        assert_eq!(SwitchState::A.flipped().pattern(), Some([false, true, true, false]));
        assert_eq!(SwitchState::Undefined.flipped().pattern(), Some([true, false, false, true]));
        assert_eq!(SwitchState::HiZ.flipped(), SwitchState::A);
    }

    #[test]
    fn parse_names() {
        assert_eq!("v+".parse::<SwitchState>().unwrap(), SwitchState::Vplus);
        assert_eq!("Z".parse::<SwitchState>().unwrap(), SwitchState::HiZ);
        assert_eq!("0".parse::<SwitchState>().unwrap(), SwitchState::Zero);
        assert!("c".parse::<SwitchState>().is_err());
    }

    #[test]
    fn init_configures_outputs_and_drives_hiz() {
        let (board, link) = board_link();
        let mut switch = SwitchController::new();
        switch.init(&link).unwrap();
        assert_eq!(switch.state(), SwitchState::HiZ);
        let board = board.lock();
        for pin in SWITCH_PINS {
            assert_eq!(board.pin_mode(pin), firmata::PIN_MODE_OUTPUT);
        }
        assert_eq!(board.switch_lines(), [false; 4]);
    }

    #[test]
    fn flip_drives_the_board() {
        let (board, link) = board_link();
        let mut switch = SwitchController::new();
        assert_eq!(switch.flip(&link).unwrap(), SwitchState::A);
        assert_eq!(board.lock().switch_lines(), [true, false, false, true]);
        assert_eq!(switch.flip(&link).unwrap(), SwitchState::B);
        assert_eq!(board.lock().switch_lines(), [false, true, true, false]);
    }

    #[test]
    fn pulse_blocks_then_returns_to_hiz() {
        let (board, link) = board_link();
        let mut switch = SwitchController::new();
        let started = Instant::now();
        switch.pulse(&link, SwitchState::Vplus, Duration::from_millis(30)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(switch.state(), SwitchState::HiZ);
        let board = board.lock();
        assert_eq!(board.switch_lines(), [false; 4]);
        // V+ then HiZ, two port writes.
        let writes: Vec<_> = board.received().chunks(3).collect();
        assert_eq!(writes, vec![&firmata::digital_port(0, 0b0010_0100)[..], &[0x90, 0, 0][..]]);
    }

    #[test]
    fn cannot_drive_undefined() {
        let (board, link) = board_link();
        let mut switch = SwitchController::new();
        assert!(switch.set(&link, SwitchState::Undefined).is_err());
        assert!(board.lock().received().is_empty());
    }
}
