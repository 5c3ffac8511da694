//! Fixed pin assignments of the board.

/// PWM voltage outputs, addressed by `vset`.
pub const PWM_PINS: &[u8] = &[3, 9, 10, 11];

/// Analog inputs, addressed by `vread` and the synchronous sampler.
pub const ANALOG_PINS: &[u8] = &[0, 1, 2, 3, 4, 5];

/// Digital pins driving the four control lines of the switch network, in
/// logical line order.
pub const SWITCH_PINS: [u8; 4] = [2, 4, 5, 6];

pub fn is_pwm(pin: u8) -> bool {
    PWM_PINS.contains(&pin)
}

pub fn is_analog(pin: u8) -> bool {
    ANALOG_PINS.contains(&pin)
}

/// Bitmask with bit `n` set for every analog pin `n` in `pins`.
pub fn analog_mask(pins: &[u8]) -> u8 {
    pins.iter()
        .filter(|&&p| is_analog(p))
        .fold(0, |mask, &p| mask | (1 << p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_sets_are_disjoint_where_it_matters() {
        for pin in SWITCH_PINS {
            assert!(!is_pwm(pin));
        }
        assert!(is_pwm(3) && is_analog(3));
        assert!(!is_pwm(2));
        assert!(!is_analog(6));
    }

    #[test]
    fn mask_sets_one_bit_per_pin() {
        assert_eq!(analog_mask(&[0, 1]), 0b0000_0011);
        assert_eq!(analog_mask(&[5, 2, 2]), 0b0010_0100);
        assert_eq!(analog_mask(&[]), 0);
    }
}
