//! Device state word and its sub-field masks.
//!
//! A device reports one `u32`. Independent sub-fields are carved out of it
//! with fixed masks: the device specific status (idle when zero), an error
//! code, the Block-Operation bits other devices must honor, a stop flag and
//! the weather flag.

use std::fmt;

/// Device specific status bits. Zero means idle.
pub const DEVICE_STATUS_MASK: u32 = 0x0000_ffff;
/// Idle device.
pub const DEVICE_IDLE: u32 = 0x0000_0000;

/// Device error sub-field.
pub const DEVICE_ERROR_MASK: u32 = 0x000f_0000;
/// No error.
pub const DEVICE_NO_ERROR: u32 = 0x0000_0000;
/// Device was killed while running a command.
pub const DEVICE_ERROR_KILL: u32 = 0x0001_0000;
/// Hardware error.
pub const DEVICE_ERROR_HW: u32 = 0x0002_0000;
/// Device is not ready.
pub const DEVICE_NOT_READY: u32 = 0x0004_0000;

/// Block-Operation sub-field.
pub const BOP_MASK: u32 = 0x3f00_0000;
/// Do not start while an exposure is running.
pub const BOP_EXPOSURE: u32 = 0x0100_0000;
/// Do not start while a readout is running.
pub const BOP_READOUT: u32 = 0x0200_0000;
/// Do not start while the telescope moves.
pub const BOP_TEL_MOVE: u32 = 0x0400_0000;
/// An exposure is about to start.
pub const BOP_WILL_EXPOSE: u32 = 0x0800_0000;
/// Waiting for an external exposure trigger.
pub const BOP_TRIG_EXPOSE: u32 = 0x1000_0000;

/// Movement sub-field.
pub const STOP_MASK: u32 = 0x4000_0000;
/// Movements are allowed.
pub const CAN_MOVE: u32 = 0x0000_0000;
/// Everything must stay still.
pub const STOP_EVERYTHING: u32 = 0x4000_0000;

/// Weather sub-field.
pub const WEATHER_MASK: u32 = 0x8000_0000;
/// Good weather.
pub const GOOD_WEATHER: u32 = 0x0000_0000;
/// Bad weather.
pub const BAD_WEATHER: u32 = 0x8000_0000;

/// State word reported by a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DeviceState(pub u32);

impl DeviceState {
    /// Raw state word.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// `true` when the device reports good weather.
    pub const fn is_good_weather(self) -> bool {
        self.0 & WEATHER_MASK == GOOD_WEATHER
    }

    /// `true` when the device status sub-field is idle.
    pub const fn is_idle(self) -> bool {
        self.0 & DEVICE_STATUS_MASK == DEVICE_IDLE
    }

    /// `true` when movements are allowed.
    pub const fn can_move(self) -> bool {
        self.0 & STOP_MASK == CAN_MOVE
    }

    /// Error sub-field.
    pub const fn error_state(self) -> u32 {
        self.0 & DEVICE_ERROR_MASK
    }

    /// Block-Operation sub-field.
    pub const fn bop_state(self) -> u32 {
        self.0 & BOP_MASK
    }

    /// Device status without error, BOP, stop and weather bits.
    pub const fn real_state(self) -> u32 {
        self.0 & DEVICE_STATUS_MASK
    }

    /// Returns the masks of every sub-field that differs from `other`.
    pub const fn changed_fields(self, other: Self) -> u32 {
        let diff = self.0 ^ other.0;
        let mut fields = 0;
        if diff & DEVICE_STATUS_MASK != 0 {
            fields |= DEVICE_STATUS_MASK;
        }
        if diff & DEVICE_ERROR_MASK != 0 {
            fields |= DEVICE_ERROR_MASK;
        }
        if diff & BOP_MASK != 0 {
            fields |= BOP_MASK;
        }
        if diff & STOP_MASK != 0 {
            fields |= STOP_MASK;
        }
        if diff & WEATHER_MASK != 0 {
            fields |= WEATHER_MASK;
        }
        fields
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_idle() { "idle" } else { "busy" })?;
        match self.error_state() {
            DEVICE_NO_ERROR => {}
            DEVICE_ERROR_KILL => f.write_str(" | killed")?,
            DEVICE_ERROR_HW => f.write_str(" | hardware error")?,
            DEVICE_NOT_READY => f.write_str(" | not ready")?,
            other => write!(f, " | error {other:#x}")?,
        }
        let bop = self.bop_state();
        for (bit, label) in [
            (BOP_EXPOSURE, "block exposure"),
            (BOP_READOUT, "block readout"),
            (BOP_TEL_MOVE, "block telescope move"),
            (BOP_WILL_EXPOSE, "will expose"),
            (BOP_TRIG_EXPOSE, "wait trigger"),
        ] {
            if bop & bit != 0 {
                write!(f, " | {label}")?;
            }
        }
        if !self.can_move() {
            f.write_str(" | stop")?;
        }
        if !self.is_good_weather() {
            f.write_str(" | bad weather")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_fields_are_independent() {
        let s = DeviceState(BAD_WEATHER | BOP_EXPOSURE | DEVICE_ERROR_HW | 0x0003);
        assert!(!s.is_good_weather());
        assert!(!s.is_idle());
        assert!(s.can_move());
        assert_eq!(s.error_state(), DEVICE_ERROR_HW);
        assert_eq!(s.bop_state(), BOP_EXPOSURE);
        assert_eq!(s.real_state(), 0x0003);
    }

    #[test]
    fn changed_fields_reports_touched_masks() {
        let a = DeviceState(0x0001);
        let b = DeviceState(0x0001 | BOP_READOUT);
        assert_eq!(a.changed_fields(b), BOP_MASK);
        assert_eq!(a.changed_fields(a), 0);
        assert_eq!(
            a.changed_fields(DeviceState(STOP_EVERYTHING)),
            DEVICE_STATUS_MASK | STOP_MASK
        );
    }

    #[test]
    fn display_lists_flags() {
        let s = DeviceState(BOP_TEL_MOVE | STOP_EVERYTHING);
        assert_eq!(s.to_string(), "idle | block telescope move | stop");
    }
}
