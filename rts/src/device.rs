//! Device capabilities composed into a [`Handler`].
//!
//! A device implements [`Device`] and hands out the capabilities it has.
//! [`DeviceHandler`] routes the standard verbs to them and replies
//! `E_COMMAND` when the device lacks the capability.

use rts_proto::{E_COMMAND, Params};

use crate::block::{Block, CommandError, Handler};
use crate::connection::ConnId;

/// Result of a device action.
pub type ActionResult = std::result::Result<(), CommandError>;

/// Something that takes exposures.
pub trait Exposable {
    /// Starts an exposure of `time` seconds.
    fn start_exposure(&mut self, block: &mut Block, time: f64) -> ActionResult;

    /// Aborts the running exposure.
    fn stop_exposure(&mut self, block: &mut Block) -> ActionResult;
}

/// Something that points somewhere on the sky.
pub trait Movable {
    /// Starts a move to `ra`/`dec`, both in degrees.
    fn move_to(&mut self, block: &mut Block, ra: f64, dec: f64) -> ActionResult;

    /// Stops any movement.
    fn stop_move(&mut self, block: &mut Block) -> ActionResult;
}

/// Something with a temperature regulator.
pub trait Coolable {
    /// Regulates to `temperature` degrees Celsius.
    fn set_cooling(&mut self, block: &mut Block, temperature: f64) -> ActionResult;

    /// Switches regulation off.
    fn cooling_off(&mut self, block: &mut Block) -> ActionResult;
}

/// A device: a set of optional capabilities plus hooks.
pub trait Device {
    /// Exposure capability.
    fn exposable(&mut self) -> Option<&mut dyn Exposable> {
        None
    }

    /// Pointing capability.
    fn movable(&mut self) -> Option<&mut dyn Movable> {
        None
    }

    /// Cooling capability.
    fn coolable(&mut self) -> Option<&mut dyn Coolable> {
        None
    }

    /// Refreshes values before `info` is answered.
    fn info(&mut self, block: &mut Block) -> ActionResult {
        let _ = block;
        Ok(())
    }

    /// Called once per reactor step.
    fn idle(&mut self, block: &mut Block) {
        let _ = block;
    }

    /// Verbs beyond the standard ones.
    fn command(&mut self, block: &mut Block, verb: &str, params: &mut Params<'_>) -> ActionResult {
        let _ = (block, params);
        Err(CommandError::unknown(verb))
    }
}

/// Reply for a verb the device has no capability for.
fn unsupported(verb: &str) -> CommandError {
    CommandError::new(E_COMMAND, format!("device cannot {verb}"))
}

/// [`Handler`] routing `expose`, `stopexpo`, `move`, `stop`, `cooltemp` and
/// `cooloff` to a [`Device`].
#[derive(Debug)]
pub struct DeviceHandler<D> {
    /// Wrapped device.
    device: D,
}

impl<D: Device> DeviceHandler<D> {
    /// Wraps a device.
    pub const fn new(device: D) -> Self {
        Self { device }
    }

    /// Wrapped device.
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Mutable wrapped device.
    pub const fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: Device> Handler for DeviceHandler<D> {
    fn command(
        &mut self,
        block: &mut Block,
        _conn: ConnId,
        verb: &str,
        params: &mut Params<'_>,
    ) -> ActionResult {
        match verb {
            "expose" => {
                let time = params.next_double()?;
                params.expect_end()?;
                let camera = self.device.exposable().ok_or_else(|| unsupported(verb))?;
                camera.start_exposure(block, time)
            }
            "stopexpo" => {
                params.expect_end()?;
                let camera = self.device.exposable().ok_or_else(|| unsupported(verb))?;
                camera.stop_exposure(block)
            }
            "move" => {
                let ra = params.next_hms()?;
                let dec = params.next_dms()?;
                params.expect_end()?;
                let mount = self.device.movable().ok_or_else(|| unsupported(verb))?;
                mount.move_to(block, ra, dec)
            }
            "stop" => {
                params.expect_end()?;
                let mount = self.device.movable().ok_or_else(|| unsupported(verb))?;
                mount.stop_move(block)
            }
            "cooltemp" => {
                let temperature = params.next_double()?;
                params.expect_end()?;
                let cooler = self.device.coolable().ok_or_else(|| unsupported(verb))?;
                cooler.set_cooling(block, temperature)
            }
            "cooloff" => {
                params.expect_end()?;
                let cooler = self.device.coolable().ok_or_else(|| unsupported(verb))?;
                cooler.cooling_off(block)
            }
            _ => self.device.command(block, verb, params),
        }
    }

    fn info(&mut self, block: &mut Block) -> ActionResult {
        self.device.info(block)
    }

    fn idle(&mut self, block: &mut Block) {
        self.device.idle(block);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rts_proto::{DeviceState, E_PARAMSNUM, E_PARAMSVAL};
    use rts_proto::status::BOP_EXPOSURE;

    use super::*;
    use crate::config::BlockConfig;

    #[derive(Default)]
    struct Camera {
        exposing: Option<f64>,
    }

    impl Exposable for Camera {
        fn start_exposure(&mut self, block: &mut Block, time: f64) -> ActionResult {
            self.exposing = Some(time);
            block.set_state(DeviceState(BOP_EXPOSURE), Some("exposing"));
            Ok(())
        }

        fn stop_exposure(&mut self, block: &mut Block) -> ActionResult {
            self.exposing = None;
            block.set_state(DeviceState::default(), None);
            Ok(())
        }
    }

    impl Device for Camera {
        fn exposable(&mut self) -> Option<&mut dyn Exposable> {
            Some(self)
        }
    }

    fn run(handler: &mut DeviceHandler<Camera>, block: &mut Block, line: &str) -> ActionResult {
        let mut params = Params::new(line);
        let verb = params.next_string().unwrap().into_owned();
        handler.command(block, ConnId::new(1), &verb, &mut params)
    }

    #[test]
    fn routes_to_capability() {
        let mut block = Block::new(BlockConfig::named("C0")).unwrap();
        let mut handler = DeviceHandler::new(Camera::default());
        run(&mut handler, &mut block, "expose 2.5").unwrap();
        assert_eq!(handler.device().exposing, Some(2.5));
        assert_eq!(block.state().bop_state(), BOP_EXPOSURE);
        run(&mut handler, &mut block, "stopexpo").unwrap();
        assert_eq!(handler.device().exposing, None);
        assert!(block.state().is_idle());
    }

    #[test]
    fn missing_capability_is_command_error() {
        let mut block = Block::new(BlockConfig::named("C0")).unwrap();
        let mut handler = DeviceHandler::new(Camera::default());
        let e = run(&mut handler, &mut block, "move 10:00:00 +20:00:00").unwrap_err();
        assert_eq!(e.code(), E_COMMAND);
        let e = run(&mut handler, &mut block, "cooloff").unwrap_err();
        assert_eq!(e.code(), E_COMMAND);
        let e = run(&mut handler, &mut block, "focus 12").unwrap_err();
        assert_eq!(e.code(), E_COMMAND);
    }

    #[test]
    fn bad_parameters_map_to_codes() {
        let mut block = Block::new(BlockConfig::named("C0")).unwrap();
        let mut handler = DeviceHandler::new(Camera::default());
        assert_eq!(
            run(&mut handler, &mut block, "expose").unwrap_err().code(),
            E_PARAMSNUM
        );
        assert_eq!(
            run(&mut handler, &mut block, "expose soon").unwrap_err().code(),
            E_PARAMSVAL
        );
        assert_eq!(
            run(&mut handler, &mut block, "expose 1 2").unwrap_err().code(),
            E_PARAMSVAL
        );
        assert_eq!(handler.device().exposing, None);
    }
}
