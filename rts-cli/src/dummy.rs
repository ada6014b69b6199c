//! Simulated camera: exposes, cools and streams a synthetic frame.

use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rts::status::BOP_EXPOSURE;
use rts::{
    ActionResult, Block, BlockConfig, CommandError, ConnType, Connection, Coolable, DataType,
    Device, DeviceHandler, DeviceState, E_HW, E_PARAMSVAL, Exposable, MESSAGE_INFO, Value,
    ValueData,
};

/// Status bit shown while the shutter is open.
const EXPOSING: u32 = 0x0001;

/// Degrees the sensor moves towards its set point per step.
const COOLING_STEP: f64 = 0.1;

/// Arguments for `rtsmon dummy`.
#[derive(clap::Args)]
pub struct DummyArgs {
    /// Device name announced to peers.
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Address to listen on.
    #[arg(short = 'l', long, default_value = "0.0.0.0:1617")]
    pub listen: String,

    /// Require clients to authorize before commanding.
    #[arg(long)]
    pub authorize: bool,

    /// Size of the streamed frame in bytes.
    #[arg(long, default_value_t = 4096)]
    pub frame: usize,
}

fn epoch(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).map_or(0.0, |d| d.as_secs_f64())
}

#[derive(Debug)]
struct Camera {
    /// End of the running exposure.
    exposure_end: Option<Instant>,
    /// Regulation on.
    cooling: bool,
    /// Frame size in bytes.
    frame: usize,
}

impl Camera {
    /// Closes the shutter and sends the frame to every connected client.
    fn finish_exposure(&mut self, block: &mut Block) -> ActionResult {
        self.exposure_end = None;
        let count = block.values().integer("count")? + 1;
        block.set_value("count", ValueData::Integer(count))?;
        block.set_state(DeviceState::default(), Some("exposure finished"));

        let frame: Vec<u8> = (0..self.frame)
            .map(|i| u8::try_from(i % 251).unwrap_or_default())
            .collect();
        let clients: Vec<_> = block
            .connections()
            .filter(|c| c.conn_type() == ConnType::Client && c.is_connected())
            .map(Connection::id)
            .collect();
        for id in clients {
            let Some(conn) = block.connection_mut(id) else {
                continue;
            };
            let sent = conn
                .start_binary_data(DataType::U8, &[frame.len()])
                .and_then(|data_conn| conn.send_binary_data(data_conn, 0, &frame));
            if let Err(e) = sent {
                tracing::warn!(conn = %id, error = %e, "frame not sent");
            }
        }
        block.send_message(MESSAGE_INFO, &format!("frame {count} done"));
        Ok(())
    }
}

impl Exposable for Camera {
    fn start_exposure(&mut self, block: &mut Block, time: f64) -> ActionResult {
        if self.exposure_end.is_some() {
            return Err(CommandError::new(E_HW, "exposure in progress"));
        }
        let length = Duration::try_from_secs_f64(time)
            .map_err(|_| CommandError::new(E_PARAMSVAL, "invalid exposure time"))?;
        self.exposure_end = Some(Instant::now() + length);
        block.set_value("exposure", ValueData::Double(time))?;
        block.set_state(DeviceState(EXPOSING | BOP_EXPOSURE), Some("exposing"));
        let now = epoch(SystemTime::now());
        block.send_progress(now, now + time);
        Ok(())
    }

    fn stop_exposure(&mut self, block: &mut Block) -> ActionResult {
        if self.exposure_end.take().is_some() {
            block.set_state(DeviceState::default(), Some("exposure aborted"));
        }
        Ok(())
    }
}

impl Coolable for Camera {
    fn set_cooling(&mut self, block: &mut Block, temperature: f64) -> ActionResult {
        block.set_value("ccd_set", ValueData::Double(temperature))?;
        self.cooling = true;
        Ok(())
    }

    fn cooling_off(&mut self, _block: &mut Block) -> ActionResult {
        self.cooling = false;
        Ok(())
    }
}

impl Device for Camera {
    fn exposable(&mut self) -> Option<&mut dyn Exposable> {
        Some(self)
    }

    fn coolable(&mut self) -> Option<&mut dyn Coolable> {
        Some(self)
    }

    fn idle(&mut self, block: &mut Block) {
        if self.exposure_end.is_some_and(|end| Instant::now() >= end) {
            if let Err(e) = self.finish_exposure(block) {
                tracing::error!(error = %e, "cannot finish exposure");
            }
        }
    }

    fn info(&mut self, block: &mut Block) -> ActionResult {
        let temp = block.values().double("ccd_temp")?;
        let target = if self.cooling {
            block.values().double("ccd_set")?
        } else {
            20.0
        };
        let step = (target - temp).clamp(-COOLING_STEP, COOLING_STEP);
        block.set_value("ccd_temp", ValueData::Double(temp + step))?;
        Ok(())
    }
}

pub fn run(mut config: BlockConfig, args: &DummyArgs, stop: &AtomicBool) -> Result<()> {
    if let Some(name) = &args.name {
        config.name.clone_from(name);
    }
    config.listen = Some(args.listen.clone());
    config.authorize |= args.authorize;

    let mut block = Block::new(config)?;
    block.add_value(Value::new("exposure", "last exposure time", ValueData::Double(0.0)))?;
    block.add_value(Value::new("count", "frames taken", ValueData::Integer(0)))?;
    block.add_value(Value::new("ccd_temp", "sensor temperature", ValueData::Double(20.0)))?;
    block.add_value(
        Value::new("ccd_set", "cooling set point", ValueData::Double(-20.0)).writable(),
    )?;

    let camera = Camera {
        exposure_end: None,
        cooling: false,
        frame: args.frame,
    };
    tracing::info!(name = block.name(), "dummy camera running");
    block.run(&mut DeviceHandler::new(camera), stop)?;
    Ok(())
}
