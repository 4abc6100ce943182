//! pigpio daemon backend.
//!
//! Talks to `pigpiod` over its socket interface. Every command is a 16-byte
//! little-endian header `cmd p1 p2 p3` followed by `p3` extension bytes; the
//! reply echoes the header with the result in the last word. Some replies
//! (script status) carry their own extension sized by the result.
//!
//! The DAC is an SPI device whose outputs update on the LDAC strobe: both
//! axis words are shifted in with LDAC high and latched together when LDAC
//! drops, all while holding the socket lock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use microbeam_core::{DacPoint, HitBatch};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Level, PositionCell, TriggerBackend, TriggerConfig};
use crate::error::{HardwareError, HardwareResult};
use crate::program::{EdgeProgram, ProgramShape, PARAM_COUNT, TICK_PARAM};

/// pigpio socket command numbers.
pub mod cmd {
    pub const MODES: u32 = 0;
    pub const WRITE: u32 = 4;
    pub const TICK: u32 = 16;
    pub const PROC: u32 = 38;
    pub const PROCD: u32 = 39;
    pub const PROCR: u32 = 40;
    pub const PROCS: u32 = 41;
    pub const PROCP: u32 = 45;
    pub const SPIO: u32 = 71;
    pub const SPIC: u32 = 72;
    pub const SPIW: u32 = 74;
}

/// Script states reported by `PROCP`.
pub mod script_status {
    pub const INITING: i32 = 0;
    pub const HALTED: i32 = 1;
    pub const RUNNING: i32 = 2;
    pub const WAITING: i32 = 3;
    pub const FAILED: i32 = 4;
}

const PI_INPUT: u32 = 0;
const PI_OUTPUT: u32 = 1;

/// DAC channel select words.
const DAC_X: u8 = 0b0001_0000;
const DAC_Y: u8 = 0b0001_0001;

/// Status poll cadence while a program runs.
const POLL_INTERVAL: Duration = Duration::from_micros(250);

/// Status polls allowed for a freshly uploaded script to leave INITING.
const INIT_POLLS: u32 = 100;

/// Connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PigpioConfig {
    /// `host:port` of pigpiod
    pub addr: String,
    pub spi_channel: u32,
    pub spi_baud: u32,
    pub spi_flags: u32,
    pub trigger: TriggerConfig,
}

impl Default for PigpioConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8888".to_string(),
            spi_channel: 0,
            spi_baud: 1_300_000,
            spi_flags: 1,
            trigger: TriggerConfig::default(),
        }
    }
}

// ============================================================================
// Socket
// ============================================================================

struct PigpioSocket {
    stream: TcpStream,
}

impl PigpioSocket {
    /// Sends a command and returns the raw result word.
    async fn raw(&mut self, command: u32, p1: u32, p2: u32, ext: &[u8]) -> HardwareResult<i32> {
        let ext_len = u32::try_from(ext.len())
            .map_err(|_| HardwareError::MalformedResponse("extension too large".to_string()))?;
        let mut frame = Vec::with_capacity(16 + ext.len());
        for word in [command, p1, p2, ext_len] {
            frame.extend_from_slice(&word.to_le_bytes());
        }
        frame.extend_from_slice(ext);
        self.stream.write_all(&frame).await?;

        let mut reply = [0u8; 16];
        self.stream.read_exact(&mut reply).await?;
        le_i32(&reply, 12)
            .ok_or_else(|| HardwareError::MalformedResponse("short reply header".to_string()))
    }

    /// Sends a command, mapping negative results to errors.
    async fn command(
        &mut self,
        name: &'static str,
        command: u32,
        p1: u32,
        p2: u32,
        ext: &[u8],
    ) -> HardwareResult<i32> {
        let res = self.raw(command, p1, p2, ext).await?;
        if res < 0 {
            return Err(HardwareError::Pigpio { command: name, code: res });
        }
        Ok(res)
    }

    async fn write_level(&mut self, gpio: u32, level: Level) -> HardwareResult<()> {
        self.command("WRITE", cmd::WRITE, gpio, level.value(), &[])
            .await
            .map(drop)
    }

    /// Returns script status and parameters.
    async fn script_status(&mut self, id: u32) -> HardwareResult<(i32, [i32; PARAM_COUNT])> {
        let len = self.command("PROCP", cmd::PROCP, id, 0, &[]).await?;
        let len = usize::try_from(len).unwrap_or(0);
        let mut ext = vec![0u8; len];
        self.stream.read_exact(&mut ext).await?;

        let status = le_i32(&ext, 0)
            .ok_or_else(|| HardwareError::MalformedResponse(format!("PROCP returned {len} bytes")))?;
        let mut params = [0i32; PARAM_COUNT];
        for (i, slot) in params.iter_mut().enumerate() {
            *slot = le_i32(&ext, 4 * (i + 1)).unwrap_or(0);
        }
        Ok((status, params))
    }
}

fn le_i32(bytes: &[u8], offset: usize) -> Option<i32> {
    let word = bytes.get(offset..offset + 4)?;
    let word: [u8; 4] = word.try_into().ok()?;
    Some(i32::from_le_bytes(word))
}

fn params_ext(params: &[u32]) -> Vec<u8> {
    params.iter().flat_map(|p| p.to_le_bytes()).collect()
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Default)]
struct ScriptSlot {
    program: Option<EdgeProgram>,
    id: Option<u32>,
}

/// Backend driving the Raspberry Pi GPIO and SPI DAC through pigpiod.
pub struct PigpioBackend {
    config: PigpioConfig,
    socket: Mutex<PigpioSocket>,
    spi_handle: u32,
    position: PositionCell,
    script: Mutex<ScriptSlot>,
}

impl PigpioBackend {
    /// Connects to pigpiod and configures the lines.
    ///
    /// # Errors
    ///
    /// Any failure here leaves the hardware in an unknown state and should
    /// abort startup.
    pub async fn connect(config: PigpioConfig) -> HardwareResult<Self> {
        let stream =
            TcpStream::connect(&config.addr)
                .await
                .map_err(|source| HardwareError::Connect {
                    addr: config.addr.clone(),
                    source,
                })?;
        stream.set_nodelay(true)?;
        let mut socket = PigpioSocket { stream };

        let gpio = config.trigger.gpio;
        socket
            .command("MODES", cmd::MODES, gpio.trigger, PI_INPUT, &[])
            .await?;
        socket
            .command("MODES", cmd::MODES, gpio.shutter, PI_OUTPUT, &[])
            .await?;
        socket
            .write_level(gpio.shutter, config.trigger.shutter_closed_level())
            .await?;
        let spi_handle = socket
            .command(
                "SPIO",
                cmd::SPIO,
                config.spi_channel,
                config.spi_baud,
                &config.spi_flags.to_le_bytes(),
            )
            .await? as u32;
        socket
            .command("MODES", cmd::MODES, gpio.ldac, PI_OUTPUT, &[])
            .await?;

        info!(
            addr = %config.addr,
            trigger = gpio.trigger,
            shutter = gpio.shutter,
            ldac = gpio.ldac,
            spi_handle,
            edge = %config.trigger.edge,
            "pigpio backend connected"
        );

        Ok(Self {
            config,
            socket: Mutex::new(socket),
            spi_handle,
            position: PositionCell::default(),
            script: Mutex::new(ScriptSlot::default()),
        })
    }

    /// Current hardware tick.
    pub async fn tick(&self) -> HardwareResult<u32> {
        let mut socket = self.socket.lock().await;
        Ok(socket.raw(cmd::TICK, 0, 0, &[]).await? as u32)
    }

    async fn upload(&self, program: &EdgeProgram) -> HardwareResult<u32> {
        let mut socket = self.socket.lock().await;
        let script = program.to_script();
        let id = socket
            .command("PROC", cmd::PROC, 0, 0, script.as_bytes())
            .await? as u32;

        for _ in 0..INIT_POLLS {
            let (status, _) = socket.script_status(id).await?;
            if status != script_status::INITING {
                debug!(id, script = %script, "Edge program uploaded");
                return Ok(id);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(HardwareError::ProgramInitTimeout { id })
    }

    async fn stop_script(&self, id: u32) -> HardwareResult<()> {
        let mut socket = self.socket.lock().await;
        socket.command("PROCS", cmd::PROCS, id, 0, &[]).await?;
        socket
            .write_level(
                self.config.trigger.gpio.shutter,
                self.config.trigger.shutter_closed_level(),
            )
            .await
    }

    async fn delete_script(&self, id: u32) -> HardwareResult<()> {
        let mut socket = self.socket.lock().await;
        socket.command("PROCD", cmd::PROCD, id, 0, &[]).await.map(drop)
    }

    /// Edges a stopped run had counted, taken from the remaining count.
    async fn collect_stopped(
        &self,
        id: u32,
        shape: ProgramShape,
    ) -> HardwareResult<Option<HitBatch>> {
        let mut socket = self.socket.lock().await;
        let params = match socket.script_status(id).await {
            Ok((_, params)) => params,
            Err(e) if e.is_bad_script() => return Ok(None),
            Err(e) => return Err(e),
        };
        let count = shape.counted(&params);
        if count == 0 {
            return Ok(None);
        }
        let tick = socket.raw(cmd::TICK, 0, 0, &[]).await? as u32;
        drop(socket);

        debug!(id, count, "Edges counted before the program was stopped");
        Ok(Some(self.batch(tick, count)))
    }

    fn batch(&self, tick: u32, count: u32) -> HitBatch {
        HitBatch {
            hw_timestamp_us: tick,
            wall_timestamp: Utc::now(),
            position: self.position.load(),
            count,
            latch_up: None,
        }
    }

    async fn forget_script(&self, id: u32) {
        let mut slot = self.script.lock().await;
        if slot.id == Some(id) {
            slot.id = None;
        }
    }
}

#[async_trait]
impl TriggerBackend for PigpioBackend {
    fn name(&self) -> &'static str {
        "pigpio"
    }

    async fn set_position(&self, point: DacPoint) -> HardwareResult<()> {
        let ldac = self.config.trigger.gpio.ldac;
        let [x_hi, x_lo] = (point.x as u16).to_be_bytes();
        let [y_hi, y_lo] = (point.y as u16).to_be_bytes();

        let mut socket = self.socket.lock().await;
        socket.write_level(ldac, Level::High).await?;
        socket
            .command("SPIW", cmd::SPIW, self.spi_handle, 0, &[DAC_X, x_hi, x_lo])
            .await?;
        socket
            .command("SPIW", cmd::SPIW, self.spi_handle, 0, &[DAC_Y, y_hi, y_lo])
            .await?;
        socket.write_level(ldac, Level::Low).await?;
        drop(socket);

        self.position.store(point);
        debug!(x = point.x, y = point.y, "DAC written");
        Ok(())
    }

    fn position(&self) -> DacPoint {
        self.position.load()
    }

    async fn open_shutter(&self) -> HardwareResult<()> {
        let mut socket = self.socket.lock().await;
        socket
            .write_level(self.config.trigger.gpio.shutter, self.config.trigger.shutter_open_level)
            .await?;
        debug!("Shutter opened");
        Ok(())
    }

    async fn close_shutter(&self) -> HardwareResult<()> {
        let mut socket = self.socket.lock().await;
        socket
            .write_level(
                self.config.trigger.gpio.shutter,
                self.config.trigger.shutter_closed_level(),
            )
            .await?;
        debug!("Shutter closed");
        Ok(())
    }

    async fn prepare(&self, hits_per_batch: u32) -> HardwareResult<()> {
        let program = EdgeProgram::compile(ProgramShape::for_batch(hits_per_batch), &self.config.trigger);

        let mut slot = self.script.lock().await;
        if let Some(old) = slot.id.take() {
            if let Err(e) = self.delete_script(old).await {
                warn!(id = old, error = %e, "Failed to delete previous edge program");
            }
        }
        let id = self.upload(&program).await?;
        slot.id = Some(id);
        slot.program = Some(program);
        Ok(())
    }

    async fn arm_and_wait(&self, cancel: &CancellationToken) -> HardwareResult<Option<HitBatch>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let (id, shape) = {
            let mut slot = self.script.lock().await;
            let program = slot.program.clone().ok_or(HardwareError::NotPrepared)?;
            let id = match slot.id {
                Some(id) => id,
                None => {
                    let id = self.upload(&program).await?;
                    slot.id = Some(id);
                    id
                }
            };
            (id, program.shape())
        };

        let run = {
            let mut socket = self.socket.lock().await;
            socket
                .command("PROCR", cmd::PROCR, id, 0, &params_ext(&shape.params()))
                .await
        };
        match run {
            Ok(_) => {}
            Err(e) if e.is_bad_script() => {
                warn!(id, "Edge program already deleted, re-arming");
                self.forget_script(id).await;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stop_script(id).await?;
                    return self.collect_stopped(id, shape).await;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let status = {
                let mut socket = self.socket.lock().await;
                socket.script_status(id).await
            };
            match status {
                Ok((script_status::HALTED, params)) => {
                    let tick = params.get(TICK_PARAM.index()).copied().unwrap_or(0);
                    return Ok(Some(self.batch(tick as u32, shape.hits())));
                }
                Ok((script_status::FAILED, _)) => {
                    return Err(HardwareError::ProgramFailed { id });
                }
                Ok((script_status::RUNNING | script_status::WAITING | script_status::INITING, _)) => {}
                Ok((other, _)) => {
                    return Err(HardwareError::MalformedResponse(format!(
                        "unknown script status {other}"
                    )));
                }
                Err(e) if e.is_bad_script() => {
                    warn!(id, "Edge program already deleted, re-arming");
                    self.forget_script(id).await;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn disarm(&self) -> HardwareResult<()> {
        let id = self.script.lock().await.id;
        match id {
            Some(id) => match self.stop_script(id).await {
                Err(e) if e.is_bad_script() => self.close_shutter().await,
                other => other,
            },
            None => self.close_shutter().await,
        }
    }

    async fn shutdown(&self) -> HardwareResult<()> {
        self.disarm().await?;
        if let Some(id) = self.script.lock().await.id.take() {
            self.delete_script(id).await?;
        }
        let mut socket = self.socket.lock().await;
        socket
            .command("SPIC", cmd::SPIC, self.spi_handle, 0, &[])
            .await?;
        info!("pigpio backend released");
        Ok(())
    }

    fn min_hit_delay(&self) -> Duration {
        self.config.trigger.min_hit_delay
    }
}
