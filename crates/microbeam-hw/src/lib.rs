//! Microbeam HW - Hardware trigger interface
//!
//! Beam positioning (SPI DAC), shutter gating and hit detection. Hits are
//! counted by small edge programs executed next to the GPIO lines, either
//! on the pigpio daemon's script engine or in the simulator's interpreter,
//! and forwarded to the run controller through the [`pump`].

pub mod backend;
pub mod error;
pub mod pigpio;
pub mod program;
pub mod pump;
pub mod simulator;

pub use backend::{GpioLayout, Level, PositionCell, TriggerBackend, TriggerConfig, TriggerEdge};
pub use error::{HardwareError, HardwareResult, PI_BAD_SCRIPT_ID};
pub use pigpio::{PigpioBackend, PigpioConfig};
pub use program::{EdgeProgram, Op, ProgramIo, ProgramShape};
pub use pump::{spawn_hit_pump, PumpHandle, HIT_CHANNEL_CAPACITY};
pub use simulator::{SensitivityGrid, SimulatedBackend, SimulationConfig};
