//! Edge-counting programs.
//!
//! A program is plain data: a list of [`Op`]s over the pigpio script
//! machine (accumulator `A`, parameters `p0`..`p9`). The pigpio backend
//! uploads [`EdgeProgram::to_script`]; the simulator runs the same ops
//! through [`EdgeProgram::execute`]. Both shapes open the shutter, count
//! qualifying trigger transitions down in `p0`, close the shutter and store
//! the tick of completion in `p9`:
//!
//! ```text
//! single-edge (p0 = 1)        n-edges (p0 = N)
//! w <shutter> <open>          w <shutter> <open>
//! tag 0                       tag 0
//! wait <trigger mask>         wait <trigger mask>
//! r <trigger>                 r <trigger>
//! jnz 0   (jz 0 if rising)    jnz 0   (jz 0 if rising)
//! dcr p0                      dcr p0
//! w <shutter> <closed>        lda p0
//! tick                        jnz 0
//! sta p9                      w <shutter> <closed>
//! halt                        tick
//!                             sta p9
//!                             halt
//! ```
//!
//! A run stopped at any instruction has counted exactly `N - p0` edges.

use std::fmt;

use async_trait::async_trait;

use crate::backend::{TriggerConfig, TriggerEdge};
use crate::error::{HardwareError, HardwareResult};

/// Number of script parameters.
pub const PARAM_COUNT: usize = 10;

/// Parameter holding the remaining edge count.
pub const COUNT_PARAM: Param = Param(0);

/// Parameter receiving the completion tick.
pub const TICK_PARAM: Param = Param(9);

/// A script parameter `p0`..`p9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param(u8);

impl Param {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// One script instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Write { gpio: u32, level: u32 },
    Tag(u32),
    /// Block until a GPIO in `mask` changes level
    Wait { mask: u32 },
    Read { gpio: u32 },
    JumpIfZero(u32),
    JumpIfNotZero(u32),
    Decrement(Param),
    LoadA(Param),
    StoreA(Param),
    Tick,
    Halt,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write { gpio, level } => write!(f, "w {gpio} {level}"),
            Self::Tag(tag) => write!(f, "tag {tag}"),
            Self::Wait { mask } => write!(f, "wait {mask}"),
            Self::Read { gpio } => write!(f, "r {gpio}"),
            Self::JumpIfZero(tag) => write!(f, "jz {tag}"),
            Self::JumpIfNotZero(tag) => write!(f, "jnz {tag}"),
            Self::Decrement(p) => write!(f, "dcr {p}"),
            Self::LoadA(p) => write!(f, "lda {p}"),
            Self::StoreA(p) => write!(f, "sta {p}"),
            Self::Tick => f.write_str("tick"),
            Self::Halt => f.write_str("halt"),
        }
    }
}

/// Which program variant a batch size needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramShape {
    SingleEdge,
    NEdges(u32),
}

impl ProgramShape {
    pub fn for_batch(hits_per_batch: u32) -> Self {
        if hits_per_batch <= 1 {
            Self::SingleEdge
        } else {
            Self::NEdges(hits_per_batch)
        }
    }

    /// Hits reported by one completed run.
    pub fn hits(&self) -> u32 {
        match self {
            Self::SingleEdge => 1,
            Self::NEdges(n) => *n,
        }
    }

    /// Start parameters passed when the program is run.
    pub fn params(&self) -> Vec<u32> {
        vec![self.hits()]
    }

    /// Registers at the start of a run.
    pub fn registers(&self) -> [i32; PARAM_COUNT] {
        let mut registers = [0i32; PARAM_COUNT];
        for (slot, value) in registers.iter_mut().zip(self.params()) {
            *slot = i32::try_from(value).unwrap_or(i32::MAX);
        }
        registers
    }

    /// Edges counted by a run that ended with `registers`, finished or not.
    pub fn counted(&self, registers: &[i32; PARAM_COUNT]) -> u32 {
        let remaining = registers.get(COUNT_PARAM.index()).copied().unwrap_or(0);
        let remaining = u32::try_from(remaining).unwrap_or(0);
        self.hits().saturating_sub(remaining)
    }
}

/// A compiled edge program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeProgram {
    shape: ProgramShape,
    ops: Vec<Op>,
}

impl EdgeProgram {
    pub fn compile(shape: ProgramShape, config: &TriggerConfig) -> Self {
        let trigger = config.gpio.trigger;
        let shutter = config.gpio.shutter;
        let skip_edge = match config.edge {
            TriggerEdge::Falling => Op::JumpIfNotZero(0),
            TriggerEdge::Rising => Op::JumpIfZero(0),
        };

        let mut ops = vec![
            Op::Write {
                gpio: shutter,
                level: config.shutter_open_level.value(),
            },
            Op::Tag(0),
            Op::Wait {
                mask: 1u32.checked_shl(trigger).unwrap_or(0),
            },
            Op::Read { gpio: trigger },
            skip_edge,
            Op::Decrement(COUNT_PARAM),
        ];
        if let ProgramShape::NEdges(_) = shape {
            ops.extend([Op::LoadA(COUNT_PARAM), Op::JumpIfNotZero(0)]);
        }
        ops.extend([
            Op::Write {
                gpio: shutter,
                level: config.shutter_closed_level().value(),
            },
            Op::Tick,
            Op::StoreA(TICK_PARAM),
            Op::Halt,
        ]);

        Self { shape, ops }
    }

    pub fn shape(&self) -> ProgramShape {
        self.shape
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// pigpio script text.
    pub fn to_script(&self) -> String {
        self.ops
            .iter()
            .map(Op::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn target(&self, tag: u32) -> HardwareResult<usize> {
        self.ops
            .iter()
            .position(|op| *op == Op::Tag(tag))
            .ok_or(HardwareError::UndefinedTag(tag))
    }

    /// Interprets the program against `io`, updating `p` in place.
    ///
    /// The future only makes progress while `io` does; dropping it abandons
    /// the run at its current instruction and leaves `p` as it was there.
    pub async fn execute<I>(&self, io: &mut I, p: &mut [i32; PARAM_COUNT]) -> HardwareResult<()>
    where
        I: ProgramIo + ?Sized,
    {
        let mut a: i32 = 0;
        let mut pc = 0usize;

        while let Some(op) = self.ops.get(pc) {
            pc += 1;
            match *op {
                Op::Write { gpio, level } => io.write(gpio, level).await?,
                Op::Tag(_) => {}
                Op::Wait { mask } => a = io.wait(mask).await? as i32,
                Op::Read { gpio } => a = io.read(gpio).await? as i32,
                Op::JumpIfZero(tag) => {
                    if a == 0 {
                        pc = self.target(tag)?;
                    }
                }
                Op::JumpIfNotZero(tag) => {
                    if a != 0 {
                        pc = self.target(tag)?;
                    }
                }
                Op::Decrement(param) => {
                    if let Some(slot) = p.get_mut(param.index()) {
                        *slot = slot.wrapping_sub(1);
                    }
                }
                Op::LoadA(param) => a = p.get(param.index()).copied().unwrap_or(0),
                Op::StoreA(param) => {
                    if let Some(slot) = p.get_mut(param.index()) {
                        *slot = a;
                    }
                }
                Op::Tick => a = io.tick() as i32,
                Op::Halt => break,
            }
        }
        Ok(())
    }
}

/// GPIO access used by [`EdgeProgram::execute`].
#[async_trait]
pub trait ProgramIo: Send {
    async fn write(&mut self, gpio: u32, level: u32) -> HardwareResult<()>;

    async fn read(&mut self, gpio: u32) -> HardwareResult<u32>;

    /// Waits for a level change on any GPIO in `mask`, returns the changed bits.
    async fn wait(&mut self, mask: u32) -> HardwareResult<u32>;

    /// Microsecond tick, wrapping.
    fn tick(&mut self) -> u32;
}
