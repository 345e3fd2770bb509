//! Command table
//!
//! The controller exposes its registers through a fixed table of command ids.
//! Each per-channel parameter has an adjacent get/set pair; a few parameters
//! are read-only and one is device-wide. The table is built at compile time
//! and looked up by `(channel, parameter, access)`.

use std::fmt;

use super::frame::{Frame, PayloadWidth};
use super::CHANNEL_COUNT;

/// First id of the per-channel "run finished" signals (200..=203)
pub const SIGNAL_FINISHED_BASE: u8 = 200;
/// Controller finished booting
pub const SIGNAL_BOOTED: u8 = 252;
/// Set command acknowledged
pub const SIGNAL_ACK: u8 = 253;
/// Controller rejected the last command id
pub const SIGNAL_COMMAND_ERROR: u8 = 254;
/// Controller received a frame with a bad checksum
pub const SIGNAL_CHECKSUM_ERROR: u8 = 255;
/// Ids at or above this value are never ordinary get/set commands
pub const RESERVED_ID_START: u8 = 200;

/// Number of commands in the table
pub const COMMAND_COUNT: usize = 69;

/// Per-channel registers with get/set pairs, in wire order
const PAIRED: [Parameter; 7] = [
    Parameter::Running,
    Parameter::Steps,
    Parameter::TargetSteps,
    Parameter::StepInterval,
    Parameter::FiniteMode,
    Parameter::Direction,
    Parameter::Enabled,
];

const PARAMETER_COUNT: usize = 10;
const UNASSIGNED: u8 = u8::MAX;

/// Logical register exposed by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// Motor is stepping
    Running,
    /// Remaining steps of a finite run (setting it also sets the target)
    Steps,
    /// Step count the current finite run started with
    TargetSteps,
    /// Timer ticks between step pulses
    StepInterval,
    /// Finite (1) or continuous (0) run mode
    FiniteMode,
    /// Direction pin state
    Direction,
    /// Driver enabled
    Enabled,
    /// Channel supports changing the microstep exponent (read-only)
    VarMicrostepSupport,
    /// Microstep exponent (2^n microsteps)
    MicrostepExponent,
    /// Sub-microsecond tick divider of the controller timer (device-wide, read-only)
    SubUsDivider,
}

impl Parameter {
    /// Wire width of the parameter's value
    pub const fn width(self) -> PayloadWidth {
        match self {
            Parameter::Steps
            | Parameter::TargetSteps
            | Parameter::StepInterval
            | Parameter::SubUsDivider => PayloadWidth::FourBytes,
            _ => PayloadWidth::OneByte,
        }
    }

    /// Register name used in command names and logs
    pub const fn name(self) -> &'static str {
        match self {
            Parameter::Running => "running",
            Parameter::Steps => "steps",
            Parameter::TargetSteps => "target_steps",
            Parameter::StepInterval => "step_interval",
            Parameter::FiniteMode => "finite_mode",
            Parameter::Direction => "dir",
            Parameter::Enabled => "enabled",
            Parameter::VarMicrostepSupport => "var_ustep_support",
            Parameter::MicrostepExponent => "usteps_exp",
            Parameter::SubUsDivider => "sub_us_divider",
        }
    }
}

/// Read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Get,
    Set,
}

/// One row of the command table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEntry {
    /// Command id sent as the first frame byte
    pub id: u8,
    /// Channel the command addresses, `None` for device-wide commands
    pub channel: Option<u8>,
    /// Register addressed
    pub parameter: Parameter,
    /// Get or set
    pub access: Access,
    /// Payload width of the value
    pub width: PayloadWidth,
}

impl CommandEntry {
    const EMPTY: CommandEntry = CommandEntry {
        id: UNASSIGNED,
        channel: None,
        parameter: Parameter::SubUsDivider,
        access: Access::Get,
        width: PayloadWidth::OneByte,
    };

    /// Request frame for a get command
    pub fn request(&self) -> Frame {
        Frame::command(self.id)
    }
}

impl fmt::Display for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = match self.access {
            Access::Get => "get",
            Access::Set => "set",
        };
        match self.channel {
            Some(channel) => write!(f, "{}_m{}_{}", access, channel, self.parameter.name()),
            None => write!(f, "{}_{}", access, self.parameter.name()),
        }
    }
}

/// The complete command table
pub struct CommandTable {
    entries: [CommandEntry; COMMAND_COUNT],
    by_channel: [[[u8; 2]; PARAMETER_COUNT]; CHANNEL_COUNT],
    sub_us_divider: u8,
}

/// Command table of the pump controller firmware
pub static COMMAND_TABLE: CommandTable = CommandTable::build();

impl CommandTable {
    const fn build() -> Self {
        let mut table = CommandTable {
            entries: [CommandEntry::EMPTY; COMMAND_COUNT],
            by_channel: [[[UNASSIGNED; 2]; PARAMETER_COUNT]; CHANNEL_COUNT],
            sub_us_divider: UNASSIGNED,
        };

        // 0..=55: seven get/set pairs per channel
        let mut channel = 0;
        while channel < CHANNEL_COUNT {
            let mut p = 0;
            while p < PAIRED.len() {
                let get = (channel * PAIRED.len() * 2 + p * 2) as u8;
                table = table.insert(get, Some(channel as u8), PAIRED[p], Access::Get);
                table = table.insert(get + 1, Some(channel as u8), PAIRED[p], Access::Set);
                p += 1;
            }
            channel += 1;
        }

        // 56..=59: variable microstepping support, read-only
        let mut channel = 0;
        while channel < CHANNEL_COUNT {
            let id = 56 + channel as u8;
            table = table.insert(id, Some(channel as u8), Parameter::VarMicrostepSupport, Access::Get);
            channel += 1;
        }

        // 60..=67: microstep exponent get/set pairs
        let mut channel = 0;
        while channel < CHANNEL_COUNT {
            let id = 60 + (channel * 2) as u8;
            table = table.insert(id, Some(channel as u8), Parameter::MicrostepExponent, Access::Get);
            table = table.insert(id + 1, Some(channel as u8), Parameter::MicrostepExponent, Access::Set);
            channel += 1;
        }

        table.insert(68, None, Parameter::SubUsDivider, Access::Get)
    }

    const fn insert(
        mut self,
        id: u8,
        channel: Option<u8>,
        parameter: Parameter,
        access: Access,
    ) -> Self {
        self.entries[id as usize] = CommandEntry {
            id,
            channel,
            parameter,
            access,
            width: parameter.width(),
        };
        match channel {
            Some(c) => {
                let slot = match access {
                    Access::Get => 0,
                    Access::Set => 1,
                };
                self.by_channel[c as usize][parameter as usize][slot] = id;
            }
            None => self.sub_us_divider = id,
        }
        self
    }

    /// Look up a per-channel command
    pub fn channel_command(
        &self,
        channel: usize,
        parameter: Parameter,
        access: Access,
    ) -> Option<CommandEntry> {
        let slot = match access {
            Access::Get => 0,
            Access::Set => 1,
        };
        let id = *self.by_channel.get(channel)?.get(parameter as usize)?.get(slot)?;
        self.by_id(id)
    }

    /// Command reading the device-wide sub-microsecond tick divider
    pub fn sub_us_divider(&self) -> CommandEntry {
        self.entries[self.sub_us_divider as usize]
    }

    /// Look up a command by its wire id
    pub fn by_id(&self, id: u8) -> Option<CommandEntry> {
        self.entries.get(id as usize).copied()
    }

    /// All commands, ordered by id
    pub fn entries(&self) -> &[CommandEntry] {
        &self.entries
    }
}

/// Classification of a frame received from the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming {
    /// Controller received a corrupted frame from us
    ChecksumError,
    /// Controller rejected the command id
    CommandError,
    /// Set command acknowledged
    Ack,
    /// Controller booted
    Booted,
    /// Finite run of the given channel completed
    Finished(usize),
    /// Reserved id without a meaning
    Unknown(u8),
    /// Value reply to a get command
    Response(Frame),
}

impl Incoming {
    /// Classify a validated frame by its id
    pub fn classify(frame: Frame) -> Self {
        match frame.id {
            SIGNAL_CHECKSUM_ERROR => Incoming::ChecksumError,
            SIGNAL_COMMAND_ERROR => Incoming::CommandError,
            SIGNAL_ACK => Incoming::Ack,
            SIGNAL_BOOTED => Incoming::Booted,
            id if (SIGNAL_FINISHED_BASE..SIGNAL_FINISHED_BASE + CHANNEL_COUNT as u8)
                .contains(&id) =>
            {
                Incoming::Finished((id - SIGNAL_FINISHED_BASE) as usize)
            }
            id if id >= RESERVED_ID_START => Incoming::Unknown(id),
            _ => Incoming::Response(frame),
        }
    }
}
