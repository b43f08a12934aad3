//! Protocol commands
//!
//! Fixed opcode catalogs for the two sub-controllers addressed by the Gen3
//! protocol: the three-axis stage (motherboard) and the toolhead
//! (extruder controller).

use serde::{Deserialize, Serialize};

/// Sub-controller that interprets a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Target {
    /// Three-axis stage
    Stage = 0,
    /// Toolhead / extruder controller
    Toolhead = 1,
}

impl Target {
    /// Wire byte for this target
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/// Commands understood by the three-axis stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageCommand {
    /// Exchange firmware versions
    GetVersion,
    /// Reset the stage to its power-on state
    Init,
    /// Free space in the command queue
    GetAvailableBuffer,
    /// Drop all queued commands
    ClearBuffer,
    /// Current position in steps
    GetPosition,
    /// Axis range in steps
    GetRange,
    /// Store the axis range
    SetRange,
    /// Stop immediately and discard the queue
    Abort,
    /// Toggle the paused state
    Pause,
    /// Move until a probe triggers
    Probe,
    /// Whether the motion queue has drained
    IsFinished,
    /// Watchdog reset of the stage
    Reset,
    /// Queue a move given as per-axis step deltas
    QueuePointRelative,
    /// Queue a move to absolute step coordinates
    QueuePointAbsolute,
    /// Redefine the current position
    SetPosition,
    /// Home towards the minimum endstops
    FindMinimums,
    /// Home towards the maximum endstops
    FindMaximums,
    /// Dwell for a number of milliseconds
    Delay,
    /// Switch the active tool
    ChangeTool,
    /// Block the queue until a tool reports ready
    WaitForTool,
    /// Power the stepper drivers on or off
    EnableAxes,
}

impl StageCommand {
    /// Wire opcode. Queued (buffered) commands have the high bit set.
    pub fn code(self) -> u8 {
        match self {
            StageCommand::GetVersion => 0,
            StageCommand::Init => 1,
            StageCommand::GetAvailableBuffer => 2,
            StageCommand::ClearBuffer => 3,
            StageCommand::GetPosition => 4,
            StageCommand::GetRange => 5,
            StageCommand::SetRange => 6,
            StageCommand::Abort => 7,
            StageCommand::Pause => 8,
            StageCommand::Probe => 9,
            StageCommand::IsFinished => 11,
            StageCommand::Reset => 17,
            StageCommand::QueuePointRelative => 128,
            StageCommand::QueuePointAbsolute => 129,
            StageCommand::SetPosition => 130,
            StageCommand::FindMinimums => 131,
            StageCommand::FindMaximums => 132,
            StageCommand::Delay => 133,
            StageCommand::ChangeTool => 134,
            StageCommand::WaitForTool => 135,
            StageCommand::EnableAxes => 137,
        }
    }

    /// Look up a command by opcode
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Whether the command goes into the motion queue rather than being
    /// answered immediately
    pub fn is_buffered(self) -> bool {
        self.code() & 0x80 != 0
    }

    /// Bytes following the response code in a successful reply
    pub fn response_len(self) -> usize {
        match self {
            StageCommand::GetVersion => 2,
            StageCommand::GetAvailableBuffer => 4,
            StageCommand::IsFinished => 1,
            StageCommand::GetPosition | StageCommand::GetRange | StageCommand::Probe => 12,
            _ => 0,
        }
    }

    /// Every stage command, in opcode order
    pub const ALL: [StageCommand; 21] = [
        StageCommand::GetVersion,
        StageCommand::Init,
        StageCommand::GetAvailableBuffer,
        StageCommand::ClearBuffer,
        StageCommand::GetPosition,
        StageCommand::GetRange,
        StageCommand::SetRange,
        StageCommand::Abort,
        StageCommand::Pause,
        StageCommand::Probe,
        StageCommand::IsFinished,
        StageCommand::Reset,
        StageCommand::QueuePointRelative,
        StageCommand::QueuePointAbsolute,
        StageCommand::SetPosition,
        StageCommand::FindMinimums,
        StageCommand::FindMaximums,
        StageCommand::Delay,
        StageCommand::ChangeTool,
        StageCommand::WaitForTool,
        StageCommand::EnableAxes,
    ];
}

/// Commands understood by the toolhead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolCommand {
    Version,
    Init,
    GetTemp,
    SetTemp,
    SetMotor1Pwm,
    SetMotor2Pwm,
    SetMotor1Rpm,
    SetMotor2Rpm,
    SetMotor1Dir,
    SetMotor2Dir,
    ToggleMotor1,
    ToggleMotor2,
    ToggleFan,
    ToggleValve,
    SetServo1Pos,
    SetServo2Pos,
    FilamentStatus,
    GetMotor1Rpm,
    GetMotor2Rpm,
    GetMotor1Pwm,
    GetMotor2Pwm,
    SelectTool,
    IsToolReady,
    GetPlatformTemp,
    SetPlatformTemp,
}

impl ToolCommand {
    /// Wire opcode
    pub fn code(self) -> u8 {
        match self {
            ToolCommand::Version => 0,
            ToolCommand::Init => 1,
            ToolCommand::GetTemp => 2,
            ToolCommand::SetTemp => 3,
            ToolCommand::SetMotor1Pwm => 4,
            ToolCommand::SetMotor2Pwm => 5,
            ToolCommand::SetMotor1Rpm => 6,
            ToolCommand::SetMotor2Rpm => 7,
            ToolCommand::SetMotor1Dir => 8,
            ToolCommand::SetMotor2Dir => 9,
            ToolCommand::ToggleMotor1 => 10,
            ToolCommand::ToggleMotor2 => 11,
            ToolCommand::ToggleFan => 12,
            ToolCommand::ToggleValve => 13,
            ToolCommand::SetServo1Pos => 14,
            ToolCommand::SetServo2Pos => 15,
            ToolCommand::FilamentStatus => 16,
            ToolCommand::GetMotor1Rpm => 17,
            ToolCommand::GetMotor2Rpm => 18,
            ToolCommand::GetMotor1Pwm => 19,
            ToolCommand::GetMotor2Pwm => 20,
            ToolCommand::SelectTool => 21,
            ToolCommand::IsToolReady => 22,
            ToolCommand::GetPlatformTemp => 30,
            ToolCommand::SetPlatformTemp => 31,
        }
    }

    /// Look up a command by opcode
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Bytes following the response code in a successful reply
    pub fn response_len(self) -> usize {
        match self {
            ToolCommand::Version => 2,
            ToolCommand::GetTemp | ToolCommand::GetPlatformTemp => 2,
            ToolCommand::GetMotor1Rpm | ToolCommand::GetMotor2Rpm => 4,
            ToolCommand::FilamentStatus
            | ToolCommand::GetMotor1Pwm
            | ToolCommand::GetMotor2Pwm
            | ToolCommand::IsToolReady => 1,
            _ => 0,
        }
    }

    /// Every toolhead command, in opcode order
    pub const ALL: [ToolCommand; 25] = [
        ToolCommand::Version,
        ToolCommand::Init,
        ToolCommand::GetTemp,
        ToolCommand::SetTemp,
        ToolCommand::SetMotor1Pwm,
        ToolCommand::SetMotor2Pwm,
        ToolCommand::SetMotor1Rpm,
        ToolCommand::SetMotor2Rpm,
        ToolCommand::SetMotor1Dir,
        ToolCommand::SetMotor2Dir,
        ToolCommand::ToggleMotor1,
        ToolCommand::ToggleMotor2,
        ToolCommand::ToggleFan,
        ToolCommand::ToggleValve,
        ToolCommand::SetServo1Pos,
        ToolCommand::SetServo2Pos,
        ToolCommand::FilamentStatus,
        ToolCommand::GetMotor1Rpm,
        ToolCommand::GetMotor2Rpm,
        ToolCommand::GetMotor1Pwm,
        ToolCommand::GetMotor2Pwm,
        ToolCommand::SelectTool,
        ToolCommand::IsToolReady,
        ToolCommand::GetPlatformTemp,
        ToolCommand::SetPlatformTemp,
    ];
}

/// Expected reply size for a raw `(target, opcode)` pair, when known
pub fn response_len(target: Target, code: u8) -> Option<usize> {
    match target {
        Target::Stage => StageCommand::from_code(code).map(StageCommand::response_len),
        Target::Toolhead => ToolCommand::from_code(code).map(ToolCommand::response_len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_codes() {
        assert_eq!(StageCommand::GetVersion.code(), 0);
        assert_eq!(StageCommand::GetPosition.code(), 4);
        assert_eq!(StageCommand::QueuePointRelative.code(), 128);
        assert_eq!(StageCommand::WaitForTool.code(), 135);
        assert_eq!(StageCommand::IsFinished.code(), 11);
        assert_eq!(StageCommand::Reset.code(), 17);
        assert_eq!(StageCommand::EnableAxes.code(), 137);
        assert_eq!(ToolCommand::GetPlatformTemp.code(), 30);
    }

    #[test]
    fn test_buffered_flag() {
        assert!(StageCommand::QueuePointRelative.is_buffered());
        assert!(StageCommand::Delay.is_buffered());
        assert!(!StageCommand::GetPosition.is_buffered());
        assert!(!StageCommand::Abort.is_buffered());
        assert!(!StageCommand::IsFinished.is_buffered());
        assert!(StageCommand::EnableAxes.is_buffered());
    }

    #[test]
    fn test_codes_are_unique_and_round_trip() {
        for cmd in StageCommand::ALL {
            assert_eq!(StageCommand::from_code(cmd.code()), Some(cmd));
        }
        for cmd in ToolCommand::ALL {
            assert_eq!(ToolCommand::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(StageCommand::from_code(42), None);
    }

    #[test]
    fn test_response_len_lookup() {
        assert_eq!(response_len(Target::Stage, 4), Some(12));
        assert_eq!(response_len(Target::Toolhead, 2), Some(2));
        assert_eq!(response_len(Target::Stage, 0), Some(2));
        assert_eq!(response_len(Target::Stage, 11), Some(1));
        assert_eq!(response_len(Target::Stage, 200), None);
    }
}
