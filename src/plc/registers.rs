use bitflags::bitflags;

/// Holding-register map shared with the PLC firmware.
pub const BANK_COUNTER_REGISTER: u16 = 20;
pub const BOTTLE_COUNTER_REGISTER: u16 = 21;
pub const BOTTLE_PERCENT_REGISTER: u16 = 22;
pub const BANK_PERCENT_REGISTER: u16 = 23;
pub const SPEED_REGISTER: u16 = 24;
pub const DEFAULT_COMMAND_REGISTER: u16 = 25;
pub const DEFAULT_STATUS_REGISTER: u16 = 26;

bitflags! {
    /// Status word the PLC publishes in register 26.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u16 {
        const VEIL_PRESENT         = 1 << 0;
        const LEFT_SENSOR          = 1 << 1;
        const CENTER_SENSOR        = 1 << 2;
        const RIGHT_SENSOR         = 1 << 3;
        const UNKNOWN_SENSOR       = 1 << 4;
        const WEIGHT_ERROR         = 1 << 5;
        const BANK_EXIST           = 1 << 6;
        const BOTTLE_EXIST         = 1 << 7;
        const WEIGHT_TOO_SMALL     = 1 << 8;
        const BOTTLE_WEIGHT_OK     = 1 << 9;
        const BANK_WEIGHT_OK       = 1 << 10;
        const WORKING              = 1 << 11;
        const LEFT_MOVEMENT_ERROR  = 1 << 12;
        const RIGHT_MOVEMENT_ERROR = 1 << 13;

        const _OTHER = !0;
    }
}

bitflags! {
    /// Command word the PLC consumes from register 25.
    ///
    /// `DETECTED_BANK` and `DETECTED_BOTTLE` are latches: the coordinator
    /// sets them once vision confirms a container and clears them again
    /// after the carriage-reset timeout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        const LOCK_CARRIAGE        = 1 << 0;
        const RESET_WEIGHT_ERROR   = 1 << 1;
        const RESET_BANK_COUNTER   = 1 << 2;
        const RESET_BOTTLE_COUNTER = 1 << 3;
        const MOVE_LEFT            = 1 << 4;
        const MOVE_RIGHT           = 1 << 5;
        const DETECTED_BANK        = 1 << 6;
        const DETECTED_BOTTLE      = 1 << 7;
        const RESET_WEIGHT_READING = 1 << 8;

        const _OTHER = !0;
    }
}

impl Status {
    pub fn from_word(word: u16) -> Status {
        Status::from_bits_retain(word)
    }
}

impl Command {
    pub fn bit(self) -> u8 {
        self.bits().trailing_zeros() as u8
    }
}
