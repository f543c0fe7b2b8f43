//! Driver for the kiosk PLC, reached as a Modbus-RTU slave on a serial line.
//!
//! The PLC firmware masters the bus: it writes the status word and the
//! counter/percent registers into our holding block and polls the command
//! word out of it. Driver calls therefore touch the block, while the wire
//! itself is serviced by the background [`rtu::RtuService`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};

pub mod cell;
pub mod registers;
pub mod rtu;

use cell::RegisterCell;
use registers::{Command, Status};
use rtu::{HoldingBlock, RtuService};

#[derive(Debug, Error)]
pub enum PlcError {
    #[error("register {0} is outside the holding block")]
    AddressOutOfRange(u16),
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("serial i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection parameters for [`Plc::open`].
#[derive(Debug, Clone)]
pub struct PlcOptions {
    pub serial_port: String,
    pub baudrate: u32,
    pub slave_address: u8,
    pub command_register: u16,
    pub status_register: u16,
    pub speed: u16,
}

impl Default for PlcOptions {
    fn default() -> PlcOptions {
        PlcOptions {
            serial_port: "/dev/ttyUSB0".into(),
            baudrate: 115_200,
            slave_address: 2,
            command_register: registers::DEFAULT_COMMAND_REGISTER,
            status_register: registers::DEFAULT_STATUS_REGISTER,
            speed: 500,
        }
    }
}

pub struct Plc {
    block: Arc<HoldingBlock>,
    service: Mutex<Option<RtuService>>,
    // Serializes every driver-level device access so register-to-register
    // ordering is total, not just per-cell.
    io_lock: Mutex<()>,

    status: RegisterCell,
    command: RegisterCell,
    speed: RegisterCell,
    bank_counter: RegisterCell,
    bottle_counter: RegisterCell,
    bottle_percent: RegisterCell,
    bank_percent: RegisterCell,
}

impl Plc {
    /// Open the serial link and start servicing the bus.
    pub fn open(options: &PlcOptions) -> Result<Plc, PlcError> {
        let block = Arc::new(HoldingBlock::new(rtu::BLOCK_BASE, rtu::BLOCK_LEN));
        let service = RtuService::spawn(
            &options.serial_port,
            options.baudrate,
            options.slave_address,
            Arc::clone(&block),
        )?;

        let plc = Plc::with_block(block, Some(service), options);
        plc.speed.set_value(options.speed)?;
        Ok(plc)
    }

    /// Build the driver over a bare holding block, with no serial link.
    ///
    /// Used by tests and bench rigs: writes to the block stand in for the
    /// bus master.
    pub fn detached() -> Plc {
        let block = Arc::new(HoldingBlock::new(rtu::BLOCK_BASE, rtu::BLOCK_LEN));
        Plc::with_block(block, None, &PlcOptions::default())
    }

    fn with_block(
        block: Arc<HoldingBlock>,
        service: Option<RtuService>,
        options: &PlcOptions,
    ) -> Plc {
        Plc {
            status: RegisterCell::new(Arc::clone(&block), options.status_register),
            command: RegisterCell::new(Arc::clone(&block), options.command_register),
            speed: RegisterCell::new(Arc::clone(&block), registers::SPEED_REGISTER),
            bank_counter: RegisterCell::new(Arc::clone(&block), registers::BANK_COUNTER_REGISTER),
            bottle_counter: RegisterCell::new(
                Arc::clone(&block),
                registers::BOTTLE_COUNTER_REGISTER,
            ),
            bottle_percent: RegisterCell::new(
                Arc::clone(&block),
                registers::BOTTLE_PERCENT_REGISTER,
            ),
            bank_percent: RegisterCell::new(Arc::clone(&block), registers::BANK_PERCENT_REGISTER),
            block,
            service: Mutex::new(service),
            io_lock: Mutex::new(()),
        }
    }

    /// The holding block shared with the bus master.
    pub fn block(&self) -> Arc<HoldingBlock> {
        Arc::clone(&self.block)
    }

    /// Refresh status, counters and fill percents in one serialized pass.
    pub fn update(&self) {
        let _io = self.io_lock.lock().unwrap();
        for cell in [
            &self.status,
            &self.bank_counter,
            &self.bottle_counter,
            &self.bottle_percent,
            &self.bank_percent,
        ] {
            if let Err(err) = cell.sync_from_device() {
                warn!(register = cell.address(), "device refresh failed: {err}");
            }
        }
    }

    pub fn stop(&self) {
        if let Some(service) = self.service.lock().unwrap().take() {
            service.stop();
        }
    }

    fn status_word(&self) -> Status {
        Status::from_word(self.status.get_value())
    }

    /// Raw command word, as the bus master currently sees it.
    pub fn command_word(&self) -> Command {
        Command::from_bits_retain(self.command.get_value())
    }

    // Status register decode.

    pub fn veil_present(&self) -> bool {
        self.status_word().contains(Status::VEIL_PRESENT)
    }

    pub fn left_sensor(&self) -> bool {
        self.status_word().contains(Status::LEFT_SENSOR)
    }

    pub fn center_sensor(&self) -> bool {
        self.status_word().contains(Status::CENTER_SENSOR)
    }

    pub fn right_sensor(&self) -> bool {
        self.status_word().contains(Status::RIGHT_SENSOR)
    }

    pub fn unknown_sensor(&self) -> bool {
        self.status_word().contains(Status::UNKNOWN_SENSOR)
    }

    pub fn weight_error(&self) -> bool {
        self.status_word().contains(Status::WEIGHT_ERROR)
    }

    pub fn bank_exist(&self) -> bool {
        self.status_word().contains(Status::BANK_EXIST)
    }

    pub fn bottle_exist(&self) -> bool {
        self.status_word().contains(Status::BOTTLE_EXIST)
    }

    pub fn weight_too_small(&self) -> bool {
        self.status_word().contains(Status::WEIGHT_TOO_SMALL)
    }

    pub fn bottle_weight_ok(&self) -> bool {
        self.status_word().contains(Status::BOTTLE_WEIGHT_OK)
    }

    pub fn bank_weight_ok(&self) -> bool {
        self.status_word().contains(Status::BANK_WEIGHT_OK)
    }

    pub fn working(&self) -> bool {
        self.status_word().contains(Status::WORKING)
    }

    pub fn left_movement_error(&self) -> bool {
        self.status_word().contains(Status::LEFT_MOVEMENT_ERROR)
    }

    pub fn right_movement_error(&self) -> bool {
        self.status_word().contains(Status::RIGHT_MOVEMENT_ERROR)
    }

    // Counter and fill-percent registers.

    pub fn bank_count(&self) -> u16 {
        self.bank_counter.get_value()
    }

    pub fn bottle_count(&self) -> u16 {
        self.bottle_counter.get_value()
    }

    pub fn bottle_fill_percent(&self) -> u16 {
        self.bottle_percent.get_value()
    }

    pub fn bank_fill_percent(&self) -> u16 {
        self.bank_percent.get_value()
    }

    // Command register. A failed write is logged and dropped; the
    // coordinator's timeouts absorb the miss.

    fn set_command(&self, command: Command, level: bool) {
        let _io = self.io_lock.lock().unwrap();
        if let Err(err) = self.command.set_bit(command.bit(), level) {
            error!(?command, "command write failed: {err}");
        }
    }

    pub fn lock_carriage(&self) {
        self.set_command(Command::LOCK_CARRIAGE, true);
    }

    pub fn reset_weight_error(&self) {
        self.set_command(Command::RESET_WEIGHT_ERROR, true);
    }

    pub fn reset_bank_counter(&self) {
        self.set_command(Command::RESET_BANK_COUNTER, true);
    }

    pub fn reset_bottle_counter(&self) {
        self.set_command(Command::RESET_BOTTLE_COUNTER, true);
    }

    pub fn force_carriage_left(&self) {
        self.set_command(Command::MOVE_LEFT, true);
    }

    pub fn force_carriage_right(&self) {
        self.set_command(Command::MOVE_RIGHT, true);
    }

    pub fn signal_bank_detected(&self) {
        self.set_command(Command::DETECTED_BANK, true);
    }

    pub fn signal_bottle_detected(&self) {
        self.set_command(Command::DETECTED_BOTTLE, true);
    }

    pub fn clear_bank_detected(&self) {
        self.set_command(Command::DETECTED_BANK, false);
    }

    pub fn clear_bottle_detected(&self) {
        self.set_command(Command::DETECTED_BOTTLE, false);
    }

    pub fn reset_weight_reading(&self) {
        self.set_command(Command::RESET_WEIGHT_READING, true);
    }

    /// Zero the whole command word.
    pub fn full_clear_command(&self) {
        let _io = self.io_lock.lock().unwrap();
        if let Err(err) = self.command.reset_all_bits() {
            error!("command clear failed: {err}");
        }
    }
}

/// Device poller: refreshes the driver snapshot until shutdown.
pub fn spawn_poller(plc: Arc<Plc>, running: Arc<AtomicBool>, period: Duration) -> JoinHandle<()> {
    thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            plc.update();
            thread::sleep(period);
        }
    })
}
