use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::coordinator::Settings;
use crate::plc::PlcOptions;

/// Control-plane configuration. Every knob is a flag and an environment
/// variable with a default, so a bare invocation runs against the stock
/// kiosk wiring.
#[derive(Parser, Debug, Clone)]
#[command(name = "revend", version, about = "Reverse-vending kiosk control plane")]
pub struct Config {
    /// Serial device the PLC link uses.
    #[arg(long, env = "PLC_SERIAL_PORT", default_value = "/dev/ttyUSB0")]
    pub serial_port: String,

    /// Serial baud rate (8-N-1 framing is fixed).
    #[arg(long, env = "PLC_BAUDRATE", default_value_t = 115_200)]
    pub baudrate: u32,

    /// Modbus slave address served to the PLC.
    #[arg(long, env = "PLC_SLAVE_ADDRESS", default_value_t = 2)]
    pub slave_address: u8,

    /// Holding register carrying the command word.
    #[arg(long, env = "PLC_COMMAND_REGISTER", default_value_t = 25)]
    pub command_register: u16,

    /// Holding register carrying the status word.
    #[arg(long, env = "PLC_STATUS_REGISTER", default_value_t = 26)]
    pub status_register: u16,

    /// Carriage motion speed written once at startup.
    #[arg(long, env = "PLC_CARRIAGE_SPEED", default_value_t = 500)]
    pub carriage_speed: u16,

    /// Device poll period in milliseconds.
    #[arg(long, env = "PLC_POLL_MS", default_value_t = 100)]
    pub poll_ms: u64,

    /// WebSocket bind host for the peer hub.
    #[arg(long, env = "WEBSOCKET_HOST", default_value = "localhost")]
    pub websocket_host: String,

    /// WebSocket bind port for the peer hub.
    #[arg(long, env = "WEBSOCKET_PORT", default_value_t = 8765)]
    pub websocket_port: u16,

    /// Directory where fetched photos are stored.
    #[arg(long, env = "PHOTOS_DIR", default_value = "imgs")]
    pub photos_dir: PathBuf,
}

impl Config {
    pub fn plc_options(&self) -> PlcOptions {
        PlcOptions {
            serial_port: self.serial_port.clone(),
            baudrate: self.baudrate,
            slave_address: self.slave_address,
            command_register: self.command_register,
            status_register: self.status_register,
            speed: self.carriage_speed,
        }
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn coordinator_settings(&self) -> Settings {
        Settings {
            photos_dir: self.photos_dir.clone(),
            ..Settings::default()
        }
    }
}
