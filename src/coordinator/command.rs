use serde_json::Value;

/// One operator-backend command, decoded from a JSON frame.
///
/// The wire shape is `{"command": <name>, ...}`; a `container_type` field
/// (or the older `config`) is normalized into the command's parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum AppCommand {
    GetPhoto,
    GetDeviceInfo,
    DeviceInit { config: Option<Value> },
    DumpContainer { container_type: Option<String> },
    ContainerUnloaded { container_type: Option<String> },
    LockDoor,
    UnlockDoor,
    /// Accepted but not implemented; acked as such.
    Stub { name: String },
    /// Direct device-driver passthroughs for diagnostics.
    Bridge(BridgeCommand),
    Unknown { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeCommand {
    FullClearRegister,
    ForceMoveCarriageLeft,
    ForceMoveCarriageRight,
    WeightErrorReset,
    ResetWeightReading,
}

const STUB_COMMANDS: [&str; 5] = [
    "enter_service_mode",
    "exit_service_mode",
    "restore_device",
    "open_shutter",
    "reboot_device",
];

impl AppCommand {
    /// Decode a frame; `None` when it is not JSON or names no command.
    pub fn parse(message: &str) -> Option<AppCommand> {
        let value: Value = serde_json::from_str(message).ok()?;
        let name = value.get("command")?.as_str()?.to_owned();

        let param = value
            .get("container_type")
            .or_else(|| value.get("config"))
            .cloned();
        let param_str = param
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_owned);

        Some(match name.as_str() {
            "get_photo" => AppCommand::GetPhoto,
            "get_device_info" => AppCommand::GetDeviceInfo,
            "device_init" => AppCommand::DeviceInit { config: param },
            "dump_container" => AppCommand::DumpContainer {
                container_type: param_str,
            },
            "container_unloaded" => AppCommand::ContainerUnloaded {
                container_type: param_str,
            },
            "lock_door" => AppCommand::LockDoor,
            "unlock_door" => AppCommand::UnlockDoor,
            "cmd_full_clear_register" => AppCommand::Bridge(BridgeCommand::FullClearRegister),
            "cmd_force_move_carriage_left" => {
                AppCommand::Bridge(BridgeCommand::ForceMoveCarriageLeft)
            }
            "cmd_force_move_carriage_right" => {
                AppCommand::Bridge(BridgeCommand::ForceMoveCarriageRight)
            }
            "cmd_weight_error_reset" => AppCommand::Bridge(BridgeCommand::WeightErrorReset),
            "cmd_reset_weight_reading" => AppCommand::Bridge(BridgeCommand::ResetWeightReading),
            _ if STUB_COMMANDS.contains(&name.as_str()) => AppCommand::Stub { name },
            _ => AppCommand::Unknown { name },
        })
    }

    /// The wire name, for error events and logs.
    pub fn name(&self) -> &str {
        match self {
            AppCommand::GetPhoto => "get_photo",
            AppCommand::GetDeviceInfo => "get_device_info",
            AppCommand::DeviceInit { .. } => "device_init",
            AppCommand::DumpContainer { .. } => "dump_container",
            AppCommand::ContainerUnloaded { .. } => "container_unloaded",
            AppCommand::LockDoor => "lock_door",
            AppCommand::UnlockDoor => "unlock_door",
            AppCommand::Stub { name } | AppCommand::Unknown { name } => name,
            AppCommand::Bridge(BridgeCommand::FullClearRegister) => "cmd_full_clear_register",
            AppCommand::Bridge(BridgeCommand::ForceMoveCarriageLeft) => {
                "cmd_force_move_carriage_left"
            }
            AppCommand::Bridge(BridgeCommand::ForceMoveCarriageRight) => {
                "cmd_force_move_carriage_right"
            }
            AppCommand::Bridge(BridgeCommand::WeightErrorReset) => "cmd_weight_error_reset",
            AppCommand::Bridge(BridgeCommand::ResetWeightReading) => "cmd_reset_weight_reading",
        }
    }
}
