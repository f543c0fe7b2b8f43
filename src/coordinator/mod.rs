//! The coordination core: a deterministic state machine fusing device polls,
//! vision verdicts and operator commands into PLC command bits and events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, info, warn};

pub mod command;
pub mod events;
pub mod photo;

use command::{AppCommand, BridgeCommand};
use events::{AppEvents, EdgeMonitor};

use crate::hub::Registry;
use crate::plc::Plc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Idle,
    WaitingVision,
    DumpingPlastic,
    DumpingAluminum,
    Error,
}

impl AppState {
    pub fn as_str(self) -> &'static str {
        match self {
            AppState::Idle => "idle",
            AppState::WaitingVision => "waiting_vision",
            AppState::DumpingPlastic => "dumping_plastic",
            AppState::DumpingAluminum => "dumping_aluminum",
            AppState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Plastic,
    Aluminum,
}

impl ContainerKind {
    pub fn parse(raw: &str) -> Option<ContainerKind> {
        match raw {
            "plastic" => Some(ContainerKind::Plastic),
            "aluminum" => Some(ContainerKind::Aluminum),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ContainerKind::Plastic => "plastic",
            ContainerKind::Aluminum => "aluminum",
        }
    }
}

/// A classifier verdict from the vision peer, which answers with a bare
/// lowercase string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum VisionVerdict {
    Plastic,
    Aluminum,
    Nothing,
    Other(String),
}

impl VisionVerdict {
    fn from_raw(raw: &str) -> VisionVerdict {
        match raw {
            "plastic" => VisionVerdict::Plastic,
            "aluminum" => VisionVerdict::Aluminum,
            "none" => VisionVerdict::Nothing,
            other => VisionVerdict::Other(other.to_owned()),
        }
    }

    fn label(&self) -> &str {
        match self {
            VisionVerdict::Plastic => "plastic",
            VisionVerdict::Aluminum => "aluminum",
            VisionVerdict::Nothing => "none",
            VisionVerdict::Other(raw) => raw,
        }
    }
}

/// Coordinator tuning; threaded through the constructor so rigs and tests can
/// shrink the clocks.
#[derive(Debug, Clone)]
pub struct Settings {
    pub tick_period: Duration,
    pub vision_timeout: Duration,
    pub dump_timeout: Duration,
    pub carriage_reset_timeout: Duration,
    pub photo_timeout: Duration,
    pub photos_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            tick_period: Duration::from_millis(10),
            vision_timeout: Duration::from_secs(2),
            dump_timeout: Duration::from_secs(3),
            carriage_reset_timeout: Duration::from_secs(2),
            photo_timeout: Duration::from_secs(2),
            photos_dir: PathBuf::from("imgs"),
        }
    }
}

pub struct Coordinator {
    plc: Arc<Plc>,
    hub: Arc<Registry>,
    events: AppEvents,
    edges: EdgeMonitor,
    settings: Settings,
    running: Arc<AtomicBool>,

    state: Mutex<AppState>,

    door_locked: bool,
    device_config: Option<Value>,

    current_plc_detection: Option<ContainerKind>,
    pending_vision_response: Option<VisionVerdict>,
    vision_request_time: Option<Instant>,
    dump_started_time: Option<Instant>,
    veil_cleared_time: Option<Instant>,
    prev_veil: bool,
    inference_requested: bool,

    carriage_moving_bottle: bool,
    carriage_moving_bank: bool,
    carriage_moving_start: Option<Instant>,
}

impl Coordinator {
    pub fn new(
        plc: Arc<Plc>,
        hub: Arc<Registry>,
        settings: Settings,
        running: Arc<AtomicBool>,
    ) -> Coordinator {
        if let Err(err) = std::fs::create_dir_all(&settings.photos_dir) {
            warn!(dir = %settings.photos_dir.display(), "photo directory unavailable: {err}");
        }
        Coordinator {
            events: AppEvents::new(Arc::clone(&hub)),
            edges: EdgeMonitor::new(),
            plc,
            hub,
            settings,
            running,
            state: Mutex::new(AppState::Idle),
            door_locked: false,
            device_config: None,
            current_plc_detection: None,
            pending_vision_response: None,
            vision_request_time: None,
            dump_started_time: None,
            veil_cleared_time: None,
            prev_veil: false,
            inference_requested: false,
            carriage_moving_bottle: false,
            carriage_moving_bank: false,
            carriage_moving_start: None,
        }
    }

    pub fn state(&self) -> AppState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: AppState) {
        let mut state = self.state.lock().unwrap();
        if *state != next {
            debug!(from = state.as_str(), to = next.as_str(), "state change");
        }
        *state = next;
    }

    /// Main loop; returns once the running flag drops.
    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick();
            thread::sleep(self.settings.tick_period);
        }
    }

    /// One pass of the coordination loop.
    pub fn tick(&mut self) {
        match self.state() {
            state @ (AppState::DumpingPlastic | AppState::DumpingAluminum) => {
                self.poll_dump(state);
            }
            _ => {}
        }

        self.expire_detection_latches();

        match self.state() {
            AppState::WaitingVision => self.poll_vision(),
            AppState::Error => self.process_error_commands(),
            AppState::Idle => self.process_idle(),
            _ => {}
        }

        self.edges.tick(&self.plc, &self.events);
    }

    /// Completion predicate for the dumping states: the matching side sensor
    /// confirms, or the dump times out into ERROR.
    fn poll_dump(&mut self, state: AppState) {
        let (arrived, kind, counter, error_code, message) = match state {
            AppState::DumpingPlastic => (
                self.plc.left_sensor(),
                ContainerKind::Plastic,
                self.plc.bottle_count(),
                "carriage_left_timeout",
                "Carriage never reached the left sensor",
            ),
            AppState::DumpingAluminum => (
                self.plc.right_sensor(),
                ContainerKind::Aluminum,
                self.plc.bank_count(),
                "carriage_right_timeout",
                "Carriage never reached the right sensor",
            ),
            _ => return,
        };

        if arrived {
            info!(container = kind.as_str(), "dump complete");
            self.plc.full_clear_command();
            self.set_state(AppState::Idle);
            self.dump_started_time = None;
            self.events.emit(
                "container_accepted",
                json!({ "container_type": kind.as_str(), "counter": counter }),
            );
        } else if self
            .dump_started_time
            .is_some_and(|started| started.elapsed() > self.settings.dump_timeout)
        {
            warn!(container = kind.as_str(), "dump timed out");
            self.plc.full_clear_command();
            self.set_state(AppState::Error);
            self.dump_started_time = None;
            self.events.emit(
                "hardware_error",
                json!({ "error_code": error_code, "message": message }),
            );
        }
    }

    /// Lower the detected-container latches once the PLC has had time to act.
    fn expire_detection_latches(&mut self) {
        let expired = self
            .carriage_moving_start
            .is_some_and(|started| started.elapsed() > self.settings.carriage_reset_timeout);
        if !expired {
            return;
        }
        if self.carriage_moving_bottle {
            info!("carriage window elapsed, lowering bottle latch");
            self.plc.clear_bottle_detected();
            self.carriage_moving_bottle = false;
            self.carriage_moving_start = None;
        }
        if self.carriage_moving_bank {
            info!("carriage window elapsed, lowering bank latch");
            self.plc.clear_bank_detected();
            self.carriage_moving_bank = false;
            self.carriage_moving_start = None;
        }
    }

    fn poll_vision(&mut self) {
        let response = self.hub.get_command("vision");
        if !response.is_empty() && self.pending_vision_response.is_none() {
            info!(%response, "vision replied");
            if let Some(cleared) = self.veil_cleared_time.take() {
                debug!(
                    elapsed_ms = cleared.elapsed().as_millis() as u64,
                    "veil clear to vision reply"
                );
            }
            self.pending_vision_response = Some(VisionVerdict::from_raw(&response));
        }

        if self.current_plc_detection.is_none() {
            if self.plc.bottle_exist() {
                info!("device resolved: plastic");
                self.current_plc_detection = Some(ContainerKind::Plastic);
            } else if self.plc.bank_exist() {
                info!("device resolved: aluminum");
                self.current_plc_detection = Some(ContainerKind::Aluminum);
            }
        }

        if self.pending_vision_response.is_some() && self.current_plc_detection.is_some() {
            self.fuse_vision_response();
            self.set_state(AppState::Idle);
            self.vision_request_time = None;
            self.current_plc_detection = None;
            self.pending_vision_response = None;
        } else if self
            .vision_request_time
            .is_some_and(|requested| requested.elapsed() > self.settings.vision_timeout)
        {
            if self.pending_vision_response.is_none() {
                warn!("timed out waiting for vision");
            } else {
                warn!("timed out waiting for the device type");
            }
            if let Some(cleared) = self.veil_cleared_time.take() {
                debug!(
                    elapsed_ms = cleared.elapsed().as_millis() as u64,
                    "veil clear to timeout"
                );
            }
            self.set_state(AppState::Idle);
            self.vision_request_time = None;
            self.current_plc_detection = None;
            self.pending_vision_response = None;
            self.events.emit("container_not_recognized", json!({}));
        }
    }

    /// Couple the classifier verdict to the device detection (both present by
    /// now) and raise the matching PLC latch, or report the disagreement.
    fn fuse_vision_response(&mut self) {
        let (Some(device), Some(vision)) = (
            self.current_plc_detection,
            self.pending_vision_response.clone(),
        ) else {
            return;
        };

        match (device, vision) {
            (_, VisionVerdict::Nothing) => {
                info!("vision saw no container");
                self.events.emit("container_not_recognized", json!({}));
            }
            (ContainerKind::Plastic, VisionVerdict::Plastic) => {
                info!("plastic confirmed");
                self.plc.signal_bottle_detected();
                self.carriage_moving_bottle = true;
                self.carriage_moving_start = Some(Instant::now());
                self.events.emit(
                    "container_recognized",
                    json!({ "container_type": "plastic", "confidence": 1.0 }),
                );
            }
            (ContainerKind::Aluminum, VisionVerdict::Aluminum) => {
                info!("aluminum confirmed");
                self.plc.signal_bank_detected();
                self.carriage_moving_bank = true;
                self.carriage_moving_start = Some(Instant::now());
                self.events.emit(
                    "container_recognized",
                    json!({ "container_type": "aluminum", "confidence": 1.0 }),
                );
            }
            (device, vision) => {
                warn!(
                    device = device.as_str(),
                    vision = vision.label(),
                    "detection disagreement"
                );
                self.events.emit(
                    "container_not_recognized",
                    json!({ "plc_type": device.as_str(), "vision_type": vision.label() }),
                );
            }
        }
    }

    fn process_idle(&mut self) {
        if self.hub.is_just_connected("app") {
            info!("app peer connected, pushing device_info");
            self.push_device_info();
        }

        let veil = self.plc.veil_present();
        let bottle = self.plc.bottle_exist();
        let bank = self.plc.bank_exist();

        // One inference per container occupancy: rearm only after the
        // receiver has been seen empty.
        if !(bottle || bank) {
            self.inference_requested = false;
        }

        if self.prev_veil && !veil && !self.inference_requested {
            self.inference_requested = true;
            let now = Instant::now();
            self.veil_cleared_time = Some(now);
            self.vision_request_time = Some(now);
            self.current_plc_detection = if bottle {
                Some(ContainerKind::Plastic)
            } else if bank {
                Some(ContainerKind::Aluminum)
            } else {
                None
            };

            let label = self
                .current_plc_detection
                .map_or("unknown", ContainerKind::as_str);
            info!(container = label, "veil cleared, requesting inference");
            self.events
                .emit("container_detected", json!({ "container_type": label }));
            // Drop any stale verdict before asking for a fresh one.
            self.hub.get_command("vision");
            self.hub.send("vision", "bottle_exist");
            self.set_state(AppState::WaitingVision);
        }

        if veil {
            self.veil_cleared_time = None;
        }
        self.prev_veil = veil;

        let message = self.hub.get_command("app");
        if !message.is_empty() {
            match AppCommand::parse(&message) {
                Some(command) => self.dispatch(command),
                None => {
                    warn!(%message, "unparseable app frame");
                    self.events
                        .emit("command_error", json!({ "error": "invalid_json" }));
                }
            }
        }
    }

    /// In ERROR only photo, device info, dumping and restore are honored.
    fn process_error_commands(&mut self) {
        let message = self.hub.get_command("app");
        if message.is_empty() {
            return;
        }
        let Some(command) = AppCommand::parse(&message) else {
            warn!(%message, "unparseable app frame");
            return;
        };

        match command {
            AppCommand::GetPhoto => self.spawn_photo_worker(),
            AppCommand::GetDeviceInfo => self.push_device_info(),
            AppCommand::DumpContainer { container_type } => {
                self.handle_dump(container_type.as_deref());
            }
            AppCommand::Stub { ref name } if name == "restore_device" => {
                info!("restore requested, leaving the error state");
                self.set_state(AppState::Idle);
                self.events
                    .emit("restore_device_ack", json!({ "status": "ok" }));
            }
            other => {
                debug!(command = other.name(), "refused while in error state");
                self.events.emit(
                    "command_error",
                    json!({
                        "command": other.name(),
                        "error": "not_allowed_in_error_state",
                    }),
                );
            }
        }
    }

    fn dispatch(&mut self, command: AppCommand) {
        match command {
            AppCommand::GetPhoto => self.spawn_photo_worker(),
            AppCommand::GetDeviceInfo => self.push_device_info(),
            AppCommand::DeviceInit { config } => self.handle_device_init(config),
            AppCommand::DumpContainer { container_type } => {
                self.handle_dump(container_type.as_deref());
            }
            AppCommand::ContainerUnloaded { container_type } => {
                self.handle_container_unloaded(container_type.as_deref());
            }
            AppCommand::LockDoor => {
                info!("door locked");
                self.door_locked = true;
                self.events
                    .emit("up_door_locked", json!({ "status": "ok" }));
            }
            AppCommand::UnlockDoor => {
                info!("door unlocked");
                self.door_locked = false;
                self.events
                    .emit("up_door_unlocked", json!({ "status": "ok" }));
            }
            AppCommand::Stub { name } => {
                debug!(command = %name, "stub command");
                self.events
                    .emit(&format!("{name}_ack"), json!({ "status": "not_implemented" }));
            }
            AppCommand::Bridge(bridge) => match bridge {
                BridgeCommand::FullClearRegister => self.plc.full_clear_command(),
                BridgeCommand::ForceMoveCarriageLeft => self.plc.force_carriage_left(),
                BridgeCommand::ForceMoveCarriageRight => self.plc.force_carriage_right(),
                BridgeCommand::WeightErrorReset => self.plc.reset_weight_error(),
                BridgeCommand::ResetWeightReading => self.plc.reset_weight_reading(),
            },
            AppCommand::Unknown { name } => {
                warn!(command = %name, "unknown app command");
                self.events.emit(
                    "command_error",
                    json!({ "command": name, "error": "unknown_command" }),
                );
            }
        }
    }

    fn handle_device_init(&mut self, config: Option<Value>) {
        let usable = config.as_ref().is_some_and(|value| match value {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            Value::String(raw) => !raw.is_empty(),
            _ => true,
        });
        if !usable {
            warn!("device_init carried no configuration");
            return;
        }
        info!("device configuration stored");
        self.device_config = config;
        self.events
            .emit("device_init_ack", json!({ "status": "ok" }));
    }

    fn handle_dump(&mut self, container_type: Option<&str>) {
        match container_type.and_then(ContainerKind::parse) {
            Some(ContainerKind::Plastic) => {
                info!("dumping plastic (left)");
                self.set_state(AppState::DumpingPlastic);
                self.dump_started_time = Some(Instant::now());
                self.plc.force_carriage_left();
                self.events
                    .emit("container_dumped", json!({ "container_type": "plastic" }));
            }
            Some(ContainerKind::Aluminum) => {
                info!("dumping aluminum (right)");
                self.set_state(AppState::DumpingAluminum);
                self.dump_started_time = Some(Instant::now());
                self.plc.force_carriage_right();
                self.events
                    .emit("container_dumped", json!({ "container_type": "aluminum" }));
            }
            None => warn!(?container_type, "dump with unknown container type"),
        }
    }

    fn handle_container_unloaded(&mut self, container_type: Option<&str>) {
        match container_type.and_then(ContainerKind::parse) {
            Some(ContainerKind::Plastic) => {
                info!("bottle bag unloaded, resetting counter");
                self.plc.reset_bottle_counter();
            }
            Some(ContainerKind::Aluminum) => {
                info!("bank bag unloaded, resetting counter");
                self.plc.reset_bank_counter();
            }
            None => {}
        }
        self.events.emit(
            "container_unloaded_ack",
            json!({ "container_type": container_type }),
        );
    }

    fn push_device_info(&self) {
        let data = json!({
            "bottle_count": self.plc.bottle_count(),
            "bank_count": self.plc.bank_count(),
            "bottle_fill_percent": self.plc.bottle_fill_percent(),
            "bank_fill_percent": self.plc.bank_fill_percent(),
            "state": self.state().as_str(),
            "left_sensor": u8::from(self.plc.left_sensor()),
            "center_sensor": u8::from(self.plc.center_sensor()),
            "right_sensor": u8::from(self.plc.right_sensor()),
            "weight_error": u8::from(self.plc.weight_error()),
            "door_locked": self.door_locked,
        });
        self.events.emit("device_info", data);
    }

    fn spawn_photo_worker(&self) {
        photo::spawn_worker(
            Arc::clone(&self.hub),
            self.events.clone(),
            self.settings.photos_dir.clone(),
            self.settings.photo_timeout,
            Arc::clone(&self.running),
        );
    }
}
