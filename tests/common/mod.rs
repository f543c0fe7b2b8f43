#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use revend::coordinator::{Coordinator, Settings};
use revend::hub::Registry;
use revend::plc::Plc;
use revend::plc::registers::{BOTTLE_COUNTER_REGISTER, BANK_COUNTER_REGISTER, Status};

/// A full coordination rig over a detached driver: writes into the holding
/// block stand in for the bus master, channel receivers stand in for the
/// peer sockets.
pub struct Rig {
    pub plc: Arc<Plc>,
    pub hub: Arc<Registry>,
    pub coordinator: Coordinator,
    pub app_events: UnboundedReceiver<String>,
    pub vision_requests: UnboundedReceiver<String>,
    app_generation: u64,
    vision_generation: u64,
    _photos_dir: tempfile::TempDir,
}

/// Shrunk clocks so timeout scenarios run in milliseconds.
pub fn fast_settings(photos_dir: &tempfile::TempDir) -> Settings {
    Settings {
        tick_period: Duration::from_millis(1),
        vision_timeout: Duration::from_millis(50),
        dump_timeout: Duration::from_millis(80),
        carriage_reset_timeout: Duration::from_millis(60),
        photo_timeout: Duration::from_millis(300),
        photos_dir: photos_dir.path().to_path_buf(),
    }
}

impl Rig {
    pub fn new() -> Rig {
        let photos_dir = tempfile::tempdir().expect("temp dir");
        let settings = fast_settings(&photos_dir);
        Rig::with_settings(settings, photos_dir)
    }

    pub fn with_settings(settings: Settings, photos_dir: tempfile::TempDir) -> Rig {
        let plc = Arc::new(Plc::detached());
        let hub = Arc::new(Registry::new());

        let (app_tx, app_events) = mpsc::unbounded_channel();
        let (vision_tx, vision_requests) = mpsc::unbounded_channel();
        let app_generation = hub.register("app", app_tx);
        let vision_generation = hub.register("vision", vision_tx);
        // Registration arms the just-connected edge; most tests want to
        // start from steady state.
        hub.is_just_connected("app");
        hub.is_just_connected("vision");

        let coordinator = Coordinator::new(
            Arc::clone(&plc),
            Arc::clone(&hub),
            settings,
            Arc::new(AtomicBool::new(true)),
        );

        Rig {
            plc,
            hub,
            coordinator,
            app_events,
            vision_requests,
            app_generation,
            vision_generation,
            _photos_dir: photos_dir,
        }
    }

    pub fn tick(&mut self) {
        self.coordinator.tick();
    }

    /// Write the status word as the bus master would, then refresh the
    /// driver snapshot.
    pub fn set_status(&self, status: Status) {
        self.plc
            .block()
            .write(26, status.bits())
            .expect("status register is inside the block");
        self.plc.update();
    }

    pub fn set_counter(&self, register: u16, value: u16) {
        self.plc
            .block()
            .write(register, value)
            .expect("counter register is inside the block");
        self.plc.update();
    }

    pub fn set_bottle_count(&self, value: u16) {
        self.set_counter(BOTTLE_COUNTER_REGISTER, value);
    }

    pub fn set_bank_count(&self, value: u16) {
        self.set_counter(BANK_COUNTER_REGISTER, value);
    }

    /// Inject a frame as if the app peer had sent it.
    pub fn app_send(&self, message: &str) {
        self.hub.record_message("app", self.app_generation, message);
    }

    /// Inject a classifier verdict as if the vision peer had sent it.
    pub fn vision_send(&self, message: &str) {
        self.hub
            .record_message("vision", self.vision_generation, message);
    }

    /// Reconnect the app peer (evicting the old socket) and return nothing;
    /// `app_events` now observes the new connection.
    pub fn reconnect_app(&mut self) {
        let (app_tx, app_events) = mpsc::unbounded_channel();
        self.app_generation = self.hub.register("app", app_tx);
        self.app_events = app_events;
    }

    /// Drain everything currently queued for the app peer.
    pub fn drain_app_events(&mut self) -> Vec<(String, Value)> {
        let mut events = Vec::new();
        while let Ok(raw) = self.app_events.try_recv() {
            let value: Value = serde_json::from_str(&raw).expect("events are JSON");
            let name = value["event"].as_str().expect("events are named").to_owned();
            events.push((name, value["data"].clone()));
        }
        events
    }

    pub fn next_app_event(&mut self) -> Option<(String, Value)> {
        self.drain_app_events().into_iter().next()
    }

    /// Drain pending inference requests sent to the vision peer.
    pub fn drain_vision_requests(&mut self) -> Vec<String> {
        let mut requests = Vec::new();
        while let Ok(raw) = self.vision_requests.try_recv() {
            requests.push(raw);
        }
        requests
    }
}

/// Event names only, for order assertions.
pub fn names(events: &[(String, Value)]) -> Vec<&str> {
    events.iter().map(|(name, _)| name.as_str()).collect()
}
