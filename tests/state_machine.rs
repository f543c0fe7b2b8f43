mod common;

use std::thread;
use std::time::Duration;

use common::{Rig, names};
use revend::coordinator::AppState;
use revend::plc::registers::{Command, Status};
use serde_json::json;

#[test]
fn accepts_plastic_end_to_end() {
    let mut rig = Rig::new();

    // A bottle lands in the receiver.
    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["receiver_not_empty"]);
    assert_eq!(events[0].1["bottle_exist"], 1);

    // The veil is crossed and released.
    rig.set_status(Status::BOTTLE_EXIST | Status::VEIL_PRESENT);
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();

    assert_eq!(rig.coordinator.state(), AppState::WaitingVision);
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["container_detected"]);
    assert_eq!(events[0].1["container_type"], "plastic");
    assert_eq!(rig.drain_vision_requests(), ["bottle_exist"]);

    // Vision agrees: the bottle latch goes up.
    rig.vision_send("plastic");
    rig.tick();
    assert_eq!(rig.coordinator.state(), AppState::Idle);
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["container_recognized"]);
    assert_eq!(events[0].1["container_type"], "plastic");
    assert!(rig.plc.command_word().contains(Command::DETECTED_BOTTLE));

    // The backend asks for the dump.
    rig.app_send(r#"{"command": "dump_container", "container_type": "plastic"}"#);
    rig.tick();
    assert_eq!(rig.coordinator.state(), AppState::DumpingPlastic);
    assert!(rig.plc.command_word().contains(Command::MOVE_LEFT));
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["container_dumped"]);

    // The carriage reaches the left sensor; the bottle is gone.
    rig.set_bottle_count(7);
    rig.set_status(Status::LEFT_SENSOR);
    rig.tick();
    assert_eq!(rig.coordinator.state(), AppState::Idle);
    assert!(rig.plc.command_word().is_empty());
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["container_accepted", "receiver_empty"]);
    assert_eq!(events[0].1["container_type"], "plastic");
    assert_eq!(events[0].1["counter"], 7);
}

#[test]
fn vision_timeout_returns_to_idle() {
    let mut rig = Rig::new();

    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST | Status::VEIL_PRESENT);
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();
    assert_eq!(rig.coordinator.state(), AppState::WaitingVision);
    rig.drain_app_events();

    // Vision stays silent past the deadline.
    thread::sleep(Duration::from_millis(70));
    rig.tick();

    assert_eq!(rig.coordinator.state(), AppState::Idle);
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["container_not_recognized"]);
    assert_eq!(events[0].1, json!({}));
    assert!(rig.plc.command_word().is_empty());
}

#[test]
fn dump_timeout_enters_error_state() {
    let mut rig = Rig::new();

    rig.app_send(r#"{"command": "dump_container", "container_type": "plastic"}"#);
    rig.tick();
    assert_eq!(rig.coordinator.state(), AppState::DumpingPlastic);
    rig.drain_app_events();

    // The left sensor never asserts.
    thread::sleep(Duration::from_millis(100));
    rig.tick();

    assert_eq!(rig.coordinator.state(), AppState::Error);
    assert!(rig.plc.command_word().is_empty());
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["hardware_error"]);
    assert_eq!(events[0].1["error_code"], "carriage_left_timeout");

    // Most commands are refused while in error.
    rig.app_send(r#"{"command": "open_shutter"}"#);
    rig.tick();
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["command_error"]);
    assert_eq!(events[0].1["error"], "not_allowed_in_error_state");
    assert_eq!(events[0].1["command"], "open_shutter");

    // restore_device is the way out.
    rig.app_send(r#"{"command": "restore_device"}"#);
    rig.tick();
    assert_eq!(rig.coordinator.state(), AppState::Idle);
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["restore_device_ack"]);
    assert_eq!(events[0].1["status"], "ok");
}

#[test]
fn detection_disagreement_rejects_container() {
    let mut rig = Rig::new();

    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST | Status::VEIL_PRESENT);
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();
    rig.drain_app_events();

    rig.vision_send("aluminum");
    rig.tick();

    assert_eq!(rig.coordinator.state(), AppState::Idle);
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["container_not_recognized"]);
    assert_eq!(events[0].1["plc_type"], "plastic");
    assert_eq!(events[0].1["vision_type"], "aluminum");
    assert!(!rig.plc.command_word().contains(Command::DETECTED_BOTTLE));
    assert!(!rig.plc.command_word().contains(Command::DETECTED_BANK));
}

#[test]
fn second_veil_edge_does_not_rearm() {
    let mut rig = Rig::new();

    // First pass: detect, recognize, back to idle with the bottle still
    // sitting in the receiver.
    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST | Status::VEIL_PRESENT);
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();
    rig.vision_send("plastic");
    rig.tick();
    assert_eq!(rig.coordinator.state(), AppState::Idle);
    rig.drain_app_events();
    rig.drain_vision_requests();

    // Another veil cycle with the same container must not re-arm.
    rig.set_status(Status::BOTTLE_EXIST | Status::VEIL_PRESENT);
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();
    assert_eq!(rig.coordinator.state(), AppState::Idle);
    assert!(rig.drain_vision_requests().is_empty());

    // Once the receiver has been seen empty, the next veil edge arms again.
    rig.set_status(Status::empty());
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST | Status::VEIL_PRESENT);
    rig.tick();
    rig.set_status(Status::BOTTLE_EXIST);
    rig.tick();
    assert_eq!(rig.coordinator.state(), AppState::WaitingVision);
    assert_eq!(rig.drain_vision_requests(), ["bottle_exist"]);
}

#[test]
fn app_connect_pushes_device_info() {
    let mut rig = Rig::new();
    rig.tick();
    rig.drain_app_events();

    rig.reconnect_app();
    rig.tick();

    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["device_info"]);
    assert_eq!(events[0].1["state"], "idle");
}

#[test]
fn detection_latch_drops_after_carriage_window() {
    let mut rig = Rig::new();

    rig.set_status(Status::BANK_EXIST);
    rig.tick();
    rig.set_status(Status::BANK_EXIST | Status::VEIL_PRESENT);
    rig.tick();
    rig.set_status(Status::BANK_EXIST);
    rig.tick();
    rig.vision_send("aluminum");
    rig.tick();
    assert!(rig.plc.command_word().contains(Command::DETECTED_BANK));

    thread::sleep(Duration::from_millis(80));
    rig.tick();
    assert!(!rig.plc.command_word().contains(Command::DETECTED_BANK));
}

#[test]
fn held_error_bit_emits_single_event() {
    let mut rig = Rig::new();

    rig.set_status(Status::WEIGHT_ERROR);
    rig.tick();
    rig.tick();
    rig.tick();

    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["hardware_error"]);
    assert_eq!(events[0].1["error_code"], "weight_error");
    assert_eq!(rig.coordinator.state(), AppState::Idle);

    // Falling then rising again reports once more.
    rig.set_status(Status::empty());
    rig.tick();
    rig.set_status(Status::WEIGHT_ERROR);
    rig.tick();
    let events = rig.drain_app_events();
    assert_eq!(names(&events), ["hardware_error"]);
}
