//! Control plane for a reverse-vending recycling kiosk.
//!
//! The kiosk hardware (carriage, light veil, weight sensors, bin counters)
//! sits behind a PLC reached over Modbus-RTU; an image classifier and the
//! operator backend attach over WebSocket. This crate owns the coordination
//! between the three: the [`plc`] driver, the [`hub`] peer multiplexer and
//! the [`coordinator`] state machine.

pub mod config;
pub mod coordinator;
pub mod hub;
pub mod plc;
