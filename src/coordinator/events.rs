use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use crate::hub::Registry;
use crate::plc::Plc;

/// Wrap an event for the wire: `{"event", "data", "timestamp"}` with an
/// ISO-8601 timestamp.
pub fn envelope(event: &str, data: Value) -> String {
    json!({
        "event": event,
        "data": data,
        "timestamp": jiff::Timestamp::now().to_string(),
    })
    .to_string()
}

/// Event sink for the operator backend (`app` peer).
#[derive(Clone)]
pub struct AppEvents {
    hub: Arc<Registry>,
}

impl AppEvents {
    pub fn new(hub: Arc<Registry>) -> AppEvents {
        AppEvents { hub }
    }

    pub fn emit(&self, event: &str, data: Value) {
        debug!(event, %data, "event -> app");
        self.hub.send("app", &envelope(event, data));
    }
}

/// Edge detector over the polled device snapshot.
///
/// Occupancy reports both edges; the latched error bits report rising edges
/// only, so a held-high fault produces exactly one event.
pub struct EdgeMonitor {
    receiver_occupied: bool,
    weight_error: bool,
    weight_too_small: bool,
    left_movement_error: bool,
    right_movement_error: bool,
}

impl EdgeMonitor {
    pub fn new() -> EdgeMonitor {
        EdgeMonitor {
            receiver_occupied: false,
            weight_error: false,
            weight_too_small: false,
            left_movement_error: false,
            right_movement_error: false,
        }
    }

    pub fn tick(&mut self, plc: &Plc, events: &AppEvents) {
        let bottle = plc.bottle_exist();
        let bank = plc.bank_exist();
        let occupied = bottle || bank;
        if occupied != self.receiver_occupied {
            if occupied {
                events.emit(
                    "receiver_not_empty",
                    json!({
                        "bottle_exist": u8::from(bottle),
                        "bank_exist": u8::from(bank),
                    }),
                );
            } else {
                events.emit("receiver_empty", json!({}));
            }
            self.receiver_occupied = occupied;
        }

        let faults: [(&mut bool, bool, &str, &str); 4] = [
            (
                &mut self.weight_error,
                plc.weight_error(),
                "weight_error",
                "Weighing failed",
            ),
            (
                &mut self.weight_too_small,
                plc.weight_too_small(),
                "weight_too_small",
                "Container weight below threshold",
            ),
            (
                &mut self.left_movement_error,
                plc.left_movement_error(),
                "left_movement_error",
                "Carriage failed moving left",
            ),
            (
                &mut self.right_movement_error,
                plc.right_movement_error(),
                "right_movement_error",
                "Carriage failed moving right",
            ),
        ];
        for (prev, current, error_code, message) in faults {
            if current && !*prev {
                events.emit(
                    "hardware_error",
                    json!({ "error_code": error_code, "message": message }),
                );
            }
            *prev = current;
        }
    }
}
