use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::events::AppEvents;
use crate::hub::Registry;

const POLL_PERIOD: Duration = Duration::from_millis(100);

#[derive(Deserialize)]
struct VisionPhotoReply {
    photo_base64: Option<String>,
    error: Option<String>,
    timestamp: Option<String>,
}

/// Fetch a photo from the vision peer without stalling the coordinator.
///
/// One detached worker per request: asks vision for a frame, waits up to
/// `timeout` on the one-shot slot, stores the JPEG and reports the path (the
/// base64 payload itself never reaches the operator backend).
pub fn spawn_worker(
    hub: Arc<Registry>,
    events: AppEvents,
    photos_dir: PathBuf,
    timeout: Duration,
    running: Arc<AtomicBool>,
) {
    thread::spawn(move || run_request(&hub, &events, &photos_dir, timeout, &running));
}

fn run_request(
    hub: &Registry,
    events: &AppEvents,
    photos_dir: &Path,
    timeout: Duration,
    running: &AtomicBool,
) {
    // Discard any stale reply before asking.
    hub.get_command("vision");
    hub.send("vision", r#"{"command": "get_photo"}"#);

    let deadline = Instant::now() + timeout;
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        let response = hub.get_command("vision");
        if response.is_empty() || !response.starts_with('{') {
            thread::sleep(POLL_PERIOD);
            continue;
        }
        match serde_json::from_str::<VisionPhotoReply>(&response) {
            Ok(reply) => {
                if let Some(encoded) = reply.photo_base64 {
                    let mut data = json!({ "timestamp": reply.timestamp });
                    match save_photo(photos_dir, &encoded) {
                        Some(path) => {
                            info!(path = %path.display(), "photo stored");
                            data["photo_path"] = json!(path.display().to_string());
                        }
                        None => data["error"] = json!("save_failed"),
                    }
                    events.emit("photo_ready", data);
                    return;
                }
                if let Some(error) = reply.error {
                    events.emit("photo_ready", json!({ "error": error }));
                    return;
                }
            }
            Err(_) => {}
        }
        thread::sleep(POLL_PERIOD);
    }

    events.emit("photo_ready", json!({ "error": "vision_unavailable" }));
}

fn save_photo(photos_dir: &Path, encoded: &str) -> Option<PathBuf> {
    let image = match BASE64.decode(encoded) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("photo payload is not valid base64: {err}");
            return None;
        }
    };

    let now = jiff::Zoned::now();
    let millis = now.timestamp().as_millisecond().rem_euclid(1000);
    let filename = format!("photo_{}_{millis:03}.jpg", now.strftime("%Y%m%d_%H%M%S"));
    let path = photos_dir.join(filename);

    match std::fs::write(&path, image) {
        Ok(()) => {
            let absolute = path.canonicalize().unwrap_or(path);
            Some(absolute)
        }
        Err(err) => {
            warn!(path = %path.display(), "failed to store photo: {err}");
            None
        }
    }
}
