//! Interactive stand-in for the operator backend.
//!
//! Connects to the control plane as the `app` peer, prints every event it
//! receives and turns stdin lines into command frames. Useful for driving a
//! kiosk (or a detached rig) end to end without the real backend.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(name = "backend-sim", about = "Operator-backend simulator")]
struct Args {
    #[arg(long, default_value = "localhost")]
    host: String,
    #[arg(long, default_value_t = 8765)]
    port: u16,
}

fn describe(event: &str) -> &'static str {
    match event {
        "receiver_not_empty" => "receiver occupied",
        "receiver_empty" => "receiver empty",
        "container_detected" => "container detected",
        "container_recognized" => "container recognized",
        "container_not_recognized" => "container NOT recognized",
        "container_accepted" => "container accepted",
        "container_dumped" => "container dumped",
        "container_unloaded_ack" => "bag unloaded",
        "hardware_error" => "HARDWARE ERROR",
        "device_info" => "device info",
        "photo_ready" => "photo ready",
        "restore_device_ack" => "device restored",
        "command_error" => "command error",
        _ => "event",
    }
}

const USAGE: &str = "\
commands:
  get_device_info | get_photo | lock_door | unlock_door
  dump_container <plastic|aluminum>
  container_unloaded <plastic|aluminum>
  device_init <json>
  restore_device | open_shutter | enter_service_mode | exit_service_mode | reboot_device
  raw <frame>       send a frame verbatim
  quit";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let url = format!("ws://{}:{}", args.host, args.port);

    println!("connecting to {url}...");
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut sink, mut events) = ws.split();
    sink.send(Message::text(json!({ "client_id": "app" }).to_string()))
        .await?;
    println!("registered as 'app'\n{USAGE}");

    let printer = tokio::spawn(async move {
        while let Some(Ok(Message::Text(raw))) = events.next().await {
            match serde_json::from_str::<Value>(raw.as_str()) {
                Ok(event) => {
                    let name = event["event"].as_str().unwrap_or("?");
                    println!("<- [{}] {}: {}", describe(name), name, event["data"]);
                }
                Err(_) => println!("<- {raw}"),
            }
        }
        println!("connection closed");
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }

        let (command, param) = match line.split_once(' ') {
            Some((command, param)) => (command, Some(param.trim())),
            None => (line, None),
        };

        let frame = match (command, param) {
            ("raw", Some(payload)) => payload.to_owned(),
            ("device_init", Some(payload)) => match serde_json::from_str::<Value>(payload) {
                Ok(config) => json!({ "command": "device_init", "config": config }).to_string(),
                Err(err) => {
                    println!("config is not JSON: {err}");
                    continue;
                }
            },
            (command, Some(container_type)) => {
                json!({ "command": command, "container_type": container_type }).to_string()
            }
            (command, None) => json!({ "command": command }).to_string(),
        };

        println!("-> {frame}");
        if sink.send(Message::text(frame)).await.is_err() {
            break;
        }
    }

    printer.abort();
    Ok(())
}
