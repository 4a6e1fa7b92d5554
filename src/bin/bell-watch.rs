//! Watch a doorbell from the command line: connect, print lifecycle and
//! datapoint events, and surface snapshot URLs when a media DP carries one.
//!
//! Usage: bell-watch <DEVICE_ID> <LOCAL_KEY> <HOST> [VERSION]

use futures_util::StreamExt;
use tuyabell::{DeviceBuilder, DeviceEvent, ProtocolVersion, decode_media_value, extract_image_url};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(id), Some(key), Some(host)) = (args.next(), args.next(), args.next()) else {
        eprintln!("usage: bell-watch <DEVICE_ID> <LOCAL_KEY> <HOST> [VERSION]");
        std::process::exit(2);
    };
    let version: ProtocolVersion = args
        .next()
        .as_deref()
        .unwrap_or("3.3")
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("{e}");
            std::process::exit(2);
        });

    let device = DeviceBuilder::new(id, key)
        .host(host)
        .version(version)
        .build();

    println!("Watching device {} (Ctrl+C to stop)", device.id());
    let events = device.events();
    tokio::pin!(events);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping");
                device.stop();
                break;
            }
            event = events.next() => {
                let Some(event) = event else { break };
                match event {
                    DeviceEvent::Connected { host, .. } => {
                        println!("[connected] {host}");
                    }
                    DeviceEvent::Disconnected { error, .. } => {
                        match error {
                            Some(e) => println!("[disconnected] {e}"),
                            None => println!("[disconnected]"),
                        }
                    }
                    DeviceEvent::Datapoints(batch) => {
                        for (dp, value) in &batch.dps {
                            println!("[dp {dp}] {value}");
                            if let Some(media) = decode_media_value(value) {
                                if let Some(url) = extract_image_url(&media) {
                                    println!("[dp {dp}] snapshot: {url}");
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
