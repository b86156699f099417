//! Loopback - a viewer and a compute module over an in-memory stream.
//!
//! This example demonstrates:
//! - Spawning two connections on either end of a duplex pipe
//! - A JSON request answered with a JSON result
//! - A binary request answered with a checksum promise plus data
//!
//! Run with `RUST_LOG=imgwire=debug cargo run --example loopback` to see
//! frame-level logging.

use imgwire::codec::Role;
use imgwire::correlation::Reply;
use imgwire::{Connection, Link};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Synthetic 64x64 slice.
fn render_slice(index: u64) -> Vec<u8> {
    (0..64 * 64u64).map(|i| ((i + index) % 256) as u8).collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (viewer_io, module_io) = tokio::io::duplex(256 * 1024);
    let viewer = Connection::spawn(viewer_io, Link::new(Role::Client));
    let mut module = Connection::spawn(module_io, Link::new(Role::Server));

    // Compute module: answer until the viewer goes away.
    let worker = tokio::spawn(async move {
        let handle = module.handle();
        while let Some(request) = module.next_event().await {
            let Some(id) = request.payload["id"].as_u64() else {
                continue;
            };
            let result = match request.kind.as_str() {
                "metadata" => handle
                    .respond(id, &json!({"width": 64, "height": 64, "slices": 32}))
                    .await,
                "loadSlice" => {
                    let index = request.payload["data"]["index"].as_u64().unwrap_or(0);
                    handle.respond_binary(id, &render_slice(index)).await
                }
                other => handle.respond_error(id, &format!("unknown request {other}")).await,
            };
            if let Err(e) = result {
                tracing::error!("respond failed: {}", e);
            }
        }
    });

    let handle = viewer.handle();

    let metadata = handle.request("metadata", &json!({"path": "demo.nii"})).await?;
    println!("metadata: {:?}", metadata);

    for index in 0..3 {
        match handle.request("loadSlice", &json!({"index": index})).await? {
            Reply::Binary(data) => println!("slice {}: {} bytes", index, data.len()),
            Reply::Json(value) => println!("slice {}: unexpected json {}", index, value),
        }
    }

    if let Err(e) = handle.request("segment", &json!({})).await {
        println!("segment: {}", e);
    }

    drop(handle);
    drop(viewer);
    worker.await?;

    Ok(())
}
