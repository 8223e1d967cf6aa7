//! Full vistream pipeline demo, no hardware required:
//! 1. Synthetic frame source at a fixed frame rate
//! 2. FrameRelay forwarding every frame, sampling every Nth for "inference"
//! 3. MockVlmClient standing in for a slow VLM backend
//! 4. Telemetry sampler reading real CPU/RAM counters via sysinfo
//! 5. Snapshot reader printing the events a transport would push
//!
//! Usage: cargo run --bin pipeline_demo

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use vistream_cache::{InferenceEvent, StateCache, TelemetryEvent};
use vistream_frame::Frame;
use vistream_relay::{FrameRelay, RelayConfig};
use vistream_telemetry::{Sampler, SamplerConfig, SysProbe};
use vistream_vlm::MockVlmClient;

// Pipeline configuration constants
const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;
const FRAME_RATE: u64 = 30;
const TOTAL_FRAMES: u64 = 300;
const PROCESS_EVERY_N: u32 = 30;
const BACKEND_LATENCY: Duration = Duration::from_millis(400);
const PUSH_PERIOD: Duration = Duration::from_secs(1);

/// Synthetic RGB24 frame: a gradient that scrolls with the frame index
/// so consecutive frames differ.
fn synthetic_frame(index: u64) -> Frame {
    let mut pixels = vec![0u8; (FRAME_WIDTH * FRAME_HEIGHT * 3) as usize];
    for y in 0..FRAME_HEIGHT as usize {
        for x in 0..FRAME_WIDTH as usize {
            let base = (y * FRAME_WIDTH as usize + x) * 3;
            pixels[base] = ((x as u64 + index) % 256) as u8;
            pixels[base + 1] = (y % 256) as u8;
            pixels[base + 2] = ((index * 4) % 256) as u8;
        }
    }
    // the relay reassigns seq at arrival
    Frame::new(0, FRAME_WIDTH, FRAME_HEIGHT, pixels)
}

fn scripted_backend() -> Arc<MockVlmClient> {
    let client = Arc::new(MockVlmClient::new(
        BACKEND_LATENCY,
        "A scrolling color gradient test pattern.",
    ));
    client.push(Ok("A dark test pattern, mostly red and green.".into()));
    client.push(Err("backend briefly unreachable".into()));
    client
}

/// What the (out-of-scope) transport would do on its push cadence:
/// read one snapshot, emit both events as JSON.
async fn push_events(cache: &StateCache) -> Result<()> {
    let snap = cache.snapshot().await;
    if let Some(ev) = InferenceEvent::from_snapshot(&snap) {
        println!("inference {}", serde_json::to_string(&ev)?);
    }
    if let Some(ev) = TelemetryEvent::from_snapshot(&snap) {
        println!("telemetry {}", serde_json::to_string(&ev)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cache = StateCache::default();

    let sampler = Sampler::spawn(
        Box::new(SysProbe::new()),
        cache.clone(),
        SamplerConfig { period: Duration::from_millis(500), failure_threshold: 10 },
    );

    let client = scripted_backend();
    let relay = FrameRelay::new(
        RelayConfig::default()
            .with_every_n(PROCESS_EVERY_N)
            .with_model("mock-vlm")
            .with_prompt("Describe what you see in this image in one sentence."),
        client,
        cache.clone(),
    )?;

    log::info!(
        "relaying {TOTAL_FRAMES} frames at {FRAME_RATE}fps, inference every {PROCESS_EVERY_N}th"
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(1000 / FRAME_RATE));
    let mut last_push = std::time::Instant::now();
    let mut forwarded = 0u64;

    for i in 0..TOTAL_FRAMES {
        ticker.tick().await;
        let frame = relay.submit(synthetic_frame(i));
        forwarded += 1;

        if let Some(text) = &frame.overlay {
            log::debug!("frame {}: overlay {:?}", frame.seq, text);
        }

        // push on the transport cadence without delaying the video path
        if last_push.elapsed() >= PUSH_PERIOD {
            push_events(&cache).await?;
            last_push = std::time::Instant::now();
        }
    }

    // let the last request resolve
    tokio::time::sleep(BACKEND_LATENCY + Duration::from_millis(100)).await;
    push_events(&cache).await?;

    let snap = cache.snapshot().await;
    println!(
        "done: {forwarded} frames forwarded, {} inference calls, mean latency {:.1}ms",
        snap.latency.count, snap.latency.mean_ms
    );
    if let Some(vistream_cache::InferenceOutcome::Text(text)) =
        snap.inference.map(|r| r.outcome)
    {
        println!("final caption:");
        for line in vistream_frame::wrap_overlay(&text, 60) {
            println!("  {line}");
        }
    }

    sampler.abort();
    Ok(())
}
