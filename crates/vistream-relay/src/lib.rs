// vistream-relay/src/lib.rs
// ============================================================
// vistream-relay  –  Frame relay & inference scheduler
// Forwards every incoming frame with minimal added latency and,
// every Nth frame, offers the frame to a single-slot inference
// pipeline.  At most one VLM call is ever outstanding; eligible
// frames that find the slot busy are dropped from inference
// consideration (the video path still forwards them).
// ------------------------------------------------------------
// Public API
//   * FrameRelay::new(cfg, client, cache) – spawn the worker
//   * FrameRelay::submit(frame)           – one call per frame
//   * FrameRelay::apply_control[_json]    – live reconfiguration
// ------------------------------------------------------------
// Build notes
//   * submit() is synchronous and never awaits: the overlay text
//     comes from a watch channel, the inference hand-off is a
//     try_send.  A hung backend cannot stall the video path.
// ============================================================

//! vistream – scheduling layer
//!
//! The in-flight invariant is structural, not conventional: the slot is
//! an atomic flag acquired by `submit` at the decision instant and
//! released by a drop guard in the worker, so every exit path (success,
//! backend error, client-side timeout, task cancellation) frees it.
//! Requests travel over a capacity-1 mailbox the flag guards, so the
//! mailbox can never hold a second request behind an in-flight one.
//!
//! The overlay attached to forwarded frames is always the latest
//! *resolved* result, never the result for the current frame; the
//! display is eventually consistent by design.

mod config;

pub use config::{ConfigError, ControlMsg, RelayConfig};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tokio::sync::{mpsc, watch};
use vistream_cache::{InferenceOutcome, InferenceRecord, StateCache};
use vistream_frame::Frame;
use vistream_vlm::{VlmClient, VlmRequest};

/// Consecutive worker failures that trigger a (non-fatal) warning.
const FAILURE_WARN_STREAK: u32 = 3;

pub struct FrameRelay {
    config: Mutex<RelayConfig>,
    counter: AtomicU64,
    in_flight: Arc<AtomicBool>,
    tx: mpsc::Sender<VlmRequest>,
    overlay_rx: watch::Receiver<Option<String>>,
}

impl FrameRelay {
    /// Validate `cfg` and spawn the inference worker.  Must be called
    /// from within a tokio runtime.  Dropping the relay closes the
    /// mailbox and the worker winds down on its own.
    pub fn new(
        cfg: RelayConfig,
        client: Arc<dyn VlmClient>,
        cache: StateCache,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;

        let (tx, rx) = mpsc::channel(1);
        let (overlay_tx, overlay_rx) = watch::channel(None);
        let in_flight = Arc::new(AtomicBool::new(false));

        tokio::spawn(worker_loop(rx, client, cache, overlay_tx, in_flight.clone()));

        Ok(Self {
            config: Mutex::new(cfg),
            counter: AtomicU64::new(0),
            in_flight,
            tx,
            overlay_rx,
        })
    }

    /// Forward one frame.  Called once per arriving frame, in arrival
    /// order.  Assigns the sequence number, attaches the latest
    /// resolved overlay, and independently decides whether this frame
    /// enters the inference slot.  Never blocks on inference.
    pub fn submit(&self, mut frame: Frame) -> Frame {
        let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        frame.seq = count;

        // forwarding side effect first
        if let Some(text) = self.overlay_rx.borrow().clone() {
            frame = frame.with_overlay(text);
        }

        let cfg = self.config.lock().unwrap().clone();
        if count % cfg.every_n as u64 == 0 {
            self.try_dispatch(&frame, &cfg);
        }

        frame
    }

    /// Hand the frame to the worker iff the slot is free.  Busy slot
    /// means this frame is simply not considered for inference.
    fn try_dispatch(&self, frame: &Frame, cfg: &RelayConfig) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("frame {}: inference slot busy, skipping", frame.seq);
            return;
        }

        let req = VlmRequest {
            frame: frame.clone(),
            prompt: cfg.prompt.clone(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
        };

        // the flag guards the mailbox, so this only fails if the worker
        // is gone (runtime shutdown)
        if let Err(e) = self.tx.try_send(req) {
            self.in_flight.store(false, Ordering::SeqCst);
            log::warn!("inference worker unavailable: {e}");
        } else {
            log::debug!("frame {} submitted for inference", frame.seq);
        }
    }

    /// Whether an inference request is currently outstanding.
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Current configuration (a copy).
    pub fn config(&self) -> RelayConfig {
        self.config.lock().unwrap().clone()
    }

    /// Apply a control message.  All-or-nothing: any invalid field
    /// rejects the whole message and the prior configuration stays in
    /// force.  Takes effect at the next frame evaluation; an in-flight
    /// request is never invalidated.
    pub fn apply_control(&self, msg: &ControlMsg) -> Result<(), ConfigError> {
        let mut cfg = self.config.lock().unwrap();
        let next = msg.applied_to(&cfg)?;
        *cfg = next;
        Ok(())
    }

    /// Parse and apply a raw JSON control message.  Unknown fields are
    /// ignored, malformed JSON is rejected.
    pub fn apply_control_json(&self, raw: &str) -> Result<(), ConfigError> {
        let msg: ControlMsg =
            serde_json::from_str(raw).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        self.apply_control(&msg)
    }
}

/// Releases the inference slot when dropped, whatever the exit path.
struct SlotRelease(Arc<AtomicBool>);

impl Drop for SlotRelease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<VlmRequest>,
    client: Arc<dyn VlmClient>,
    cache: StateCache,
    overlay_tx: watch::Sender<Option<String>>,
    in_flight: Arc<AtomicBool>,
) {
    let mut failure_streak = 0u32;

    while let Some(req) = rx.recv().await {
        // declared first so it drops last: the slot frees only after
        // the record is in the cache
        let _slot = SlotRelease(in_flight.clone());

        let started = Instant::now();
        let result = client.describe(&req).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let record = match result {
            Ok(out) => {
                failure_streak = 0;
                let _ = overlay_tx.send(Some(out.text.clone()));
                InferenceRecord {
                    model: req.model,
                    prompt: req.prompt,
                    outcome: InferenceOutcome::Text(out.text),
                    latency_ms,
                    prompt_tokens: out.prompt_tokens,
                    completion_tokens: out.completion_tokens,
                    created_at: SystemTime::now(),
                }
            }
            Err(e) => {
                failure_streak += 1;
                if failure_streak == FAILURE_WARN_STREAK {
                    log::warn!("{FAILURE_WARN_STREAK} consecutive inference failures, latest: {e}");
                }
                let msg = e.to_string();
                let _ = overlay_tx.send(Some(format!("[inference error: {msg}]")));
                InferenceRecord {
                    model: req.model,
                    prompt: req.prompt,
                    outcome: InferenceOutcome::Error(msg),
                    latency_ms,
                    prompt_tokens: None,
                    completion_tokens: None,
                    created_at: SystemTime::now(),
                }
            }
        };

        cache.update_inference(record).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vistream_vlm::MockVlmClient;

    fn frame() -> Frame {
        Frame::new(0, 2, 2, vec![0u8; 12])
    }

    #[tokio::test]
    async fn forwards_with_latest_overlay() {
        let cache = StateCache::default();
        let client = Arc::new(MockVlmClient::new(Duration::ZERO, "a cat"));
        let relay =
            FrameRelay::new(RelayConfig::default().with_every_n(1), client, cache).unwrap();

        // first frame dispatches but has no resolved result yet
        let f1 = relay.submit(frame());
        assert_eq!(f1.seq, 1);
        assert!(f1.overlay.is_none());

        // wait for the result to land
        while relay.in_flight() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let f2 = relay.submit(frame());
        assert_eq!(f2.seq, 2);
        assert_eq!(f2.overlay.as_deref(), Some("a cat"));
    }

    #[tokio::test]
    async fn error_overlay_self_heals() {
        let cache = StateCache::default();
        let client = Arc::new(MockVlmClient::new(Duration::ZERO, "recovered"));
        client.push(Err("boom".into()));
        let relay = FrameRelay::new(
            RelayConfig::default().with_every_n(1),
            client.clone(),
            cache.clone(),
        )
        .unwrap();

        relay.submit(frame());
        while relay.in_flight() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let f = relay.submit(frame());
        assert!(f.overlay.as_deref().unwrap().contains("boom"));
        let snap = cache.snapshot().await;
        assert!(matches!(
            snap.inference.as_ref().unwrap().outcome,
            InferenceOutcome::Error(_)
        ));

        while relay.in_flight() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let f = relay.submit(frame());
        assert_eq!(f.overlay.as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn rejected_control_keeps_prior_config() {
        let cache = StateCache::default();
        let client = Arc::new(MockVlmClient::new(Duration::ZERO, "x"));
        let relay = FrameRelay::new(RelayConfig::default(), client, cache).unwrap();
        let before = relay.config();

        let err = relay
            .apply_control_json(r#"{"process_every_n_frames": 0}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInterval(0)));
        assert_eq!(relay.config(), before);

        // negative interval, also rejected with nothing applied
        let err = relay
            .apply_control_json(r#"{"process_every_n_frames": -5, "prompt": "new"}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInterval(-5)));
        assert_eq!(relay.config(), before);
    }

    #[tokio::test]
    async fn unknown_control_fields_ignored() {
        let cache = StateCache::default();
        let client = Arc::new(MockVlmClient::new(Duration::ZERO, "x"));
        let relay = FrameRelay::new(RelayConfig::default(), client, cache).unwrap();

        relay
            .apply_control_json(r#"{"model": "llava:13b", "shiny_new_field": true}"#)
            .unwrap();
        assert_eq!(relay.config().model, "llava:13b");
    }
}
