// vistream-cache/src/lib.rs
// ============================================================
// vistream-cache  –  Result cache / metrics aggregator
// Single-writer-per-field store read by any number of consumers.
// Holds the latest inference record, the latest telemetry
// sample, bounded rolling histories for sparkline display, and
// O(1) incremental latency statistics.
// ------------------------------------------------------------
// Writers: relay worker → inference field, telemetry sampler →
// telemetry field.  Readers only ever get a deep-copied
// Snapshot, never a live reference.
// ============================================================

//! vistream – shared state layer
//!
//! The cache follows the latest-value pattern the camera node uses for
//! its JPEG/detections endpoints: an `Arc<RwLock<..>>` whose readers
//! clone out a consistent snapshot.  Each field has exactly one writer,
//! so there are no write-write races to reason about.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

pub const HISTORY_CAPACITY: usize = 60;

// ------------------------------------------------------------
// Stored record types
// ------------------------------------------------------------

/// What one resolved inference produced.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutcome {
    Text(String),
    Error(String),
}

/// One resolved inference, written exactly once, immutable after.
///
/// Tagged with the model and prompt it was *issued* under, so a reply
/// that lands after a reconfiguration is never silently attributed to
/// the new settings.
#[derive(Debug, Clone)]
pub struct InferenceRecord {
    pub model: String,
    pub prompt: String,
    pub outcome: InferenceOutcome,
    pub latency_ms: f64,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub created_at: SystemTime,
}

/// One hardware reading.  Every numeric field is independently nullable
/// so "probe failed" stays distinguishable from "probe returned zero".
#[derive(Debug, Clone, Default)]
pub struct TelemetrySample {
    pub gpu_util: Option<f64>,
    pub vram_used_gb: Option<f64>,
    pub vram_total_gb: Option<f64>,
    pub temp_c: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub ram_used_gb: Option<f64>,
    pub ram_total_gb: Option<f64>,
    pub ts: Option<SystemTime>,
    pub valid: bool,
}

impl TelemetrySample {
    /// An "unavailable this cycle" sample: all fields null, valid=false.
    pub fn invalid() -> Self {
        Self { ts: Some(SystemTime::now()), valid: false, ..Self::default() }
    }
}

// ------------------------------------------------------------
// Aggregates
// ------------------------------------------------------------

/// Last / running mean / count over all resolved requests.  Updated in
/// O(1); never scans a history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStats {
    pub last_ms: f64,
    pub mean_ms: f64,
    pub count: u64,
}

impl LatencyStats {
    pub fn record(&mut self, latency_ms: f64) {
        self.count += 1;
        self.last_ms = latency_ms;
        self.mean_ms += (latency_ms - self.mean_ms) / self.count as f64;
    }
}

/// Fixed-capacity overwrite-oldest series.
#[derive(Debug, Clone)]
pub struct History {
    buf: VecDeque<f64>,
    cap: usize,
}

impl History {
    pub fn new(cap: usize) -> Self {
        Self { buf: VecDeque::with_capacity(cap), cap }
    }

    pub fn push(&mut self, v: f64) {
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(v);
    }

    pub fn as_vec(&self) -> Vec<f64> {
        self.buf.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Rolling histories, one per displayed series.
#[derive(Debug, Clone)]
pub struct Histories {
    pub gpu_util: History,
    pub vram_used: History,
    pub cpu_util: History,
    pub ram_used: History,
}

impl Histories {
    fn new(cap: usize) -> Self {
        Self {
            gpu_util: History::new(cap),
            vram_used: History::new(cap),
            cpu_util: History::new(cap),
            ram_used: History::new(cap),
        }
    }

    fn push_sample(&mut self, s: &TelemetrySample) {
        self.gpu_util.push(s.gpu_util.unwrap_or(0.0));
        self.vram_used.push(s.vram_used_gb.unwrap_or(0.0));
        self.cpu_util.push(s.cpu_percent.unwrap_or(0.0));
        self.ram_used.push(s.ram_used_gb.unwrap_or(0.0));
    }
}

// ------------------------------------------------------------
// The cache itself
// ------------------------------------------------------------

#[derive(Debug)]
struct Inner {
    inference: Option<InferenceRecord>,
    latency: LatencyStats,
    telemetry: Option<TelemetrySample>,
    histories: Histories,
}

/// Immutable copy of the whole store, safe to hand to any reader.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub inference: Option<InferenceRecord>,
    pub latency: LatencyStats,
    pub telemetry: Option<TelemetrySample>,
    pub histories: Histories,
}

/// Cheap-to-clone handle; all clones share the same store.
#[derive(Clone)]
pub struct StateCache {
    inner: Arc<RwLock<Inner>>,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl StateCache {
    pub fn new(history_cap: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                inference: None,
                latency: LatencyStats::default(),
                telemetry: None,
                histories: Histories::new(history_cap),
            })),
        }
    }

    /// Write entry point for the relay worker (single writer).
    pub async fn update_inference(&self, record: InferenceRecord) {
        let mut inner = self.inner.write().await;
        inner.latency.record(record.latency_ms);
        inner.inference = Some(record);
    }

    /// Write entry point for the telemetry sampler (single writer).
    /// Invalid samples supersede the latest reading but never pollute
    /// the histories.
    pub async fn update_telemetry(&self, sample: TelemetrySample) {
        let mut inner = self.inner.write().await;
        if sample.valid {
            inner.histories.push_sample(&sample);
        }
        inner.telemetry = Some(sample);
    }

    pub async fn snapshot(&self) -> Snapshot {
        let inner = self.inner.read().await;
        Snapshot {
            inference: inner.inference.clone(),
            latency: inner.latency.clone(),
            telemetry: inner.telemetry.clone(),
            histories: inner.histories.clone(),
        }
    }
}

// ------------------------------------------------------------
// Outbound events (what the transport pushes to clients)
// ------------------------------------------------------------

/// Inference update as pushed over the notification channel.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceEvent {
    pub model: String,
    pub prompt: String,
    pub text: Option<String>,
    pub error: Option<String>,
    pub latency_ms: f64,
    pub mean_latency_ms: f64,
    pub total_count: u64,
}

impl InferenceEvent {
    /// `None` until the first inference resolves.
    pub fn from_snapshot(snap: &Snapshot) -> Option<Self> {
        let rec = snap.inference.as_ref()?;
        let (text, error) = match &rec.outcome {
            InferenceOutcome::Text(t) => (Some(t.clone()), None),
            InferenceOutcome::Error(e) => (None, Some(e.clone())),
        };
        Some(Self {
            model: rec.model.clone(),
            prompt: rec.prompt.clone(),
            text,
            error,
            latency_ms: rec.latency_ms,
            mean_latency_ms: snap.latency.mean_ms,
            total_count: snap.latency.count,
        })
    }
}

/// Telemetry update as pushed over the notification channel.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub gpu_util: Option<f64>,
    pub vram_used_gb: Option<f64>,
    pub vram_total_gb: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub ram_used_gb: Option<f64>,
    pub ram_total_gb: Option<f64>,
    pub valid: bool,
}

impl TelemetryEvent {
    pub fn from_snapshot(snap: &Snapshot) -> Option<Self> {
        let s = snap.telemetry.as_ref()?;
        Some(Self {
            gpu_util: s.gpu_util,
            vram_used_gb: s.vram_used_gb,
            vram_total_gb: s.vram_total_gb,
            cpu_percent: s.cpu_percent,
            ram_used_gb: s.ram_used_gb,
            ram_total_gb: s.ram_total_gb,
            valid: s.valid,
        })
    }
}
