// vistream-telemetry/src/lib.rs
// ============================================================
// vistream-telemetry  –  Resilient hardware sampler
// Polls a TelemetryProbe on a fixed cadence, publishing one
// sample per cycle to the StateCache.  Vendor-API flakiness is
// absorbed per-cycle; ten consecutive failures trip a fail-stop
// circuit breaker that never re-enables within the process.
// ------------------------------------------------------------
// Public API
//   * TelemetryProbe        – sync, possibly-blocking probe trait
//   * SysProbe              – CPU/RAM via sysinfo (always built)
//   * NvmlProbe             – GPU counters (`--features nvml`)
//   * CircuitState          – pure breaker state machine
//   * Sampler::spawn(...)   – the periodic task
// ============================================================

//! vistream – telemetry layer
//!
//! The sampler runs as its own tokio task, fully decoupled from frame
//! arrival.  Each cycle makes exactly one probe call inside
//! `spawn_blocking` (vendor libraries block), with no retries: a failed
//! cycle writes one invalid sample and waits for the next tick.  A
//! single failure among successes is transient noise and resets on the
//! next success; ten in a row mean the resource is structurally broken,
//! so the breaker disables the probe for the rest of the process while
//! the task keeps emitting "unavailable" heartbeats on cadence.

use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::task::JoinHandle;
use vistream_cache::{StateCache, TelemetrySample};

mod probe;
pub use probe::SysProbe;
#[cfg(feature = "nvml")]
pub use probe::NvmlProbe;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("system counters unavailable: {0}")]
    System(String),
    #[cfg(feature = "nvml")]
    #[error("NVML error: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

/// One hardware snapshot per call.  Synchronous and allowed to block;
/// the sampler wraps every call in `spawn_blocking`.
pub trait TelemetryProbe: Send + 'static {
    fn sample(&mut self) -> Result<TelemetrySample>;
}

// ------------------------------------------------------------
// Circuit breaker
// ------------------------------------------------------------

/// Fail-stop breaker: `Disabled` is terminal until process restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Active { failures: u32 },
    Disabled,
}

impl CircuitState {
    pub fn new() -> Self {
        CircuitState::Active { failures: 0 }
    }

    /// Any single success wipes the consecutive-failure count.
    pub fn on_success(self) -> Self {
        match self {
            CircuitState::Active { .. } => CircuitState::Active { failures: 0 },
            CircuitState::Disabled => CircuitState::Disabled,
        }
    }

    pub fn on_failure(self, threshold: u32) -> Self {
        match self {
            CircuitState::Active { failures } => {
                let failures = failures + 1;
                if failures >= threshold {
                    CircuitState::Disabled
                } else {
                    CircuitState::Active { failures }
                }
            }
            CircuitState::Disabled => CircuitState::Disabled,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, CircuitState::Disabled)
    }
}

impl Default for CircuitState {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------
// The periodic sampler task
// ------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Poll period; one probe call (at most) per tick.
    pub period: Duration,
    /// Consecutive failures before the breaker opens for good.
    pub failure_threshold: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { period: Duration::from_secs(1), failure_threshold: 10 }
    }
}

pub struct Sampler;

impl Sampler {
    /// Spawn the poll loop.  Runs until the returned handle is aborted
    /// or the runtime shuts down.
    pub fn spawn(
        probe: Box<dyn TelemetryProbe>,
        cache: StateCache,
        cfg: SamplerConfig,
    ) -> JoinHandle<()> {
        tokio::spawn(run(probe, cache, cfg))
    }
}

async fn run(probe: Box<dyn TelemetryProbe>, cache: StateCache, cfg: SamplerConfig) {
    let mut interval = tokio::time::interval(cfg.period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut state = CircuitState::new();
    let mut probe = Some(probe);

    loop {
        interval.tick().await;

        if state.is_disabled() {
            // heartbeat for consumers, no probe call
            cache.update_telemetry(TelemetrySample::invalid()).await;
            continue;
        }

        let mut p = match probe.take() {
            Some(p) => p,
            None => return, // unreachable while Active; belt for the panic path below
        };

        let joined = tokio::task::spawn_blocking(move || {
            let r = p.sample();
            (p, r)
        })
        .await;

        match joined {
            Ok((p, Ok(mut sample))) => {
                probe = Some(p);
                state = state.on_success();
                sample.valid = true;
                if sample.ts.is_none() {
                    sample.ts = Some(SystemTime::now());
                }
                cache.update_telemetry(sample).await;
            }
            Ok((p, Err(e))) => {
                probe = Some(p);
                state = state.on_failure(cfg.failure_threshold);
                if state.is_disabled() {
                    log::error!(
                        "telemetry probe failed {} consecutive cycles, disabling until restart: {e}",
                        cfg.failure_threshold
                    );
                } else {
                    log::warn!("telemetry probe failed this cycle: {e}");
                }
                cache.update_telemetry(TelemetrySample::invalid()).await;
            }
            Err(join_err) => {
                // probe panicked and was lost with the blocking task
                log::error!("telemetry probe panicked, disabling until restart: {join_err}");
                state = CircuitState::Disabled;
                cache.update_telemetry(TelemetrySample::invalid()).await;
            }
        }
    }
}
