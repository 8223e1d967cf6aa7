// vistream-telemetry/src/probe.rs
// Concrete probes.  Anything vendor-specific stays behind a cargo
// feature; the sysinfo-backed CPU/RAM probe always compiles.

use crate::{ProbeError, Result, TelemetryProbe};
use std::time::SystemTime;
use sysinfo::{CpuExt, CpuRefreshKind, RefreshKind, System, SystemExt};
use vistream_cache::TelemetrySample;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// CPU utilization + RAM via sysinfo.  No GPU fields.
///
/// CPU usage is delta-based, so the very first reading is 0% by
/// definition; it is still a valid sample.
pub struct SysProbe {
    sys: System,
}

impl SysProbe {
    pub fn new() -> Self {
        let sys = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(),
        );
        Self { sys }
    }
}

impl Default for SysProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryProbe for SysProbe {
    fn sample(&mut self) -> Result<TelemetrySample> {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        let total = self.sys.total_memory();
        if total == 0 {
            return Err(ProbeError::System("total memory reported as 0".into()));
        }

        Ok(TelemetrySample {
            cpu_percent: Some(self.sys.global_cpu_info().cpu_usage() as f64),
            ram_used_gb: Some(self.sys.used_memory() as f64 / GIB),
            ram_total_gb: Some(total as f64 / GIB),
            ts: Some(SystemTime::now()),
            valid: true,
            ..TelemetrySample::default()
        })
    }
}

/// NVIDIA GPU counters via NVML, merged with the CPU/RAM reading so one
/// sample carries everything the dashboard shows.
#[cfg(feature = "nvml")]
pub struct NvmlProbe {
    nvml: nvml_wrapper::Nvml,
    index: u32,
    sys: SysProbe,
}

#[cfg(feature = "nvml")]
impl NvmlProbe {
    /// Init NVML and verify the device exists.  Errors here mean "no
    /// NVIDIA stack" – callers fall back to [`SysProbe`].
    pub fn new(index: u32) -> Result<Self> {
        let nvml = nvml_wrapper::Nvml::init()?;
        let device = nvml.device_by_index(index)?;
        log::info!("NVML initialized for GPU {index}: {}", device.name()?);
        drop(device);
        Ok(Self { nvml, index, sys: SysProbe::new() })
    }
}

#[cfg(feature = "nvml")]
impl TelemetryProbe for NvmlProbe {
    fn sample(&mut self) -> Result<TelemetrySample> {
        use nvml_wrapper::enum_wrappers::device::TemperatureSensor;

        let mut sample = self.sys.sample()?;

        let device = self.nvml.device_by_index(self.index)?;
        sample.gpu_util = Some(device.utilization_rates()?.gpu as f64);
        let mem = device.memory_info()?;
        sample.vram_used_gb = Some(mem.used as f64 / GIB);
        sample.vram_total_gb = Some(mem.total as f64 / GIB);
        // not all boards expose a GPU sensor; absence is not a failure
        sample.temp_c = device
            .temperature(TemperatureSensor::Gpu)
            .ok()
            .map(|t| t as f64);

        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sys_probe_reports_ram() {
        let mut probe = SysProbe::new();
        let sample = probe.sample().expect("host has memory counters");
        assert!(sample.valid);
        assert!(sample.ram_total_gb.unwrap() > 0.0);
        assert!(sample.ram_used_gb.unwrap() <= sample.ram_total_gb.unwrap());
        // GPU fields untouched by this probe
        assert!(sample.gpu_util.is_none());
    }
}
