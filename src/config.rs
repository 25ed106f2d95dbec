use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::{CameraConfig, DEFAULT_DRIVER_BUFFERS};
use crate::pipeline::{PipelineConfig, StageCpus};
use crate::service::SchedPolicy;
use crate::stages::BackpressurePolicy;

const DEFAULT_DEVICE: &str = "/dev/video0";
const DEFAULT_COUNT: u64 = 100;
const DEFAULT_OUTPUT_DIR: &str = "frames";
const DEFAULT_PREFIX: &str = "test";

#[derive(Debug, Deserialize, Default)]
struct SynchronomeConfigFile {
    camera: Option<CameraConfigFile>,
    output: Option<OutputConfigFile>,
    detection: Option<DetectionConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    scheduling: Option<SchedulingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    force_format: Option<bool>,
    buffers: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct OutputConfigFile {
    dir: Option<PathBuf>,
    prefix: Option<String>,
    save_all: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    still_threshold: Option<f64>,
    moving_threshold: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    count: Option<u64>,
    capture_capacity: Option<usize>,
    tick_capacity: Option<usize>,
    pool_capacity: Option<usize>,
    capture_interval_ms: Option<u64>,
    recv_timeout_ms: Option<u64>,
    ready_timeout_ms: Option<u64>,
    backpressure: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SchedulingConfigFile {
    realtime: Option<bool>,
    capture_cpu: Option<usize>,
    detection_cpu: Option<usize>,
    persistence_cpu: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SynchronomeConfig {
    pub camera: CameraConfig,
    pub output: OutputSettings,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub dir: PathBuf,
    pub prefix: String,
}

impl SynchronomeConfig {
    /// Load from the file named by `SYNCHRONOME_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SYNCHRONOME_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from `path` (or defaults), then apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SynchronomeConfigFile) -> Result<Self> {
        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraConfig {
            device: camera_file
                .device
                .unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            force_format: camera_file.force_format.unwrap_or(false),
            buffers: camera_file.buffers.unwrap_or(DEFAULT_DRIVER_BUFFERS),
        };

        let output_file = file.output.unwrap_or_default();
        let output = OutputSettings {
            dir: output_file
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            prefix: output_file
                .prefix
                .unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        };

        let defaults = PipelineConfig::default();
        let detection = file.detection.unwrap_or_default();
        let pipeline_file = file.pipeline.unwrap_or_default();
        let scheduling = file.scheduling.unwrap_or_default();
        let backpressure = match pipeline_file.backpressure.as_deref() {
            Some(policy) => policy.parse()?,
            None => BackpressurePolicy::default(),
        };
        let pipeline = PipelineConfig {
            target_frames: pipeline_file.count.unwrap_or(DEFAULT_COUNT),
            save_all: output_file.save_all.unwrap_or(false),
            still_threshold: detection
                .still_threshold
                .unwrap_or(defaults.still_threshold),
            moving_threshold: detection
                .moving_threshold
                .unwrap_or(defaults.moving_threshold),
            capture_capacity: pipeline_file
                .capture_capacity
                .unwrap_or(defaults.capture_capacity),
            tick_capacity: pipeline_file
                .tick_capacity
                .unwrap_or(defaults.tick_capacity),
            pool_capacity: pipeline_file.pool_capacity,
            capture_interval: pipeline_file.capture_interval_ms.map(Duration::from_millis),
            backpressure,
            recv_timeout: pipeline_file
                .recv_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.recv_timeout),
            ready_timeout: pipeline_file
                .ready_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.ready_timeout),
            sched_policy: sched_policy(scheduling.realtime.unwrap_or(true)),
            cpus: StageCpus {
                capture: scheduling.capture_cpu,
                detection: scheduling.detection_cpu,
                persistence: scheduling.persistence_cpu,
            },
        };

        Ok(Self {
            camera,
            output,
            pipeline,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("SYNCHRONOME_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(dir) = std::env::var("SYNCHRONOME_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output.dir = PathBuf::from(dir);
            }
        }
        if let Ok(count) = std::env::var("SYNCHRONOME_COUNT") {
            self.pipeline.target_frames = count
                .trim()
                .parse()
                .map_err(|_| anyhow!("SYNCHRONOME_COUNT must be a positive integer"))?;
        }
        if let Ok(value) = std::env::var("SYNCHRONOME_STILL_THRESHOLD") {
            self.pipeline.still_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("SYNCHRONOME_STILL_THRESHOLD must be a number"))?;
        }
        if let Ok(value) = std::env::var("SYNCHRONOME_MOVING_THRESHOLD") {
            self.pipeline.moving_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("SYNCHRONOME_MOVING_THRESHOLD must be a number"))?;
        }
        if let Ok(value) = std::env::var("SYNCHRONOME_REALTIME") {
            let realtime = parse_bool(&value)
                .ok_or_else(|| anyhow!("SYNCHRONOME_REALTIME must be true or false"))?;
            self.pipeline.sched_policy = sched_policy(realtime);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.device.trim().is_empty() {
            return Err(anyhow!("camera device must be set"));
        }
        if self.camera.buffers < 2 {
            return Err(anyhow!("at least 2 driver buffers are required"));
        }
        if self.output.prefix.contains(std::path::MAIN_SEPARATOR) {
            return Err(anyhow!("file prefix must not contain a path separator"));
        }
        self.pipeline.validate()
    }

    pub fn realtime(&self) -> bool {
        self.pipeline.sched_policy == SchedPolicy::Fifo
    }
}

fn sched_policy(realtime: bool) -> SchedPolicy {
    if realtime {
        SchedPolicy::Fifo
    } else {
        SchedPolicy::Normal
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<SynchronomeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg: SynchronomeConfigFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_system() -> Result<()> {
        let cfg = SynchronomeConfig::from_file(SynchronomeConfigFile::default())?;
        assert_eq!(cfg.camera.device, "/dev/video0");
        assert_eq!(cfg.camera.buffers, 6);
        assert!(!cfg.camera.force_format);
        assert_eq!(cfg.pipeline.target_frames, 100);
        assert_eq!(cfg.pipeline.capture_capacity, 40);
        assert_eq!(cfg.pipeline.pool_capacity(), 43);
        assert_eq!(cfg.output.dir, PathBuf::from("frames"));
        assert_eq!(cfg.output.prefix, "test");
        assert!(cfg.realtime());
        cfg.validate()
    }

    #[test]
    fn bad_backpressure_name_is_rejected() {
        let file = SynchronomeConfigFile {
            pipeline: Some(PipelineConfigFile {
                backpressure: Some("spill".to_string()),
                ..PipelineConfigFile::default()
            }),
            ..SynchronomeConfigFile::default()
        };
        assert!(SynchronomeConfig::from_file(file).is_err());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
