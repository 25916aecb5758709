use anyhow::{anyhow, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::api::ApiConfig;
use crate::detect::{Detector, DetectorSettings, DEFAULT_IOU_THRESHOLD, DEFAULT_MIN_CONFIDENCE};
use crate::images::ImageStore;
use crate::pipeline::{DetectionService, DEFAULT_MAX_UPLOAD_BYTES};
use crate::remote::{RemoteCamera, DEFAULT_REMOTE_ADDR, DEFAULT_REMOTE_TIMEOUT};
use crate::storage::{JobStore, SqliteJobStore};

const DEFAULT_DB_PATH: &str = "roastwatch.db";
const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_MODEL_INPUT_SIZE: u32 = 640;
const DEFAULT_PAGE_SIZE: u32 = 10;
const DEFAULT_MAX_PAGE_SIZE: u32 = 100;
const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;

#[derive(Debug, Deserialize, Default)]
struct RoastwatchConfigFile {
    db_path: Option<String>,
    data_dir: Option<PathBuf>,
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
    remote: Option<RemoteConfigFile>,
    display: Option<DisplayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    max_upload_bytes: Option<usize>,
    default_page_size: Option<u32>,
    max_page_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    allow_fallback: Option<bool>,
    min_confidence: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RemoteConfigFile {
    addr: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct RoastwatchConfig {
    pub db_path: String,
    pub data_dir: PathBuf,
    pub api: ApiSettings,
    pub detector: DetectorConfig,
    pub remote: RemoteSettings,
    /// Zone used to render timestamps in API responses.
    pub display_offset: FixedOffset,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub max_upload_bytes: usize,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub allow_fallback: bool,
    pub min_confidence: f32,
    pub iou_threshold: f32,
}

impl DetectorConfig {
    pub fn settings(&self) -> DetectorSettings {
        DetectorSettings {
            min_confidence: self.min_confidence,
            iou_threshold: self.iou_threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub addr: String,
    pub timeout: Duration,
}

impl RoastwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROASTWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RoastwatchConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let data_dir = file
            .data_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let api = file.api.unwrap_or_default();
        let api = ApiSettings {
            addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            max_upload_bytes: api.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            default_page_size: api.default_page_size.unwrap_or(DEFAULT_PAGE_SIZE),
            max_page_size: api.max_page_size.unwrap_or(DEFAULT_MAX_PAGE_SIZE),
        };
        let detector = file.detector.unwrap_or_default();
        let detector = DetectorConfig {
            model_path: detector.model_path,
            input_size: detector.input_size.unwrap_or(DEFAULT_MODEL_INPUT_SIZE),
            allow_fallback: detector.allow_fallback.unwrap_or(true),
            min_confidence: detector.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
            iou_threshold: detector.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
        };
        let remote = file.remote.unwrap_or_default();
        let remote = RemoteSettings {
            addr: remote
                .addr
                .unwrap_or_else(|| DEFAULT_REMOTE_ADDR.to_string()),
            timeout: remote
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REMOTE_TIMEOUT),
        };
        let offset_minutes = file
            .display
            .and_then(|display| display.utc_offset_minutes)
            .unwrap_or(0);
        Ok(Self {
            db_path,
            data_dir,
            api,
            detector,
            remote,
            display_offset: offset_from_minutes(offset_minutes)?,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_string("ROASTWATCH_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = env_string("ROASTWATCH_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(dir) = env_string("ROASTWATCH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_string("ROASTWATCH_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(allow) = env_parse::<bool>("ROASTWATCH_ALLOW_FALLBACK", "true or false")? {
            self.detector.allow_fallback = allow;
        }
        if let Some(value) = env_parse::<f32>("ROASTWATCH_MIN_CONFIDENCE", "a number")? {
            self.detector.min_confidence = value;
        }
        if let Some(value) = env_parse::<f32>("ROASTWATCH_IOU_THRESHOLD", "a number")? {
            self.detector.iou_threshold = value;
        }
        if let Some(addr) = env_string("ROASTWATCH_REMOTE_ADDR") {
            self.remote.addr = addr;
        }
        if let Some(secs) = env_parse::<u64>(
            "ROASTWATCH_REMOTE_TIMEOUT_SECS",
            "an integer number of seconds",
        )? {
            self.remote.timeout = Duration::from_secs(secs);
        }
        if let Some(minutes) = env_parse::<i32>(
            "ROASTWATCH_DISPLAY_UTC_OFFSET_MINUTES",
            "an integer number of minutes",
        )? {
            self.display_offset = offset_from_minutes(minutes)?;
        }
        Ok(())
    }

    pub fn build_detector(&self) -> Detector {
        Detector::from_config(
            self.detector.model_path.as_deref(),
            self.detector.input_size,
            self.detector.allow_fallback,
            self.detector.settings(),
        )
    }

    /// Open the job store and image directories and assemble the service.
    pub fn open_service(&self) -> Result<DetectionService> {
        let store: Arc<dyn JobStore> = Arc::new(
            SqliteJobStore::open(&self.db_path)
                .map_err(|e| anyhow!("failed to open job store {}: {}", self.db_path, e))?,
        );
        let images = ImageStore::new(&self.data_dir).map_err(|e| {
            anyhow!(
                "failed to prepare data directory {}: {}",
                self.data_dir.display(),
                e
            )
        })?;
        Ok(
            DetectionService::new(store, images, Arc::new(self.build_detector()))
                .with_remote(RemoteCamera::new(self.remote.addr.clone(), self.remote.timeout))
                .with_max_upload_bytes(self.api.max_upload_bytes),
        )
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.api.addr.clone(),
            max_upload_bytes: self.api.max_upload_bytes,
            default_page_size: self.api.default_page_size,
            max_page_size: self.api.max_page_size,
            display_offset: self.display_offset,
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("min_confidence", self.detector.min_confidence),
            ("iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input_size must be greater than zero"));
        }
        if self.remote.timeout.is_zero() {
            return Err(anyhow!("remote timeout must be greater than zero"));
        }
        if self.api.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be greater than zero"));
        }
        if self.api.default_page_size == 0 || self.api.max_page_size == 0 {
            return Err(anyhow!("page sizes must be greater than zero"));
        }
        if self.api.default_page_size > self.api.max_page_size {
            return Err(anyhow!(
                "default_page_size {} exceeds max_page_size {}",
                self.api.default_page_size,
                self.api.max_page_size
            ));
        }
        Ok(())
    }
}

fn offset_from_minutes(minutes: i32) -> Result<FixedOffset> {
    if minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return Err(anyhow!(
            "display UTC offset must be within ±18h, got {} minutes",
            minutes
        ));
    }
    FixedOffset::east_opt(minutes * 60)
        .ok_or_else(|| anyhow!("invalid display UTC offset {} minutes", minutes))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str, expected: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be {}", key, expected)),
        None => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<RoastwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
