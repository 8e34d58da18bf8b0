use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::{ClientConfig, DEFAULT_BASE_URL};
use crate::error::BatchError;
use crate::poller::{DEFAULT_POLL_INTERVAL, PollOptions};

pub const I2V_CONFIG_FILE: &str = "job.json";
pub const IMAGE_CONFIG_FILE: &str = "qwen-image-config.json";
pub const UPREZ_CONFIG_FILE: &str = "uprez-config.json";

const I2V_PASSTHROUGH: [&str; 9] = [
    "size",
    "duration",
    "num_inference_steps",
    "guidance",
    "seed",
    "negative_prompt",
    "flow_shift",
    "enable_prompt_optimization",
    "enable_safety_checker",
];
const IMAGE_PASSTHROUGH: [&str; 3] = ["size", "negative_prompt", "enable_safety_checker"];

const I2V_DEADLINE: Duration = Duration::from_secs(7200);
const IMAGE_DEADLINE: Duration = Duration::from_secs(3600);
const UPREZ_DEADLINE: Duration = Duration::from_secs(7200);

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CollectionConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nsfw: bool,
}

#[derive(Debug, Deserialize)]
pub struct ImageToVideoConfig {
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub combos: Vec<String>,
    #[serde(default)]
    pub playlist_uuid: Option<String>,
    #[serde(default)]
    pub playlist: Option<CollectionConfig>,
    #[serde(default)]
    pub polling: Option<PollingConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct ImageGenerationConfig {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub num_generations: Option<i64>,
    #[serde(default)]
    pub output_folder: Option<String>,
    #[serde(default)]
    pub output_filename: Option<String>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub playlist_uuid: Option<String>,
    #[serde(default)]
    pub polling: Option<PollingConfig>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct UprezConfig {
    #[serde(default)]
    pub playlist_uuid: Option<String>,
    #[serde(default)]
    pub uprez_config: UprezParams,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub output_playlist: Option<CollectionConfig>,
    #[serde(default)]
    pub polling: Option<PollingConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UprezParams {
    #[serde(default = "default_factor")]
    pub upscale_factor: u32,
    #[serde(default = "default_factor")]
    pub interpolation_factor: u32,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
    #[serde(default = "default_tile_padding")]
    pub tile_padding: u32,
    #[serde(default = "default_quality")]
    pub quality: String,
}

impl Default for UprezParams {
    fn default() -> Self {
        Self {
            upscale_factor: default_factor(),
            interpolation_factor: default_factor(),
            output_format: default_output_format(),
            tile_size: default_tile_size(),
            tile_padding: default_tile_padding(),
            quality: default_quality(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackingConfig {
    #[serde(default = "default_marker")]
    pub marker: String,
    #[serde(default)]
    pub existing_playlist_uuid: Option<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
            existing_playlist_uuid: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub description: Option<String>,
    pub nsfw: bool,
}

/// Where new jobs are collected: an existing collection, one to create, or
/// an existing one with a fallback to creation when it cannot be read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionTarget {
    pub existing: Option<String>,
    pub create: Option<CollectionSpec>,
}

#[derive(Debug, Clone)]
pub struct ResolvedImageToVideo {
    pub image_dir: PathBuf,
    pub prompt: String,
    pub combos: Vec<String>,
    pub params: Map<String, Value>,
    pub collection: CollectionTarget,
    pub poll: PollOptions,
}

#[derive(Debug, Clone)]
pub struct ResolvedImageGeneration {
    pub prompt: String,
    pub num_generations: usize,
    pub output_dir: Utf8PathBuf,
    pub output_filename: String,
    pub params: Map<String, Value>,
    pub collection_id: Option<String>,
    pub poll: PollOptions,
}

#[derive(Debug, Clone)]
pub struct ResolvedUprez {
    pub source_collection: String,
    pub params: Map<String, Value>,
    pub marker: String,
    pub output: CollectionTarget,
    pub poll: PollOptions,
}

/// Command-line overrides applied on top of a config file's polling values.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollOverrides {
    pub interval: Option<Duration>,
    pub deadline: Option<Duration>,
}

impl PollOverrides {
    pub fn apply(self, poll: PollOptions) -> Result<PollOptions, BatchError> {
        let interval = self.interval.unwrap_or(poll.interval);
        check_interval(interval)?;
        Ok(PollOptions {
            interval,
            deadline: self.deadline.unwrap_or(poll.deadline),
        })
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn image_to_video(path: &Path) -> Result<ResolvedImageToVideo, BatchError> {
        let config = Self::read(path)?;
        Self::resolve_image_to_video(config, &base_dir(path))
    }

    pub fn image_generation(path: &Path) -> Result<ResolvedImageGeneration, BatchError> {
        let config = Self::read(path)?;
        Self::resolve_image_generation(config, &base_dir(path))
    }

    pub fn uprez(path: &Path) -> Result<ResolvedUprez, BatchError> {
        let config = Self::read(path)?;
        Self::resolve_uprez(config)
    }

    pub fn read<T: DeserializeOwned>(path: &Path) -> Result<T, BatchError> {
        if !path.exists() {
            return Err(BatchError::MissingConfig(path.to_path_buf()));
        }
        let content =
            fs::read_to_string(path).map_err(|_| BatchError::ConfigRead(path.to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| BatchError::ConfigParse(err.to_string()))
    }

    pub fn resolve_image_to_video(
        config: ImageToVideoConfig,
        base_dir: &Path,
    ) -> Result<ResolvedImageToVideo, BatchError> {
        let image_path = non_empty(config.image_path)
            .ok_or_else(|| missing_field("image_path", I2V_CONFIG_FILE))?;

        let collection = CollectionTarget {
            existing: non_empty(config.playlist_uuid),
            create: config
                .playlist
                .map(|playlist| collection_spec(playlist, "Batch Output")),
        };
        if collection.existing.is_none() && collection.create.is_none() {
            return Err(BatchError::InvalidConfig(format!(
                "{I2V_CONFIG_FILE} needs either 'playlist_uuid' or a 'playlist' section"
            )));
        }

        let combos = if config.combos.is_empty() {
            vec![String::new()]
        } else {
            config.combos
        };

        Ok(ResolvedImageToVideo {
            image_dir: resolve_path(base_dir, &image_path),
            prompt: config.prompt.unwrap_or_default(),
            combos,
            params: passthrough(&config.extra, &I2V_PASSTHROUGH),
            collection,
            poll: poll_options(config.polling.as_ref(), I2V_DEADLINE)?,
        })
    }

    pub fn resolve_image_generation(
        config: ImageGenerationConfig,
        base_dir: &Path,
    ) -> Result<ResolvedImageGeneration, BatchError> {
        let prompt =
            non_empty(config.prompt).ok_or_else(|| missing_field("prompt", IMAGE_CONFIG_FILE))?;

        let num_generations = config.num_generations.unwrap_or(1);
        if num_generations < 1 {
            return Err(BatchError::InvalidConfig(
                "'num_generations' must be at least 1".to_string(),
            ));
        }

        let output_folder =
            non_empty(config.output_folder).unwrap_or_else(|| "generated-images".to_string());
        let output_dir = Utf8PathBuf::from_path_buf(resolve_path(base_dir, &output_folder))
            .map_err(|_| {
                BatchError::InvalidConfig("output_folder is not valid UTF-8".to_string())
            })?;

        let mut params = Map::new();
        params.insert("prompt".to_string(), Value::String(prompt.clone()));
        // -1 asks the service for a random seed, which is also its default.
        if let Some(seed) = config.seed.filter(|seed| *seed != -1) {
            params.insert("seed".to_string(), Value::from(seed));
        }
        params.extend(passthrough(&config.extra, &IMAGE_PASSTHROUGH));

        Ok(ResolvedImageGeneration {
            prompt,
            num_generations: num_generations as usize,
            output_dir,
            output_filename: non_empty(config.output_filename)
                .unwrap_or_else(|| "qwen-image".to_string()),
            params,
            collection_id: non_empty(config.playlist_uuid),
            poll: poll_options(config.polling.as_ref(), IMAGE_DEADLINE)?,
        })
    }

    pub fn resolve_uprez(config: UprezConfig) -> Result<ResolvedUprez, BatchError> {
        let source_collection = non_empty(config.playlist_uuid)
            .ok_or_else(|| missing_field("playlist_uuid", UPREZ_CONFIG_FILE))?;

        let marker = config.tracking.marker.trim().to_string();
        if marker.is_empty() {
            return Err(BatchError::InvalidConfig(
                "'tracking.marker' must not be empty".to_string(),
            ));
        }

        let params = match serde_json::to_value(&config.uprez_config) {
            Ok(Value::Object(map)) => map,
            _ => {
                return Err(BatchError::InvalidConfig(
                    "'uprez_config' must be an object".to_string(),
                ));
            }
        };

        let output_playlist = config.output_playlist.unwrap_or_default();
        Ok(ResolvedUprez {
            source_collection,
            params,
            marker,
            output: CollectionTarget {
                existing: non_empty(config.tracking.existing_playlist_uuid),
                create: Some(collection_spec(output_playlist, "Uprez Output")),
            },
            poll: poll_options(config.polling.as_ref(), UPREZ_DEADLINE)?,
        })
    }
}

/// Reads `API_KEY` and `BACKEND_URL` from the process environment.
pub fn client_config_from_env() -> Result<ClientConfig, BatchError> {
    let api_key = std::env::var("API_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or(BatchError::MissingCredentials)?;
    let base_url = std::env::var("BACKEND_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    Ok(ClientConfig { base_url, api_key })
}

fn base_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn resolve_path(base_dir: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn missing_field(field: &str, file: &str) -> BatchError {
    BatchError::InvalidConfig(format!("'{field}' not found in {file}"))
}

fn collection_spec(config: CollectionConfig, default_name: &str) -> CollectionSpec {
    CollectionSpec {
        name: non_empty(config.name).unwrap_or_else(|| default_name.to_string()),
        description: config.description,
        nsfw: config.nsfw,
    }
}

fn passthrough(extra: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    keys.iter()
        .filter_map(|key| {
            extra
                .get(*key)
                .filter(|value| !value.is_null())
                .map(|value| (key.to_string(), value.clone()))
        })
        .collect()
}

fn poll_options(
    config: Option<&PollingConfig>,
    default_deadline: Duration,
) -> Result<PollOptions, BatchError> {
    let interval = config
        .and_then(|polling| polling.interval_secs)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_POLL_INTERVAL);
    check_interval(interval)?;
    let deadline = config
        .and_then(|polling| polling.deadline_secs)
        .map(Duration::from_secs)
        .unwrap_or(default_deadline);
    Ok(PollOptions::new(interval, deadline))
}

/// A zero interval would re-query every pending job without pause.
fn check_interval(interval: Duration) -> Result<(), BatchError> {
    if interval.is_zero() {
        return Err(BatchError::InvalidConfig(
            "poll interval must be at least one second".to_string(),
        ));
    }
    Ok(())
}

fn default_factor() -> u32 {
    2
}

fn default_output_format() -> String {
    "mp4".to_string()
}

fn default_tile_size() -> u32 {
    1024
}

fn default_tile_padding() -> u32 {
    10
}

fn default_quality() -> String {
    "high".to_string()
}

fn default_marker() -> String {
    "uprez".to_string()
}
