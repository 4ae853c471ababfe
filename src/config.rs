//! YAML configuration and the validated backend settings derived from it.

use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use serde::Deserialize;
use tracing::{debug, error, instrument};

use crate::{
	prompt::USER_TURN_PREFIX,
	types::{BackendMode, DeepChartError, ImageFormat},
	Result,
};

/// Environment variable overriding `llm.api_key`.
pub const API_KEY_ENV: &str = "DEEPCHART_API_KEY";

pub const DEFAULT_ENDPOINT: &str = "https://api.siliconflow.cn/v1/chat/completions";
pub const DEFAULT_REMOTE_MODEL: &str = "Pro/deepseek-ai/DeepSeek-R1";
pub const DEFAULT_MODEL_REPOSITORY: &str = "unsloth/DeepSeek-R1-Distill-Qwen-7B-GGUF";
pub const DEFAULT_MODEL_FILE: &str = "DeepSeek-R1-Distill-Qwen-7B-Q4_K_M.gguf";
pub const DEFAULT_CONTEXT_WINDOW: u32 = 4096;
pub const DEFAULT_MERMAID_URL: &str = "https://cdn.jsdelivr.net/npm/mermaid@10/dist/mermaid.min.js";

/// Layers offloaded to the GPU when the platform has no unified-memory Metal device.
pub const PARTIAL_GPU_LAYERS: u32 = 50;

/// Turn markers that end a local completion.
pub const LOCAL_STOP_SEQUENCES: &[&str] =
	&["<｜User｜>", "<｜Assistant｜>", "Human:", "Assistant:", USER_TURN_PREFIX];

/// Turn markers that end a remote completion. Hosted endpoints accept at most four.
pub const REMOTE_STOP_SEQUENCES: &[&str] = &["<｜User｜>", "Human:", "Assistant:", USER_TURN_PREFIX];

/// The file at `config/config.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub llm: LlmSection,
	#[serde(default)]
	pub mermaid: MermaidSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
	#[serde(rename = "type")]
	pub mode: BackendMode,
	#[serde(default)]
	pub model_path: Option<PathBuf>,
	#[serde(default)]
	pub model_file: Option<String>,
	#[serde(default)]
	pub model_repository: Option<String>,
	#[serde(default = "default_true")]
	pub auto_download: bool,
	#[serde(default)]
	pub context_window: Option<u32>,
	#[serde(default)]
	pub threads: Option<u32>,
	#[serde(default)]
	pub gpu_layers: Option<u32>,
	#[serde(default)]
	pub api_key: Option<String>,
	#[serde(default)]
	pub endpoint: Option<String>,
	#[serde(default)]
	pub model: Option<String>,
	#[serde(default)]
	pub max_tokens: Option<u32>,
	#[serde(default)]
	pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MermaidSection {
	pub output_dir: PathBuf,
	pub width: u32,
	pub height: u32,
	pub timeout_secs: u64,
	pub theme: String,
	pub format: ImageFormat,
	pub mermaid_url: String,
	pub chrome_path: Option<PathBuf>,
	pub sandbox: bool,
}

impl Default for MermaidSection {
	fn default() -> Self {
		Self {
			output_dir: PathBuf::from("output"),
			width: 1280,
			height: 960,
			timeout_secs: 30,
			theme: "default".to_string(),
			format: ImageFormat::Png,
			mermaid_url: DEFAULT_MERMAID_URL.to_string(),
			chrome_path: None,
			sandbox: true,
		}
	}
}

fn default_true() -> bool {
	true
}

impl AppConfig {
	/// Read and parse a YAML configuration file.
	#[instrument]
	pub fn load(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).map_err(|e| {
			error!("Failed to read config file {}: {}", path.display(), e);
			DeepChartError::Configuration(format!("cannot read {}: {}", path.display(), e))
		})?;

		Self::from_yaml(&text)
	}

	pub fn from_yaml(text: &str) -> Result<Self> {
		let config: Self = serde_yaml_ng::from_str(text).map_err(|e| {
			error!("Failed to parse config: {}", e);
			DeepChartError::Configuration(format!("invalid config: {}", e))
		})?;

		debug!("Loaded config for {} backend", config.llm.mode);

		Ok(config)
	}
}

/// Sampling parameters shared by both backends.
///
/// Fields a backend does not support are ignored by it.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
	pub max_tokens: u32,
	pub temperature: f32,
	pub top_p: f32,
	pub top_k: u32,
	pub repetition_penalty: f32,
	pub frequency_penalty: f32,
	pub stop: Vec<String>,
}

impl SamplingParams {
	pub fn local_defaults() -> Self {
		Self {
			max_tokens: DEFAULT_CONTEXT_WINDOW,
			temperature: 0.7,
			top_p: 0.95,
			top_k: 40,
			repetition_penalty: 1.1,
			frequency_penalty: 0.0,
			stop: LOCAL_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
		}
	}

	pub fn remote_defaults() -> Self {
		Self {
			max_tokens: 4096,
			temperature: 0.7,
			top_p: 0.7,
			top_k: 50,
			repetition_penalty: 1.0,
			frequency_penalty: 0.5,
			stop: REMOTE_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
	pub model_directory: PathBuf,
	pub model_file: String,
	pub model_repository: String,
	pub auto_download: bool,
	pub context_window_size: u32,
	pub thread_count: u32,
	/// Explicit offload override. `None` applies [`LocalConfig::gpu_layers`] platform policy.
	pub gpu_layer_count: Option<u32>,
	pub sampling: SamplingParams,
}

impl LocalConfig {
	pub fn new(model_directory: impl Into<PathBuf>) -> Self {
		Self {
			model_directory: model_directory.into(),
			model_file: DEFAULT_MODEL_FILE.to_string(),
			model_repository: DEFAULT_MODEL_REPOSITORY.to_string(),
			auto_download: true,
			context_window_size: DEFAULT_CONTEXT_WINDOW,
			thread_count: default_thread_count(),
			gpu_layer_count: None,
			sampling: SamplingParams::local_defaults(),
		}
	}

	pub fn model_file_path(&self) -> PathBuf {
		self.model_directory.join(&self.model_file)
	}

	/// Hugging Face hub cache folder of `model_repository` inside the model directory.
	pub fn hub_cache_dir(&self) -> PathBuf {
		self.model_directory.join(format!("models--{}", self.model_repository.replace('/', "--")))
	}

	/// Weights already on disk, at [`LocalConfig::model_file_path`] or in a hub cache snapshot.
	///
	/// The snapshot named by `refs/main` is preferred over the others.
	pub fn locate_weights(&self) -> Option<PathBuf> {
		let direct = self.model_file_path();
		if direct.is_file() {
			return Some(direct)
		}

		let repository = self.hub_cache_dir();
		let snapshots = repository.join("snapshots");
		let mut revisions = std::fs::read_dir(&snapshots)
			.ok()?
			.filter_map(|entry| entry.ok().map(|entry| entry.path()))
			.collect::<Vec<_>>();
		revisions.sort();
		if let Ok(pinned) = std::fs::read_to_string(repository.join("refs").join("main")) {
			revisions.insert(0, snapshots.join(pinned.trim()));
		}

		revisions
			.into_iter()
			.map(|revision| revision.join(&self.model_file))
			.find(|path| path.is_file())
	}

	/// Number of layers to offload.
	///
	/// Metal hosts offload everything, other hosts a fixed partial amount.
	pub fn gpu_layers(&self) -> u32 {
		self.gpu_layer_count.unwrap_or(if cfg!(target_os = "macos") {
			u32::MAX
		} else {
			PARTIAL_GPU_LAYERS
		})
	}
}

fn default_thread_count() -> u32 {
	num_cpus::get().clamp(1, 8) as u32
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
	pub endpoint_url: String,
	pub auth_token: String,
	pub model_identifier: String,
	pub request_timeout: Duration,
	pub sampling: SamplingParams,
}

impl RemoteConfig {
	pub fn new(auth_token: impl Into<String>) -> Self {
		Self {
			endpoint_url: DEFAULT_ENDPOINT.to_string(),
			auth_token: auth_token.into(),
			model_identifier: DEFAULT_REMOTE_MODEL.to_string(),
			request_timeout: Duration::from_secs(300),
			sampling: SamplingParams::remote_defaults(),
		}
	}
}

/// Validated settings for the active backend.
#[derive(Debug, Clone)]
pub enum BackendConfig {
	Local(LocalConfig),
	Remote(RemoteConfig),
}

impl BackendConfig {
	pub fn mode(&self) -> BackendMode {
		match self {
			Self::Local(_) => BackendMode::Local,
			Self::Remote(_) => BackendMode::Remote,
		}
	}
}

impl LlmSection {
	/// Validate the section and resolve defaults for the active mode.
	///
	/// The api key falls back to [`API_KEY_ENV`] when absent from the file.
	pub fn backend_config(&self) -> Result<BackendConfig> {
		self.resolve(std::env::var(API_KEY_ENV).ok())
	}

	pub(crate) fn resolve(&self, env_api_key: Option<String>) -> Result<BackendConfig> {
		match self.mode {
			BackendMode::Local => {
				let model_directory = self.model_path.clone().ok_or_else(|| {
					DeepChartError::Configuration("llm.model_path is required in local mode".into())
				})?;

				let mut config = LocalConfig::new(model_directory);
				config.auto_download = self.auto_download;
				config.gpu_layer_count = self.gpu_layers;
				if let Some(file) = &self.model_file {
					config.model_file = file.clone();
				}
				if let Some(repository) = &self.model_repository {
					config.model_repository = repository.clone();
				}
				if let Some(threads) = self.threads {
					if i32::try_from(threads).is_err() {
						return Err(DeepChartError::Configuration(format!(
							"llm.threads must be at most {}",
							i32::MAX
						)))
					}
					config.thread_count = threads.max(1);
				}
				if let Some(context_window) = self.context_window {
					if context_window == 0 || i32::try_from(context_window).is_err() {
						return Err(DeepChartError::Configuration(format!(
							"llm.context_window must be between 1 and {}",
							i32::MAX
						)))
					}
					config.context_window_size = context_window;
				}
				config.sampling.max_tokens =
					self.max_tokens.unwrap_or(config.context_window_size);

				Ok(BackendConfig::Local(config))
			},
			BackendMode::Remote => {
				let auth_token = self
					.api_key
					.clone()
					.or(env_api_key)
					.filter(|key| !key.trim().is_empty())
					.ok_or_else(|| {
						error!("Remote backend selected without an api key");
						DeepChartError::Configuration(format!(
							"llm.api_key (or {}) is required in remote mode",
							API_KEY_ENV
						))
					})?;

				let mut config = RemoteConfig::new(auth_token);
				if let Some(endpoint) = &self.endpoint {
					config.endpoint_url = endpoint.clone();
				}
				if let Some(model) = &self.model {
					config.model_identifier = model.clone();
				}
				if let Some(max_tokens) = self.max_tokens {
					config.sampling.max_tokens = max_tokens;
				}
				if let Some(secs) = self.request_timeout_secs {
					config.request_timeout = Duration::from_secs(secs);
				}

				Ok(BackendConfig::Remote(config))
			},
		}
	}
}
