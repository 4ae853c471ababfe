//! In-process generation with a quantized model.
//!
//! [`LocalBackend`] owns the lifecycle of the model handle: it is created on first use (or by
//! [`GenerationBackend::warm_up`]), shared by every later call and dropped with the backend.
//! The concrete runtime sits behind [`ModelLoader`] so the lifecycle does not depend on a
//! particular inference library.

use std::{
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, trace};

use crate::{
	config::{LocalConfig, SamplingParams},
	types::{BackendMode, DeepChartError, Prompt, RawModelOutput},
	GenerationBackend, Result,
};

/// A loaded model able to run completions.
///
/// Implementations only ever see one call at a time.
pub trait CompletionRuntime: Send + 'static {
	/// Generate a continuation of `prompt` without echoing it back.
	fn complete(&mut self, prompt: &str, params: &SamplingParams) -> Result<String>;
}

/// Locates, fetches and loads model weights.
pub trait ModelLoader: Send + Sync + 'static {
	type Handle: CompletionRuntime;

	/// Download the weights described by `config` into its model directory.
	///
	/// Returns the path of the fetched file.
	fn fetch(&self, config: &LocalConfig) -> Result<PathBuf> {
		Err(DeepChartError::model_unavailable(format!(
			"{} not found and no fetcher is available",
			config.model_file_path().display()
		)))
	}

	/// Load weights from `path` into a ready-to-use handle.
	fn load(&self, path: &Path, config: &LocalConfig) -> Result<Self::Handle>;
}

/// Backend running inference in-process through a [`ModelLoader`].
pub struct LocalBackend<L: ModelLoader> {
	config: Arc<LocalConfig>,
	loader: Arc<L>,
	handle: Arc<Mutex<Option<L::Handle>>>,
}

impl<L: ModelLoader> LocalBackend<L> {
	/// Fails with [`DeepChartError::ModelUnavailable`] when the weights are absent and
	/// downloading is disabled. Nothing is loaded yet.
	pub fn new(config: LocalConfig, loader: L) -> Result<Self> {
		let model_file = config.model_file_path();
		if config.locate_weights().is_none() && !config.auto_download {
			error!("Model file {} not found and auto download is disabled", model_file.display());
			return Err(DeepChartError::model_unavailable(format!(
				"{} not found and llm.auto_download is disabled",
				model_file.display()
			)))
		}

		Ok(Self {
			config: Arc::new(config),
			loader: Arc::new(loader),
			handle: Arc::new(Mutex::new(None)),
		})
	}

	pub fn config(&self) -> &LocalConfig {
		&self.config
	}

	pub fn is_loaded(&self) -> bool {
		self.handle.lock().map(|handle| handle.is_some()).unwrap_or(false)
	}

	/// Run `f` against the loaded handle on the blocking pool, loading it first if needed.
	///
	/// Holding the mutex for the whole call keeps inference single-flight.
	async fn with_handle<T, F>(&self, f: F) -> Result<T>
	where
		T: Send + 'static,
		F: FnOnce(&mut L::Handle, &LocalConfig) -> Result<T> + Send + 'static,
	{
		let config = Arc::clone(&self.config);
		let loader = Arc::clone(&self.loader);
		let handle = Arc::clone(&self.handle);

		tokio::task::spawn_blocking(move || {
			let mut guard = handle.lock().map_err(|_| {
				error!("Model handle mutex poisoned by an earlier panic");
				DeepChartError::Inference("model handle poisoned by an earlier panic".into())
			})?;

			if guard.is_none() {
				*guard = Some(materialize(loader.as_ref(), &config)?);
			}

			match guard.as_mut() {
				Some(runtime) => f(runtime, &config),
				None => Err(DeepChartError::model_unavailable("model handle missing after load")),
			}
		})
		.await
		.map_err(|e| {
			error!("Local inference task failed: {}", e);
			DeepChartError::Inference(Box::new(e))
		})?
	}
}

fn materialize<L: ModelLoader>(loader: &L, config: &LocalConfig) -> Result<L::Handle> {
	let path = match config.locate_weights() {
		Some(path) => path,
		None => {
			info!(
				"Model {} not found locally, fetching {} from {}",
				config.model_file_path().display(),
				config.model_file,
				config.model_repository
			);
			loader.fetch(config)?
		},
	};

	info!("Loading model from {}", path.display());

	let handle = loader.load(&path, config)?;

	info!("Model loaded");

	Ok(handle)
}

/// Expose downloaded weights at [`LocalConfig::model_file_path`].
///
/// `cached` may be a hub cache symlink. The file is hard linked when the filesystem allows it
/// and copied otherwise.
pub fn place_weights(cached: &Path, config: &LocalConfig) -> Result<PathBuf> {
	let target = config.model_file_path();
	if target.is_file() {
		return Ok(target)
	}

	let blob = std::fs::canonicalize(cached)?;
	if let Err(e) = std::fs::hard_link(&blob, &target) {
		debug!("Cannot hard link {} ({}), copying it", blob.display(), e);
		std::fs::copy(&blob, &target).map_err(|e| {
			error!("Failed to copy weights to {}: {}", target.display(), e);
			e
		})?;
	}

	Ok(target)
}

/// Cut `text` before the earliest stop sequence it contains.
pub fn truncate_at_stop<'a>(text: &'a str, stop: &[String]) -> &'a str {
	stop.iter()
		.filter(|s| !s.is_empty())
		.filter_map(|s| text.find(s.as_str()))
		.min()
		.map_or(text, |end| &text[..end])
}

#[async_trait]
impl<L: ModelLoader> GenerationBackend for LocalBackend<L> {
	fn mode(&self) -> BackendMode {
		BackendMode::Local
	}

	async fn warm_up(&self) -> Result<()> {
		self.with_handle(|_, _| Ok(())).await
	}

	#[instrument(skip(self, prompt))]
	async fn complete(&self, prompt: Prompt) -> Result<RawModelOutput> {
		let Prompt::Completion(text) = prompt else {
			return Err(DeepChartError::Configuration(
				"local backend expects a completion prompt".into(),
			))
		};

		trace!("Running local completion for a {} byte prompt", text.len());

		let output = self
			.with_handle(move |runtime, config| {
				let generated = runtime.complete(&text, &config.sampling)?;
				Ok(truncate_at_stop(&generated, &config.sampling.stop).trim().to_string())
			})
			.await
			.map_err(|e| {
				error!("Local generation failed: {}", e);
				e
			})?;

		debug!("Local model produced {} bytes", output.len());

		Ok(RawModelOutput(output))
	}
}
