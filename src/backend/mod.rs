use async_trait::async_trait;
use tracing::info;

use crate::{
	config::BackendConfig,
	types::{BackendMode, Prompt, RawModelOutput},
	Result,
};

pub mod local;
pub mod remote;

#[cfg(feature = "local")]
pub mod llama;

pub use local::{CompletionRuntime, LocalBackend, ModelLoader};
pub use remote::RemoteBackend;

/// A strategy capable of turning a [`Prompt`] into raw model text.
///
/// Implementations are picked once by [`select_backend`] and never swapped during a session.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
	/// The packaging of [`Prompt`] this backend consumes.
	fn mode(&self) -> BackendMode;

	/// Acquire any expensive resources ahead of the first request.
	///
	/// Defaults to a no-op for backends with nothing to prepare.
	async fn warm_up(&self) -> Result<()> {
		Ok(())
	}

	/// Run a single generation.
	///
	/// No retries are attempted; every failure is handed back to the caller.
	async fn complete(&self, prompt: Prompt) -> Result<RawModelOutput>;
}

/// Build the backend described by `config`.
///
/// Remote construction performs no I/O. Local construction only checks that the weights can
/// be located; the model itself is loaded on first use.
pub fn select_backend(config: &BackendConfig) -> Result<Box<dyn GenerationBackend>> {
	let backend: Box<dyn GenerationBackend> = match config {
		BackendConfig::Remote(remote) => Box::new(RemoteBackend::new(remote.clone())?),
		BackendConfig::Local(local) => local_backend(local)?,
	};

	info!(backend = %backend.mode(), "Generation backend selected");

	Ok(backend)
}

#[cfg(feature = "local")]
fn local_backend(config: &crate::config::LocalConfig) -> Result<Box<dyn GenerationBackend>> {
	Ok(Box::new(LocalBackend::new(config.clone(), llama::LlamaLoader)?))
}

#[cfg(not(feature = "local"))]
fn local_backend(config: &crate::config::LocalConfig) -> Result<Box<dyn GenerationBackend>> {
	tracing::error!(
		"Local backend requested for {} but deepchart was built without the `local` feature",
		config.model_file_path().display()
	);

	Err(crate::types::DeepChartError::model_unavailable(
		"local inference support is not compiled in; rebuild with `--features local`",
	))
}
