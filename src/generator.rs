use tracing::{debug, error, instrument, trace, warn};

use crate::{
	backend::select_backend,
	config::BackendConfig,
	prompt,
	types::{BackendMode, DeepChartError, DiagramDefinition, GenerationRequest},
	GenerationBackend, Result,
};

/// Drives a request through prompt building, generation and extraction.
///
/// The backend is fixed at construction; requests addressed to another mode are rejected.
pub struct DiagramGenerator {
	backend: Box<dyn GenerationBackend>,
}

impl DiagramGenerator {
	/// Select and construct the backend described by `config`.
	pub fn from_config(config: &BackendConfig) -> Result<Self> {
		Ok(Self::with_backend(select_backend(config)?))
	}

	pub fn with_backend(backend: Box<dyn GenerationBackend>) -> Self {
		Self { backend }
	}

	pub fn mode(&self) -> BackendMode {
		self.backend.mode()
	}

	/// Build a request for this generator's backend.
	pub fn request(&self, user_text: impl Into<String>) -> GenerationRequest {
		GenerationRequest::new(user_text, self.mode())
	}

	/// Load models or open connections ahead of the first request.
	pub async fn warm_up(&self) -> Result<()> {
		self.backend.warm_up().await
	}

	/// Generate a diagram definition for `request`.
	///
	/// Backend failures are returned as-is. Extraction never fails; check
	/// [`DiagramDefinition::is_recognized`] to find out whether a diagram keyword was found.
	#[instrument(skip(self, request), fields(backend = %self.mode()))]
	pub async fn generate(&self, request: &GenerationRequest) -> Result<DiagramDefinition> {
		if request.backend_mode != self.mode() {
			error!(
				"Request addressed to the {} backend but {} is active",
				request.backend_mode,
				self.mode()
			);
			return Err(DeepChartError::Configuration(format!(
				"request targets the {} backend but the session runs {}",
				request.backend_mode,
				self.mode()
			)))
		}

		let prompt = prompt::build(&request.user_text, request.backend_mode);

		trace!("Prompting backend with {:?}", prompt);

		let raw = self.backend.complete(prompt).await?;

		debug!("Raw model output: {:?}", raw.0);

		let definition = raw.extract();
		if !definition.is_recognized() {
			warn!("No diagram keyword in model output, passing it through unchanged");
		}

		Ok(definition)
	}
}
