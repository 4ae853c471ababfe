use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};

use crate::extract::DiagramKind;

/// Boxed cause attached to errors coming from libraries with opaque error types.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Which inference backend serves generation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
	/// Quantized GGUF model running in-process.
	Local,
	/// Hosted chat-completion endpoint.
	Remote,
}

impl Display for BackendMode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Local => write!(f, "local"),
			Self::Remote => write!(f, "remote"),
		}
	}
}

/// A single user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
	pub user_text: String,
	pub backend_mode: BackendMode,
}

impl GenerationRequest {
	pub fn new(user_text: impl Into<String>, backend_mode: BackendMode) -> Self {
		Self { user_text: user_text.into(), backend_mode }
	}
}

/// The prompt handed to a backend, packaged the way that backend expects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
	/// Single concatenated string for raw completion runtimes.
	Completion(String),
	/// System and user messages for chat-completion endpoints.
	Chat { system: String, user: String },
}

/// Unprocessed text returned by a backend.
///
/// May contain a reasoning trace, markdown fences or conversational filler. Run it through
/// [`RawModelOutput::extract`] before rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawModelOutput(pub String);

impl RawModelOutput {
	pub fn extract(&self) -> DiagramDefinition {
		crate::extract::extract(&self.0)
	}
}

impl From<String> for RawModelOutput {
	fn from(text: String) -> Self {
		Self(text)
	}
}

/// Cleaned Mermaid source ready for the [`crate::render::RenderEngine`].
///
/// `kind` is `None` when extraction found no diagram keyword and fell back to the trimmed
/// model output. Callers should treat that as a failed extraction, although the renderer may
/// still accept the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagramDefinition {
	pub source: String,
	pub kind: Option<DiagramKind>,
}

impl DiagramDefinition {
	pub fn is_recognized(&self) -> bool {
		self.kind.is_some()
	}
}

impl Display for DiagramDefinition {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.source)
	}
}

/// Encoding of a [`RenderedImage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
	#[default]
	Png,
	Jpeg,
}

impl ImageFormat {
	pub fn extension(&self) -> &'static str {
		match self {
			Self::Png => "png",
			Self::Jpeg => "jpg",
		}
	}
}

/// Encoded screenshot of one rendered diagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
	pub bytes: Vec<u8>,
	pub format: ImageFormat,
}

#[derive(Debug, thiserror::Error)]
pub enum DeepChartError {
	/// Missing or invalid configuration.
	Configuration(String),
	/// Model weights could not be located, downloaded or loaded.
	ModelUnavailable {
		message: String,
		#[source]
		source: Option<BoxError>,
	},
	/// Local generation failed after the model was loaded.
	Inference(#[source] BoxError),
	/// The remote endpoint could not be reached or answered with a non-success status.
	Transport {
		status: Option<u16>,
		body: String,
		#[source]
		source: Option<reqwest::Error>,
	},
	/// The remote endpoint answered with a body we could not interpret.
	MalformedResponse {
		message: String,
		#[source]
		source: Option<serde_json::Error>,
	},
	/// The rendering library never produced a mounted diagram.
	RenderTimeout { waited: Duration, detail: Option<String> },
	/// Headless browser launch, navigation or capture failed.
	Browser(#[source] BoxError),
	Io(#[from] std::io::Error),
}

impl DeepChartError {
	pub(crate) fn model_unavailable(message: impl Into<String>) -> Self {
		Self::ModelUnavailable { message: message.into(), source: None }
	}

	pub(crate) fn malformed(message: impl Into<String>) -> Self {
		Self::MalformedResponse { message: message.into(), source: None }
	}

	/// Whether retrying the same request could reasonably succeed.
	///
	/// Only transport failures without a status, rate limiting and server errors qualify.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Transport { status: None, .. } => true,
			Self::Transport { status: Some(status), .. } => *status == 429 || *status >= 500,
			_ => false,
		}
	}
}

impl Display for DeepChartError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Configuration(msg) => write!(f, "Bad configuration: {}", msg),
			Self::ModelUnavailable { message, source: Some(e) } =>
				write!(f, "Model unavailable: {}: {}", message, e),
			Self::ModelUnavailable { message, source: None } =>
				write!(f, "Model unavailable: {}", message),
			Self::Inference(e) => write!(f, "Local inference failed: {}", e),
			Self::Transport { status: Some(status), body, .. } =>
				write!(f, "Remote endpoint returned {}: {}", status, body),
			Self::Transport { status: None, source: Some(e), .. } =>
				write!(f, "Failed to reach remote endpoint: {}", e),
			Self::Transport { status: None, body, source: None } =>
				write!(f, "Failed to reach remote endpoint: {}", body),
			Self::MalformedResponse { message, source: Some(e) } =>
				write!(f, "Malformed response: {}: {}", message, e),
			Self::MalformedResponse { message, source: None } =>
				write!(f, "Malformed response: {}", message),
			Self::RenderTimeout { waited, detail: Some(detail) } =>
				write!(f, "Diagram did not render within {:?}: {}", waited, detail),
			Self::RenderTimeout { waited, detail: None } =>
				write!(f, "Diagram did not render within {:?}", waited),
			Self::Browser(e) => write!(f, "Headless browser error: {}", e),
			Self::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}
