//! Client for hosted OpenAI-compatible chat-completion endpoints.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, trace};

use crate::{
	config::RemoteConfig,
	types::{BackendMode, DeepChartError, Prompt, RawModelOutput},
	GenerationBackend, Result,
};

const SYSTEM_ROLE: &str = "system";
const USER_ROLE: &str = "user";

/// Request body. Field names are the provider's wire contract.
#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest<'a> {
	pub model: &'a str,
	pub messages: [ChatMessage<'a>; 2],
	pub stream: bool,
	pub max_tokens: u32,
	pub stop: &'a [String],
	pub temperature: f32,
	pub top_p: f32,
	pub top_k: u32,
	pub frequency_penalty: f32,
	pub n: u8,
	pub response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatMessage<'a> {
	pub role: &'static str,
	pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ResponseFormat {
	#[serde(rename = "type")]
	pub kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
	#[serde(default)]
	choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
	message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
	content: Option<String>,
}

/// Sends one bearer-authenticated `POST` per generation.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
	client: reqwest::Client,
	config: RemoteConfig,
}

impl RemoteBackend {
	pub fn new(config: RemoteConfig) -> Result<Self> {
		let client =
			reqwest::Client::builder().timeout(config.request_timeout).build().map_err(|e| {
				error!("Failed to build HTTP client: {}", e);
				DeepChartError::Configuration(format!("cannot build HTTP client: {}", e))
			})?;

		Ok(Self { client, config })
	}

	pub fn config(&self) -> &RemoteConfig {
		&self.config
	}

	pub(crate) fn payload<'a>(&'a self, system: &'a str, user: &'a str) -> ChatCompletionRequest<'a> {
		let sampling = &self.config.sampling;

		ChatCompletionRequest {
			model: &self.config.model_identifier,
			messages: [
				ChatMessage { role: SYSTEM_ROLE, content: system },
				ChatMessage { role: USER_ROLE, content: user },
			],
			stream: false,
			max_tokens: sampling.max_tokens,
			stop: &sampling.stop,
			temperature: sampling.temperature,
			top_p: sampling.top_p,
			top_k: sampling.top_k,
			frequency_penalty: sampling.frequency_penalty,
			n: 1,
			response_format: ResponseFormat { kind: "text" },
		}
	}
}

/// Pull `choices[0].message.content` out of a response body.
pub(crate) fn parse_content(body: &str) -> Result<String> {
	let response: ChatCompletionResponse = serde_json::from_str(body).map_err(|e| {
		error!("Failed to decode chat completion response: {}", e);
		DeepChartError::MalformedResponse {
			message: "response is not a chat completion".into(),
			source: Some(e),
		}
	})?;

	response
		.choices
		.into_iter()
		.next()
		.and_then(|choice| choice.message)
		.and_then(|message| message.content)
		.ok_or_else(|| {
			error!("Chat completion response has no choices[0].message.content");
			DeepChartError::malformed("missing choices[0].message.content")
		})
}

#[async_trait]
impl GenerationBackend for RemoteBackend {
	fn mode(&self) -> BackendMode {
		BackendMode::Remote
	}

	#[instrument(skip(self, prompt), fields(endpoint = %self.config.endpoint_url))]
	async fn complete(&self, prompt: Prompt) -> Result<RawModelOutput> {
		let Prompt::Chat { system, user } = prompt else {
			return Err(DeepChartError::Configuration(
				"remote backend expects a chat prompt".into(),
			))
		};

		trace!("Sending chat completion request for model {}", self.config.model_identifier);

		let response = self
			.client
			.post(&self.config.endpoint_url)
			.header(AUTHORIZATION, format!("Bearer {}", self.config.auth_token))
			.header(CONTENT_TYPE, "application/json")
			.json(&self.payload(&system, &user))
			.send()
			.await
			.map_err(|e| {
				error!("Failed to reach remote endpoint: {}", e);
				DeepChartError::Transport { status: None, body: String::new(), source: Some(e) }
			})?;

		let status = response.status();
		let body = response.text().await.map_err(|e| {
			error!("Failed to read response body: {}", e);
			DeepChartError::Transport {
				status: Some(status.as_u16()),
				body: String::new(),
				source: Some(e),
			}
		})?;

		if !status.is_success() {
			error!("Remote endpoint returned {}: {}", status, body);
			return Err(DeepChartError::Transport {
				status: Some(status.as_u16()),
				body,
				source: None,
			})
		}

		let content = parse_content(&body)?;

		debug!("Received {} bytes of model output", content.len());

		Ok(RawModelOutput(content))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn payload_matches_wire_contract() {
		let backend = RemoteBackend::new(RemoteConfig::new("token")).unwrap();
		let value = serde_json::to_value(backend.payload("rules", "画一个流程图")).unwrap();

		assert_eq!(value["model"], "Pro/deepseek-ai/DeepSeek-R1");
		assert_eq!(value["messages"][0]["role"], "system");
		assert_eq!(value["messages"][0]["content"], "rules");
		assert_eq!(value["messages"][1]["role"], "user");
		assert_eq!(value["messages"][1]["content"], "画一个流程图");
		assert_eq!(value["stream"], false);
		assert_eq!(value["n"], 1);
		assert_eq!(value["top_k"], 50);
		assert_eq!(value["response_format"]["type"], "text");
		assert!(value["stop"].as_array().is_some_and(|stop| stop.len() <= 4));
	}

	#[test]
	fn content_is_read_from_first_choice() {
		let body = r#"{"choices":[{"message":{"role":"assistant","content":"graph TD\nA-->B"}},
			{"message":{"content":"ignored"}}]}"#;
		assert_eq!(parse_content(body).unwrap(), "graph TD\nA-->B");
	}

	#[test]
	fn missing_content_is_malformed() {
		for body in [r#"{"choices":[]}"#, r#"{"id":"x"}"#, r#"{"choices":[{"message":{}}]}"#] {
			assert!(matches!(parse_content(body), Err(DeepChartError::MalformedResponse { .. })));
		}
	}

	#[test]
	fn non_json_is_malformed() {
		assert!(matches!(
			parse_content("<html>bad gateway</html>"),
			Err(DeepChartError::MalformedResponse { source: Some(_), .. })
		));
	}
}
