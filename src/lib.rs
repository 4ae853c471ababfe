//! Turn plain-language requests into Mermaid diagrams.
//!
//! DeepChart asks a large language model for Mermaid source, cleans the answer up and renders
//! it into an image with a headless browser. Two interchangeable backends can serve the
//! generation step:
//!
//! - a quantized GGUF model running in-process through llama.cpp (cargo feature `local`), or
//! - a hosted OpenAI-compatible chat-completion endpoint.
//!
//! The backend is picked once from configuration and exposed through the
//! [`GenerationBackend`] trait. [`DiagramGenerator`] builds the prompt, calls the backend and
//! runs the [`extract`] step, which strips reasoning traces, markdown fences and chatter so that
//! only the diagram remains. [`RenderEngine`](render::RenderEngine) then mounts the definition
//! into a page loading mermaid.js and screenshots the result.
//!
//! For the remote backend you need an API key for the endpoint, either in the config file as
//! `llm.api_key` or in the `DEEPCHART_API_KEY` environment variable. Rendering requires a
//! Chrome or Chromium install and network access to the mermaid CDN.
//!
//! # Example
//!
//! ```ignore
//! use deepchart::{
//! 	config::{BackendConfig, RemoteConfig},
//! 	output::{timestamped_name, OutputSink},
//! 	render::{RenderEngine, RenderOptions},
//! 	DiagramGenerator,
//! };
//!
//! #[tokio::main]
//! async fn main() -> deepchart::Result<()> {
//! 	// Remote backend with default endpoint, model and sampling parameters.
//! 	let config = BackendConfig::Remote(RemoteConfig::new("sk-..."));
//! 	let generator = DiagramGenerator::from_config(&config)?;
//!
//! 	let request = generator.request("画一个流程图，描述用户登录的过程");
//! 	let definition = generator.generate(&request).await?;
//! 	println!("{}", definition);
//!
//! 	let engine = RenderEngine::new(RenderOptions::default());
//! 	let image = engine.render_async(definition.clone()).await?;
//!
//! 	let sink = OutputSink::create("output")?;
//! 	let path = sink.save(&timestamped_name(definition.kind), &image)?;
//! 	println!("Saved to {}", path.display());
//!
//! 	Ok(())
//! }
//! ```

pub mod architecture;
pub mod backend;
pub mod config;
pub mod extract;
pub mod generator;
pub mod output;
pub mod prompt;
pub mod render;
pub mod types;

#[cfg(test)]
mod mock;

pub use backend::{select_backend, GenerationBackend};
pub use extract::{extract, DiagramKind};
pub use generator::DiagramGenerator;
pub use types::{
	BackendMode, DeepChartError, DiagramDefinition, GenerationRequest, Prompt, RawModelOutput,
	RenderedImage,
};

pub type Result<T> = std::result::Result<T, DeepChartError>;
