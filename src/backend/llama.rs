//! llama.cpp runtime for [`LocalBackend`](super::LocalBackend), with Hugging Face hub
//! downloads for missing weights.

use std::{
	num::NonZeroU32,
	path::{Path, PathBuf},
};

use hf_hub::api::sync::ApiBuilder;
use llama_cpp_2::{
	context::params::LlamaContextParams,
	llama_backend::LlamaBackend,
	llama_batch::LlamaBatch,
	model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
	sampling::LlamaSampler,
};
use tracing::{debug, error, trace};

use super::local::{place_weights, truncate_at_stop, CompletionRuntime, ModelLoader};
use crate::{
	config::{LocalConfig, SamplingParams},
	types::DeepChartError,
	Result,
};

const BATCH_SIZE: usize = 512;
/// Tokens considered by the repetition penalty.
const PENALTY_LAST_N: i32 = 64;

/// Loads GGUF weights with llama.cpp.
#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaLoader;

/// The loaded llama.cpp backend and model.
///
/// A fresh context is created per completion so no KV state leaks between requests.
pub struct LocalModelHandle {
	backend: LlamaBackend,
	model: LlamaModel,
	context_window: u32,
	threads: i32,
}

impl ModelLoader for LlamaLoader {
	type Handle = LocalModelHandle;

	fn fetch(&self, config: &LocalConfig) -> Result<PathBuf> {
		std::fs::create_dir_all(&config.model_directory)?;

		let api = ApiBuilder::new()
			.with_cache_dir(config.model_directory.clone())
			.with_progress(true)
			.build()
			.map_err(|e| {
				error!("Failed to set up Hugging Face client: {}", e);
				DeepChartError::ModelUnavailable {
					message: "cannot create Hugging Face client".into(),
					source: Some(Box::new(e)),
				}
			})?;

		let cached =
			api.model(config.model_repository.clone()).get(&config.model_file).map_err(|e| {
				error!("Failed to download {}: {}", config.model_file, e);
				DeepChartError::ModelUnavailable {
					message: format!(
						"cannot download {} from {}",
						config.model_file, config.model_repository
					),
					source: Some(Box::new(e)),
				}
			})?;

		place_weights(&cached, config)
	}

	fn load(&self, path: &Path, config: &LocalConfig) -> Result<Self::Handle> {
		let threads = llama_count(config.thread_count, "llm.threads")?;
		llama_count(config.context_window_size, "llm.context_window")?;

		let backend = LlamaBackend::init().map_err(|e| {
			error!("Failed to initialise llama.cpp: {}", e);
			DeepChartError::ModelUnavailable {
				message: "cannot initialise llama.cpp".into(),
				source: Some(Box::new(e)),
			}
		})?;

		let gpu_layers = config.gpu_layers();
		debug!("Offloading {} layers to the GPU", gpu_layers);

		let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
		let model = LlamaModel::load_from_file(&backend, path, &params).map_err(|e| {
			error!("Failed to load {}: {}", path.display(), e);
			DeepChartError::ModelUnavailable {
				message: format!("cannot load {}", path.display()),
				source: Some(Box::new(e)),
			}
		})?;

		Ok(LocalModelHandle {
			backend,
			model,
			context_window: config.context_window_size,
			threads,
		})
	}
}

/// llama.cpp takes counts as `i32`.
fn llama_count(value: u32, setting: &str) -> Result<i32> {
	i32::try_from(value).map_err(|_| {
		error!("{} of {} exceeds what llama.cpp accepts", setting, value);
		DeepChartError::Configuration(format!("{} must be at most {}", setting, i32::MAX))
	})
}

fn inference_error(e: impl std::error::Error + Send + Sync + 'static) -> DeepChartError {
	error!("llama.cpp inference failed: {}", e);
	DeepChartError::Inference(Box::new(e))
}

impl CompletionRuntime for LocalModelHandle {
	fn complete(&mut self, prompt: &str, params: &SamplingParams) -> Result<String> {
		let ctx_params = LlamaContextParams::default()
			.with_n_ctx(NonZeroU32::new(self.context_window))
			.with_n_threads(self.threads)
			.with_n_threads_batch(self.threads);
		let mut ctx = self.model.new_context(&self.backend, ctx_params).map_err(inference_error)?;

		let tokens = self.model.str_to_token(prompt, AddBos::Always).map_err(inference_error)?;
		let context_window = llama_count(self.context_window, "llm.context_window")?;
		let prompt_len = i32::try_from(tokens.len()).unwrap_or(i32::MAX);
		let max_tokens = i32::try_from(params.max_tokens).unwrap_or(i32::MAX);
		let budget = context_window.saturating_sub(prompt_len).min(max_tokens);
		if budget <= 0 {
			return Err(DeepChartError::Inference(
				format!(
					"prompt uses {} tokens, leaving no room in a {} token context",
					prompt_len, self.context_window
				)
				.into(),
			))
		}

		let mut batch = LlamaBatch::new(BATCH_SIZE.max(tokens.len()), 1);
		let last = prompt_len - 1;
		for (pos, token) in (0_i32..).zip(tokens) {
			batch.add(token, pos, &[0], pos == last).map_err(inference_error)?;
		}
		ctx.decode(&mut batch).map_err(inference_error)?;

		let mut sampler = LlamaSampler::chain_simple([
			LlamaSampler::penalties(PENALTY_LAST_N, params.repetition_penalty, 0.0, 0.0),
			LlamaSampler::top_k(llama_count(params.top_k, "top_k")?),
			LlamaSampler::top_p(params.top_p, 1),
			LlamaSampler::temp(params.temperature),
			LlamaSampler::dist(rand_seed()),
		]);

		let mut generated = Vec::<u8>::new();
		let mut position = prompt_len;
		for _ in 0..budget {
			let token = sampler.sample(&ctx, batch.n_tokens() - 1);
			sampler.accept(token);

			if self.model.is_eog_token(token) {
				trace!("End of generation after {} tokens", position - prompt_len);
				break
			}

			generated.extend(
				self.model.token_to_bytes(token, Special::Tokenize).map_err(inference_error)?,
			);

			let text = String::from_utf8_lossy(&generated);
			if truncate_at_stop(&text, &params.stop).len() < text.len() {
				trace!("Stop sequence reached after {} tokens", position - prompt_len);
				break
			}

			batch.clear();
			batch.add(token, position, &[0], true).map_err(inference_error)?;
			position += 1;
			ctx.decode(&mut batch).map_err(inference_error)?;
		}

		Ok(String::from_utf8_lossy(&generated).into_owned())
	}
}

fn rand_seed() -> u32 {
	chrono::Utc::now().timestamp_subsec_nanos()
}
