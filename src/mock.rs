use std::{
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

use async_trait::async_trait;

use crate::{
	backend::{local::place_weights, CompletionRuntime, ModelLoader},
	config::{LocalConfig, SamplingParams},
	*,
};

/// Backend replaying a canned answer and recording the prompts it receives.
pub struct MockBackend {
	pub mode: BackendMode,
	pub answer: String,
	pub prompts: Arc<Mutex<Vec<Prompt>>>,
}

impl MockBackend {
	pub fn new(mode: BackendMode, answer: &str) -> Self {
		Self { mode, answer: answer.to_string(), prompts: Arc::new(Mutex::new(vec![])) }
	}
}

#[async_trait]
impl GenerationBackend for MockBackend {
	fn mode(&self) -> BackendMode {
		self.mode
	}

	async fn complete(&self, prompt: Prompt) -> Result<RawModelOutput> {
		self.prompts.lock().unwrap().push(prompt);
		Ok(RawModelOutput(self.answer.clone()))
	}
}

/// Loader counting loads and fetches, producing [`MockRuntime`]s.
///
/// Fetching writes the weights into a hub cache layout like a real download.
#[derive(Clone, Default)]
pub struct MockLoader {
	pub loads: Arc<AtomicUsize>,
	pub fetches: Arc<AtomicUsize>,
	pub in_flight: Arc<AtomicUsize>,
	pub max_in_flight: Arc<AtomicUsize>,
	pub answer: String,
	pub fail_load: bool,
}

impl MockLoader {
	pub fn answering(answer: &str) -> Self {
		Self { answer: answer.to_string(), ..Self::default() }
	}
}

impl ModelLoader for MockLoader {
	type Handle = MockRuntime;

	fn fetch(&self, config: &LocalConfig) -> Result<PathBuf> {
		self.fetches.fetch_add(1, Ordering::SeqCst);
		let snapshot = config.hub_cache_dir().join("snapshots").join("0123abcd");
		std::fs::create_dir_all(&snapshot)?;
		let cached = snapshot.join(&config.model_file);
		std::fs::write(&cached, b"GGUF")?;
		place_weights(&cached, config)
	}

	fn load(&self, _path: &Path, _config: &LocalConfig) -> Result<Self::Handle> {
		if self.fail_load {
			return Err(DeepChartError::model_unavailable("corrupt weights"))
		}
		self.loads.fetch_add(1, Ordering::SeqCst);
		Ok(MockRuntime { loader: self.clone() })
	}
}

pub struct MockRuntime {
	loader: MockLoader,
}

impl CompletionRuntime for MockRuntime {
	fn complete(&mut self, prompt: &str, _params: &SamplingParams) -> Result<String> {
		let now = self.loader.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.loader.max_in_flight.fetch_max(now, Ordering::SeqCst);
		std::thread::sleep(Duration::from_millis(20));
		self.loader.in_flight.fetch_sub(1, Ordering::SeqCst);

		assert!(prompt.starts_with("系统："));
		Ok(self.loader.answer.clone())
	}
}
