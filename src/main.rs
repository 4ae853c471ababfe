use std::{
	error::Error,
	io::{BufRead, Write},
	path::PathBuf,
};

use clap::Parser;
use deepchart::{
	config::AppConfig,
	output::{timestamped_name, OutputSink},
	render::{RenderEngine, RenderOptions},
	DeepChartError, DiagramDefinition, DiagramGenerator,
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt;

#[derive(Parser, Debug)]
#[command(name = "deepchart", about = "Generate Mermaid diagrams from plain-language requests")]
struct Args {
	/// Path of the YAML configuration file.
	#[arg(long, default_value = "config/config.yaml")]
	config: PathBuf,
	/// Log level
	#[arg(long, default_value = "info")]
	log_level: Level,
	/// Generate a single diagram for this request and exit instead of prompting interactively.
	#[arg(short, long)]
	prompt: Option<String>,
	/// Print the diagram definition without rendering it.
	#[arg(long)]
	code_only: bool,
	/// Extra attempts for generation failures that look transient (network, 429, 5xx).
	#[arg(long, default_value_t = 0)]
	retries: u32,
}

struct Session {
	generator: DiagramGenerator,
	engine: RenderEngine,
	sink: OutputSink,
	code_only: bool,
	retries: u32,
}

impl Session {
	async fn generate(&self, user_text: &str) -> Result<DiagramDefinition, DeepChartError> {
		let request = self.generator.request(user_text);
		let mut attempt = 0;
		loop {
			match self.generator.generate(&request).await {
				Err(e) if e.is_transient() && attempt < self.retries => {
					attempt += 1;
					warn!("Generation failed ({}), retrying {}/{}", e, attempt, self.retries);
				},
				result => return result,
			}
		}
	}

	async fn handle(&self, user_text: &str) -> Result<(), DeepChartError> {
		let definition = self.generate(user_text).await?;

		println!("\n{}\n", definition);

		if self.code_only {
			return Ok(())
		}

		let name = timestamped_name(definition.kind);
		let image = self.engine.render_async(definition).await?;
		let path = self.sink.save(&name, &image)?;

		println!("图表已生成并保存为: {}", path.display());

		Ok(())
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let args = Args::parse();

	let subscriber = fmt::Subscriber::builder().with_max_level(args.log_level).finish();
	tracing::subscriber::set_global_default(subscriber)?;

	info!(task = "tracing_setup", result = "success", "tracing successfully set up");

	let config = AppConfig::load(&args.config)?;
	let generator = DiagramGenerator::from_config(&config.llm.backend_config()?)?;
	let engine = RenderEngine::new(RenderOptions::from(&config.mermaid));
	let sink = OutputSink::create(&config.mermaid.output_dir)?;

	generator.warm_up().await?;

	let session =
		Session { generator, engine, sink, code_only: args.code_only, retries: args.retries };

	if let Some(prompt) = args.prompt {
		session.handle(&prompt).await?;
		return Ok(())
	}

	println!("欢迎使用 DeepChart！");
	println!("请输入你想生成的主题和图表类型，例如：'做一个30天假期的增肌规划的甘特图'");

	let stdin = std::io::stdin();
	let mut lines = stdin.lock().lines();
	loop {
		print!("\n请输入你的需求（输入'q'退出）: ");
		std::io::stdout().flush()?;

		let Some(line) = lines.next() else { break };
		let line = line?;
		let input = line.trim();
		if input.eq_ignore_ascii_case("q") {
			break
		}
		if input.is_empty() {
			continue
		}

		if let Err(e) = session.handle(input).await {
			error!("Request failed: {}", e);
			eprintln!("生成失败：{}", e);
		}
	}

	Ok(())
}
