use std::{
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use axum::{
	extract::State,
	http::{header::AUTHORIZATION, HeaderMap, StatusCode},
	routing::post,
	Json, Router,
};
use deepchart::{
	backend::RemoteBackend,
	config::RemoteConfig,
	output::{timestamped_name, OutputSink},
	render::{RenderEngine, RenderOptions},
	DeepChartError, DiagramDefinition, DiagramGenerator, DiagramKind,
};
use serde_json::{json, Value};

const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Polls the process table until `pid` is gone, for up to five seconds.
fn process_exited(pid: u32) -> bool {
	let entry = std::path::PathBuf::from(format!("/proc/{}", pid));
	for _ in 0..50 {
		if !entry.exists() {
			return true
		}
		std::thread::sleep(Duration::from_millis(100));
	}
	false
}

/// Chat-completion endpoint replaying a fixed answer and recording what it was sent.
#[derive(Default)]
struct StubEndpoint {
	status: u16,
	body: String,
	received: Mutex<Vec<(Option<String>, Value)>>,
}

async fn complete(
	State(stub): State<Arc<StubEndpoint>>,
	headers: HeaderMap,
	Json(payload): Json<Value>,
) -> (StatusCode, String) {
	let authorization =
		headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()).map(|v| v.to_string());
	stub.received.lock().unwrap().push((authorization, payload));

	(StatusCode::from_u16(stub.status).unwrap(), stub.body.clone())
}

async fn serve(status: u16, body: String) -> (String, Arc<StubEndpoint>) {
	let stub = Arc::new(StubEndpoint { status, body, ..StubEndpoint::default() });
	let app = Router::new().route(COMPLETIONS_PATH, post(complete)).with_state(Arc::clone(&stub));

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app).await.unwrap();
	});

	(format!("http://{}{}", addr, COMPLETIONS_PATH), stub)
}

fn answer(content: &str) -> String {
	json!({
		"id": "chatcmpl-1",
		"object": "chat.completion",
		"choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
	})
	.to_string()
}

fn generator_for(endpoint: &str) -> DiagramGenerator {
	let mut config = RemoteConfig::new("test-key");
	config.endpoint_url = endpoint.to_string();
	config.request_timeout = Duration::from_secs(5);

	DiagramGenerator::with_backend(Box::new(RemoteBackend::new(config).unwrap()))
}

#[tokio::test]
async fn sends_wire_exact_payload_and_extracts_answer() {
	let (endpoint, stub) =
		serve(200, answer("<think>login flow</think>\n```mermaid\ngraph TD\nA-->B\n```")).await;
	let generator = generator_for(&endpoint);

	let definition = generator
		.generate(&generator.request("画一个流程图，描述用户登录的过程"))
		.await
		.unwrap();

	assert_eq!(definition.source, "graph TD\nA-->B");
	assert_eq!(definition.kind, Some(DiagramKind::Graph));

	let received = stub.received.lock().unwrap();
	let [(authorization, payload)] = received.as_slice() else {
		panic!("expected exactly one request, got {}", received.len());
	};
	assert_eq!(authorization.as_deref(), Some("Bearer test-key"));
	assert_eq!(payload["model"], "Pro/deepseek-ai/DeepSeek-R1");
	assert_eq!(payload["stream"], false);
	assert_eq!(payload["n"], 1);
	assert_eq!(payload["max_tokens"], 4096);
	assert_eq!(payload["top_k"], 50);
	assert_eq!(payload["response_format"], json!({ "type": "text" }));
	assert_eq!(payload["messages"][0]["role"], "system");
	assert_eq!(payload["messages"][1], json!({ "role": "user", "content": "画一个流程图，描述用户登录的过程" }));
	for field in ["temperature", "top_p", "frequency_penalty", "stop"] {
		assert!(payload.get(field).is_some(), "missing {field}");
	}
}

#[tokio::test]
async fn error_status_surfaces_as_transport_error() {
	let (endpoint, _stub) = serve(401, r#"{"message":"Invalid token"}"#.to_string()).await;
	let generator = generator_for(&endpoint);

	let result = generator.generate(&generator.request("x")).await;

	match result {
		Err(e @ DeepChartError::Transport { status: Some(401), .. }) => {
			assert!(e.to_string().contains("Invalid token"));
			assert!(!e.is_transient());
		},
		other => panic!("expected transport error, got {:?}", other),
	}
}

#[tokio::test]
async fn server_errors_are_transient() {
	let (endpoint, _stub) = serve(503, "busy".to_string()).await;
	let generator = generator_for(&endpoint);

	let error = generator.generate(&generator.request("x")).await.unwrap_err();

	assert!(error.is_transient());
}

#[tokio::test]
async fn undecodable_body_is_malformed() {
	let (endpoint, _stub) = serve(200, "<html>gateway</html>".to_string()).await;
	let generator = generator_for(&endpoint);

	let result = generator.generate(&generator.request("x")).await;

	assert!(matches!(result, Err(DeepChartError::MalformedResponse { .. })));
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transient_transport_error() {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let endpoint = format!("http://{}{}", listener.local_addr().unwrap(), COMPLETIONS_PATH);
	drop(listener);
	let generator = generator_for(&endpoint);

	let error = generator.generate(&generator.request("x")).await.unwrap_err();

	assert!(matches!(error, DeepChartError::Transport { status: None, .. }));
	assert!(error.is_transient());
}

#[tokio::test]
#[ignore = "needs Linux, a local Chrome install and access to the mermaid CDN"]
async fn login_flow_request_is_rendered_and_saved() {
	let (endpoint, _stub) = serve(200, answer("graph TD\nA-->B")).await;
	let generator = generator_for(&endpoint);
	let engine = RenderEngine::new(RenderOptions::default());
	let scratch = tempfile::tempdir().unwrap();
	let sink = OutputSink::create(scratch.path()).unwrap();

	let definition = generator
		.generate(&generator.request("画一个流程图，描述用户登录的过程"))
		.await
		.unwrap();
	let name = timestamped_name(definition.kind);
	let image = engine.render_async(definition).await.unwrap();
	let path = sink.save(&name, &image).unwrap();

	assert!(image.bytes.starts_with(b"\x89PNG"));
	assert!(image.bytes.len() > 100);
	assert!(path.is_file());
	assert!(name.ends_with("_flowchart"));
	assert_eq!(engine.open_sessions(), 0);
	let pid = engine.last_browser_pid().expect("browser was launched");
	assert!(process_exited(pid), "browser process {} still running", pid);
}

#[tokio::test]
#[ignore = "needs Linux, a local Chrome install and access to the mermaid CDN"]
async fn unparseable_definition_times_out_and_releases_browser() {
	let timeout = Duration::from_secs(10);
	let engine = RenderEngine::new(RenderOptions { timeout, ..RenderOptions::default() });
	let definition =
		DiagramDefinition { source: "graph TD\nA -->|unterminated".to_string(), kind: None };

	let started = Instant::now();
	let result = engine.render_async(definition).await;

	assert!(matches!(result, Err(DeepChartError::RenderTimeout { .. })));
	assert!(started.elapsed() < timeout + Duration::from_secs(20));
	assert_eq!(engine.open_sessions(), 0);
	let pid = engine.last_browser_pid().expect("browser was launched");
	assert!(process_exited(pid), "browser process {} still running", pid);
}
