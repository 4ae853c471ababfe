//! Rasterizes Mermaid definitions by driving a headless Chrome.
//!
//! Each call goes through a fixed sequence of [`RenderStage`]s. The browser process is owned
//! by a [`BrowserSession`] which is released on drop, so every exit path closes it.

use std::{
	fmt::Display,
	path::PathBuf,
	sync::{
		atomic::{AtomicU32, AtomicUsize, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use headless_chrome::{protocol::cdp::Page::CaptureScreenshotFormatOption, Browser, LaunchOptions};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
	config::{MermaidSection, DEFAULT_MERMAID_URL},
	types::{DeepChartError, DiagramDefinition, ImageFormat, RenderedImage},
	Result,
};

/// Id of the element the definition is mounted into.
pub const CONTAINER_ID: &str = "diagram";

/// Either the mounted svg or the container carrying a mermaid error.
const SETTLED_SELECTOR: &str = "#diagram[data-rendered=\"true\"] svg, #diagram[data-error]";
const CONTAINER_SELECTOR: &str = "#diagram";
const ERROR_ATTRIBUTE: &str = "data-error";

#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
	pub viewport_width: u32,
	pub viewport_height: u32,
	/// Upper bound on waiting for the diagram to mount.
	pub timeout: Duration,
	/// Pause after mounting so fonts and layout settle before capture.
	pub settle_delay: Duration,
	pub mermaid_url: String,
	pub theme: String,
	pub format: ImageFormat,
	pub chrome_path: Option<PathBuf>,
	pub sandbox: bool,
}

impl Default for RenderOptions {
	fn default() -> Self {
		Self {
			viewport_width: 1280,
			viewport_height: 960,
			timeout: Duration::from_secs(30),
			settle_delay: Duration::from_millis(250),
			mermaid_url: DEFAULT_MERMAID_URL.to_string(),
			theme: "default".to_string(),
			format: ImageFormat::Png,
			chrome_path: None,
			sandbox: true,
		}
	}
}

impl From<&MermaidSection> for RenderOptions {
	fn from(section: &MermaidSection) -> Self {
		Self {
			viewport_width: section.width,
			viewport_height: section.height,
			timeout: Duration::from_secs(section.timeout_secs),
			mermaid_url: section.mermaid_url.clone(),
			theme: section.theme.clone(),
			format: section.format,
			chrome_path: section.chrome_path.clone(),
			sandbox: section.sandbox,
			..Self::default()
		}
	}
}

/// Lifecycle of a single render call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStage {
	Idle,
	BrowserLaunched,
	PageLoaded,
	DiagramMounted,
	ScreenshotCaptured,
	BrowserClosed,
}

impl Display for RenderStage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			Self::Idle => "idle",
			Self::BrowserLaunched => "browser_launched",
			Self::PageLoaded => "page_loaded",
			Self::DiagramMounted => "diagram_mounted",
			Self::ScreenshotCaptured => "screenshot_captured",
			Self::BrowserClosed => "browser_closed",
		};
		write!(f, "{}", name)
	}
}

/// Counts live sessions for as long as it exists.
#[derive(Debug)]
pub(crate) struct SessionGuard(Arc<AtomicUsize>);

impl SessionGuard {
	pub(crate) fn acquire(counter: &Arc<AtomicUsize>) -> Self {
		counter.fetch_add(1, Ordering::SeqCst);
		Self(Arc::clone(counter))
	}
}

impl Drop for SessionGuard {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

/// A headless Chrome process scoped to one render call.
///
/// Dropping the session kills the process.
pub struct BrowserSession {
	browser: Browser,
	_guard: SessionGuard,
}

impl BrowserSession {
	fn launch(options: &RenderOptions, counter: &Arc<AtomicUsize>) -> Result<Self> {
		let launch_options = LaunchOptions::default_builder()
			.headless(true)
			.sandbox(options.sandbox)
			.window_size(Some((options.viewport_width, options.viewport_height)))
			.path(options.chrome_path.clone())
			.idle_browser_timeout(options.timeout + options.settle_delay + Duration::from_secs(30))
			.build()
			.map_err(|e| {
				error!("Invalid browser launch options: {}", e);
				DeepChartError::Browser(e.to_string().into())
			})?;

		let browser = Browser::new(launch_options).map_err(|e| {
			error!("Failed to launch headless browser: {}", e);
			DeepChartError::Browser(e.into())
		})?;

		Ok(Self { browser, _guard: SessionGuard::acquire(counter) })
	}
}

impl Drop for BrowserSession {
	fn drop(&mut self) {
		trace!(stage = %RenderStage::BrowserClosed, pid = ?self.browser.get_process_id(), "Closing browser");
	}
}

/// Renders [`DiagramDefinition`]s into images.
///
/// Cloning is cheap and clones share the open-session counter.
#[derive(Debug, Clone)]
pub struct RenderEngine {
	options: RenderOptions,
	open_sessions: Arc<AtomicUsize>,
	/// Process id of the latest browser, 0 before the first launch.
	last_pid: Arc<AtomicU32>,
}

impl RenderEngine {
	pub fn new(options: RenderOptions) -> Self {
		Self {
			options,
			open_sessions: Arc::new(AtomicUsize::new(0)),
			last_pid: Arc::new(AtomicU32::new(0)),
		}
	}

	pub fn options(&self) -> &RenderOptions {
		&self.options
	}

	/// Number of browser processes currently owned by this engine and its clones.
	pub fn open_sessions(&self) -> usize {
		self.open_sessions.load(Ordering::SeqCst)
	}

	/// Process id of the browser launched by the latest render, if any was launched.
	pub fn last_browser_pid(&self) -> Option<u32> {
		match self.last_pid.load(Ordering::SeqCst) {
			0 => None,
			pid => Some(pid),
		}
	}

	/// Render `definition` on the blocking pool.
	pub async fn render_async(&self, definition: DiagramDefinition) -> Result<RenderedImage> {
		let engine = self.clone();

		tokio::task::spawn_blocking(move || engine.render(&definition)).await.map_err(|e| {
			error!("Render task failed: {}", e);
			DeepChartError::Browser(Box::new(e))
		})?
	}

	/// Rasterize `definition`, blocking the calling thread until done.
	///
	/// Fails with [`DeepChartError::RenderTimeout`] when mermaid rejects the definition or
	/// nothing mounts within [`RenderOptions::timeout`].
	#[instrument(skip(self, definition), fields(kind = ?definition.kind))]
	pub fn render(&self, definition: &DiagramDefinition) -> Result<RenderedImage> {
		trace!(stage = %RenderStage::Idle, "Starting render");

		let session = BrowserSession::launch(&self.options, &self.open_sessions)?;
		let pid = session.browser.get_process_id();
		self.last_pid.store(pid.unwrap_or(0), Ordering::SeqCst);
		debug!(stage = %RenderStage::BrowserLaunched, pid = ?pid);

		let tab = session.browser.new_tab().map_err(|e| {
			error!("Failed to open browser tab: {}", e);
			DeepChartError::Browser(e.into())
		})?;

		let page = page_html(&definition.source, &self.options);
		let url = format!("data:text/html;base64,{}", STANDARD.encode(page));
		tab.navigate_to(&url).and_then(|tab| tab.wait_until_navigated()).map_err(|e| {
			error!("Failed to load render page: {}", e);
			DeepChartError::Browser(e.into())
		})?;
		debug!(stage = %RenderStage::PageLoaded);

		let started = Instant::now();
		let settled = tab
			.wait_for_element_with_custom_timeout(SETTLED_SELECTOR, self.options.timeout)
			.map_err(|e| {
				warn!("Diagram did not mount within {:?}: {}", self.options.timeout, e);
				DeepChartError::RenderTimeout { waited: started.elapsed(), detail: None }
			})?;

		if let Some(detail) = settled.get_attribute_value(ERROR_ATTRIBUTE).ok().flatten() {
			warn!("Mermaid rejected the definition: {}", detail);
			return Err(DeepChartError::RenderTimeout {
				waited: started.elapsed(),
				detail: Some(detail),
			})
		}

		std::thread::sleep(self.options.settle_delay);
		debug!(stage = %RenderStage::DiagramMounted, elapsed = ?started.elapsed());

		let container = tab.find_element(CONTAINER_SELECTOR).map_err(|e| {
			error!("Diagram container disappeared: {}", e);
			DeepChartError::Browser(e.into())
		})?;

		let format = match self.options.format {
			ImageFormat::Png => CaptureScreenshotFormatOption::Png,
			ImageFormat::Jpeg => CaptureScreenshotFormatOption::Jpeg,
		};
		let bytes = container.capture_screenshot(format).map_err(|e| {
			error!("Failed to capture diagram screenshot: {}", e);
			DeepChartError::Browser(e.into())
		})?;
		debug!(stage = %RenderStage::ScreenshotCaptured, bytes = bytes.len());

		drop(tab);
		drop(session);

		info!("Rendered diagram into a {} byte image", bytes.len());

		Ok(RenderedImage { bytes, format: self.options.format })
	}
}

/// Escape text for inclusion in HTML element content or a double-quoted attribute.
pub fn escape_html(text: &str) -> String {
	let mut escaped = String::with_capacity(text.len());
	for c in text.chars() {
		match c {
			'&' => escaped.push_str("&amp;"),
			'<' => escaped.push_str("&lt;"),
			'>' => escaped.push_str("&gt;"),
			'"' => escaped.push_str("&quot;"),
			'\'' => escaped.push_str("&#39;"),
			c => escaped.push(c),
		}
	}
	escaped
}

/// Minimal page that loads mermaid and mounts `source` into the container.
///
/// The inline script tags the container with `data-rendered` once mermaid resolves, or with
/// `data-error` carrying the message when it rejects.
pub fn page_html(source: &str, options: &RenderOptions) -> String {
	let theme = serde_json::to_string(&options.theme).unwrap_or_else(|_| "\"default\"".into());

	format!(
		r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
body {{ margin: 0; background: #ffffff; }}
#{id} {{ display: inline-block; padding: 16px; }}
</style>
<script src="{url}"></script>
</head>
<body>
<div id="{id}" class="mermaid">{body}</div>
<script>
(function () {{
	var container = document.getElementById("{id}");
	if (typeof mermaid === "undefined") {{
		container.setAttribute("{error}", "mermaid library failed to load");
		return;
	}}
	mermaid.initialize({{ startOnLoad: false, theme: {theme}, securityLevel: "strict" }});
	mermaid.run({{ nodes: [container] }})
		.then(function () {{ container.setAttribute("data-rendered", "true"); }})
		.catch(function (err) {{ container.setAttribute("{error}", String(err && err.message || err)); }});
}})();
</script>
</body>
</html>
"#,
		id = CONTAINER_ID,
		url = escape_html(&options.mermaid_url),
		body = escape_html(source),
		error = ERROR_ATTRIBUTE,
		theme = theme,
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn definition_is_escaped_into_the_container() {
		let page = page_html("graph TD\nA[\"<b>\"] --> B & C", &RenderOptions::default());
		assert!(page.contains(
			"<div id=\"diagram\" class=\"mermaid\">graph TD\nA[&quot;&lt;b&gt;&quot;] --&gt; B &amp; C</div>"
		));
		assert!(page.contains(DEFAULT_MERMAID_URL));
	}

	#[test]
	fn theme_is_emitted_as_a_js_string() {
		let options = RenderOptions { theme: "dark\"".into(), ..RenderOptions::default() };
		assert!(page_html("graph TD", &options).contains(r#"theme: "dark\"""#));
	}

	#[test]
	fn session_guard_tracks_open_sessions() {
		let counter = Arc::new(AtomicUsize::new(0));
		let first = SessionGuard::acquire(&counter);
		let second = SessionGuard::acquire(&counter);
		assert_eq!(counter.load(Ordering::SeqCst), 2);
		drop(first);
		drop(second);
		assert_eq!(counter.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn settled_selector_waits_for_the_svg_or_an_error() {
		assert!(SETTLED_SELECTOR.contains("#diagram[data-rendered=\"true\"] svg"));
		assert!(SETTLED_SELECTOR.contains(&format!("#diagram[{}]", ERROR_ATTRIBUTE)));
		assert_eq!(RenderEngine::new(RenderOptions::default()).last_browser_pid(), None);
	}

	#[test]
	fn options_follow_config_section() {
		let section = MermaidSection { width: 800, timeout_secs: 5, ..MermaidSection::default() };
		let options = RenderOptions::from(&section);
		assert_eq!(options.viewport_width, 800);
		assert_eq!(options.timeout, Duration::from_secs(5));
		assert_eq!(options.settle_delay, RenderOptions::default().settle_delay);
	}
}
