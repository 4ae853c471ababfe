/// The following diagram shows how a request flows through the crate, from the user's text to
/// the saved image.
///
/// Only [`GenerationBackend`](crate::GenerationBackend) is expanded to show its two
/// implementations.
#[cfg_attr(doc, aquamarine::aquamarine)]
/// ```mermaid
/// graph LR
///     subgraph Caller
///         cli[deepchart CLI]
///         sink[OutputSink]
///     end
///     cli -- GenerationRequest --> generator
///     subgraph DeepChart
///         generator[DiagramGenerator]
///         prompt[prompt::build]
///         backend>GenerationBackend]
///         extract[extract::extract]
///         render[RenderEngine]
///         generator -- user text --> prompt
///         prompt -- Prompt --> backend
///         backend -- RawModelOutput --> extract
///         extract -- DiagramDefinition --> cli
///         local[LocalBackend]-. impl .- backend
///         remote[RemoteBackend]-. impl .- backend
///     end
///     local --> llama[llama.cpp + GGUF weights]
///     remote --> api[chat completion endpoint]
///     cli -- DiagramDefinition --> render
///     render --> chrome[headless Chrome + mermaid.js]
///     render -- RenderedImage --> sink
/// ```
///
/// [`DiagramGenerator`](crate::DiagramGenerator) picks its backend once from the
/// [`BackendConfig`](crate::config::BackendConfig) and keeps it for the whole session. The
/// local backend is the only component holding state across requests: the loaded model.
/// [`RenderEngine`](crate::render::RenderEngine) launches a fresh browser per call and closes it
/// before returning.
pub struct Diagram;
