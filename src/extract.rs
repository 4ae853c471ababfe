//! Turns noisy model output into a Mermaid definition the renderer can mount.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::types::DiagramDefinition;

/// Closing tag emitted by reasoning models once their chain of thought is done.
pub const REASONING_END_MARKER: &str = "</think>";

const CODE_FENCE: &str = "```";

/// Diagram types the extractor recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagramKind {
	Graph,
	Sequence,
	Gantt,
	Class,
	Flowchart,
	State,
	EntityRelationship,
	GitGraph,
	Mindmap,
	Quadrant,
}

impl DiagramKind {
	/// Header keyword that opens a definition of this kind.
	pub fn keyword(&self) -> &'static str {
		match self {
			Self::Graph => "graph",
			Self::Sequence => "sequenceDiagram",
			Self::Gantt => "gantt",
			Self::Class => "classDiagram",
			Self::Flowchart => "flowchart",
			Self::State => "stateDiagram",
			Self::EntityRelationship => "erDiagram",
			Self::GitGraph => "gitGraph",
			Self::Mindmap => "mindmap",
			Self::Quadrant => "quadrantChart",
		}
	}

	/// Short name used for output file names.
	pub fn slug(&self) -> &'static str {
		match self {
			Self::Graph | Self::Flowchart => "flowchart",
			Self::Sequence => "sequence",
			Self::Gantt => "gantt",
			Self::Class => "class",
			Self::State => "state",
			Self::EntityRelationship => "er",
			Self::GitGraph => "gitgraph",
			Self::Mindmap => "mindmap",
			Self::Quadrant => "quadrant",
		}
	}
}

impl Display for DiagramKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.keyword())
	}
}

/// Recognized keywords in tie-break order.
///
/// The earliest match in the text wins; two matches at the same offset resolve to the entry
/// listed first. No keyword may be a prefix of another one listed before it.
pub const KEYWORD_TABLE: &[DiagramKind] = &[
	DiagramKind::Graph,
	DiagramKind::Sequence,
	DiagramKind::Gantt,
	DiagramKind::Class,
	DiagramKind::Flowchart,
	DiagramKind::State,
	DiagramKind::EntityRelationship,
	DiagramKind::GitGraph,
	DiagramKind::Mindmap,
	DiagramKind::Quadrant,
];

/// Extract a [`DiagramDefinition`] from raw model output.
///
/// 1. Everything up to and including the last [`REASONING_END_MARKER`] is dropped.
/// 2. The text is cut to start at the earliest recognized keyword and to end before the next
///    code fence, if one follows.
/// 3. The result is trimmed.
///
/// Keywords are matched as substrings, except that an occurrence directly preceded by an ASCII
/// letter or digit is skipped: `paragraph` does not yield `graph`, and neither does `1graph`.
///
/// The cut ends at any fence, opening ones included. A keyword mentioned in prose before a
/// fenced block therefore wins over the block: `"the gantt chart:\n```mermaid\ngantt"` yields
/// `gantt chart:`.
///
/// When no keyword is found the trimmed remainder is returned with `kind` left empty. The
/// function never fails and `extract(&extract(x).source) == extract(x)`.
pub fn extract(raw: &str) -> DiagramDefinition {
	let answer = strip_reasoning(raw);

	let Some((offset, kind)) = find_keyword(answer) else {
		debug!("No diagram keyword found in model output, returning it as is");
		return DiagramDefinition { source: answer.trim().to_string(), kind: None };
	};

	let body = &answer[offset..];
	let body = match body.find(CODE_FENCE) {
		Some(end) => &body[..end],
		None => body,
	};

	trace!("Extracted {} diagram starting at offset {}", kind, offset);

	DiagramDefinition { source: body.trim().to_string(), kind: Some(kind) }
}

/// Returns the text following the last reasoning-end marker, or the whole input.
pub fn strip_reasoning(raw: &str) -> &str {
	match raw.rfind(REASONING_END_MARKER) {
		Some(idx) => &raw[idx + REASONING_END_MARKER.len()..],
		None => raw,
	}
}

/// Finds the earliest keyword occurrence that does not sit in the middle of a word.
fn find_keyword(text: &str) -> Option<(usize, DiagramKind)> {
	KEYWORD_TABLE
		.iter()
		.enumerate()
		.filter_map(|(priority, kind)| {
			first_standalone(text, kind.keyword()).map(|offset| (offset, priority, *kind))
		})
		.min_by_key(|(offset, priority, _)| (*offset, *priority))
		.map(|(offset, _, kind)| (offset, kind))
}

fn first_standalone(text: &str, keyword: &str) -> Option<usize> {
	text.match_indices(keyword).map(|(offset, _)| offset).find(|&offset| {
		text[..offset].chars().next_back().map_or(true, |c| !c.is_ascii_alphanumeric())
	})
}
