//! The per-turn state machine graph.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Start,
    Rewrite,
    Route,
    StructuredLookup,
    ClassifyContent,
    ResolveEntity,
    Retrieve,
    Respond,
    Synthesize,
    End,
}

impl Node {
    pub const ALL: [Node; 10] = [
        Node::Start,
        Node::Rewrite,
        Node::Route,
        Node::StructuredLookup,
        Node::ClassifyContent,
        Node::ResolveEntity,
        Node::Retrieve,
        Node::Respond,
        Node::Synthesize,
        Node::End,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Node::Start => "start",
            Node::Rewrite => "rewrite",
            Node::Route => "route",
            Node::StructuredLookup => "structured_lookup",
            Node::ClassifyContent => "classify_content",
            Node::ResolveEntity => "resolve_entity",
            Node::Retrieve => "retrieve",
            Node::Respond => "respond",
            Node::Synthesize => "synthesize",
            Node::End => "end",
        }
    }

    /// Every node this one may hand over to, with the edge label for
    /// conditional edges.
    pub fn edges(self, small_talk_enabled: bool) -> Vec<(Node, Option<&'static str>)> {
        match self {
            Node::Start => vec![(Node::Rewrite, None)],
            Node::Rewrite => vec![(Node::Route, None)],
            Node::Route => {
                let mut edges = vec![
                    (Node::StructuredLookup, Some("structured_lookup")),
                    (Node::ClassifyContent, Some("semantic_retrieval")),
                ];
                if small_talk_enabled {
                    edges.push((Node::Respond, Some("small_talk")));
                }
                edges
            }
            Node::StructuredLookup => vec![(Node::Synthesize, None)],
            Node::ClassifyContent => vec![
                (Node::ResolveEntity, Some("user_opinion")),
                (Node::Retrieve, Some("reference_material")),
            ],
            Node::ResolveEntity => vec![
                (Node::Retrieve, Some("resolved")),
                (Node::Synthesize, Some("unresolved")),
            ],
            Node::Retrieve => vec![(Node::Synthesize, None)],
            Node::Respond => vec![(Node::Synthesize, None)],
            Node::Synthesize => vec![(Node::End, None)],
            Node::End => vec![],
        }
    }

    /// Mermaid node id. A bare `end` would close the flowchart.
    fn mermaid_id(self) -> &'static str {
        match self {
            Node::Start => "__start__",
            Node::End => "__end__",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mermaid flowchart of the turn graph.
pub fn mermaid(small_talk_enabled: bool) -> String {
    let mut lines = vec!["flowchart TD".to_string()];
    for node in Node::ALL {
        if node == Node::Respond && !small_talk_enabled {
            continue;
        }
        for (to, label) in node.edges(small_talk_enabled) {
            match label {
                Some(label) => lines.push(format!(
                    "    {} -->|{}| {}",
                    node.mermaid_id(),
                    label,
                    to.mermaid_id()
                )),
                None => lines.push(format!("    {} --> {}", node.mermaid_id(), to.mermaid_id())),
            }
        }
    }
    lines.join("\n")
}
