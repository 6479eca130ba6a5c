//! Routing topology: graph layout, edge polylines, and request path lookup.

/// Node/edge graph and its deterministic layout.
pub mod graph;
/// Per-request path resolution.
pub mod path;

pub use graph::{Edge, Graph, GraphBuilder, Node, NodeId, NodeKind, Point, Rgb};
pub use path::{find_request_path, RequestPath};
