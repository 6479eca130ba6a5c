use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{config::SimulationConfig, rng::FlowRng};

const MARGIN_FRACTION: f64 = 0.08;
const JITTER_X: f64 = 0.1;
const JITTER_Y: f64 = 0.2;

/// Edge tints, indexed by the column an edge leaves from.
const PALETTE: [Rgb; 6] = [
    Rgb(96, 165, 250),
    Rgb(52, 211, 153),
    Rgb(251, 191, 36),
    Rgb(244, 114, 182),
    Rgb(167, 139, 250),
    Rgb(248, 113, 113),
];

/// Node identity, versioned by the graph rebuild that produced it.
///
/// Ids from an older generation never resolve against a newer graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Rebuild counter of the owning graph.
    pub generation: u32,
    /// Position in the node list.
    pub index: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}:{}", self.generation, self.index)
    }
}

/// 2D point in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Point {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

impl Point {
    /// Creates a point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    /// Linear interpolation towards `other`.
    #[must_use]
    pub fn lerp(self, other: Self, t: f64) -> Self {
        Self::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
        )
    }
}

/// RGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    /// `#rrggbb` form.
    #[must_use]
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

/// Role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// A group of users.
    UserGroup,
    /// A router in one layer.
    Router,
    /// A backend model.
    Model,
}

/// Graph node bound to a configured entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    /// Versioned id.
    pub id: NodeId,
    /// Role.
    pub kind: NodeKind,
    /// Layout position.
    pub position: Point,
    /// Router layer (routers only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<usize>,
    /// Id of the group, router, or model this node draws.
    pub entity_id: String,
}

/// Directed edge with its rectilinear polyline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    /// Source node.
    pub from: NodeId,
    /// Target node.
    pub to: NodeId,
    /// `[from, (mid_x, from_y), (mid_x, to_y), to]`.
    pub points: Vec<Point>,
    /// Visual tint.
    pub tint: Rgb,
}

/// Layered routing graph: groups → router layers → models.
#[derive(Debug, Clone, Serialize)]
pub struct Graph {
    generation: u32,
    width: f64,
    height: f64,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    #[serde(skip)]
    edge_index: HashMap<(NodeId, NodeId), usize>,
    #[serde(skip)]
    entity_index: HashMap<(NodeKind, String), NodeId>,
    #[serde(skip)]
    layers: Vec<Vec<NodeId>>,
}

impl Graph {
    fn empty(generation: u32, width: f64, height: f64) -> Self {
        Self {
            generation,
            width,
            height,
            nodes: Vec::new(),
            edges: Vec::new(),
            edge_index: HashMap::new(),
            entity_index: HashMap::new(),
            layers: Vec::new(),
        }
    }

    /// Rebuild counter this graph was produced by.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Canvas size the layout was computed for.
    #[must_use]
    pub fn size(&self) -> (f64, f64) {
        (self.width, self.height)
    }

    /// All nodes, groups first, then router layers, then models.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All edges.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Resolves a node id; ids from another generation resolve to `None`.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        if id.generation != self.generation {
            return None;
        }
        self.nodes.get(usize::try_from(id.index).ok()?)
    }

    /// Edge by position in [`Self::edges`].
    #[must_use]
    pub fn edge(&self, index: usize) -> Option<&Edge> {
        self.edges.get(index)
    }

    /// Index of the edge `from → to`, if present.
    #[must_use]
    pub fn edge_between(&self, from: NodeId, to: NodeId) -> Option<usize> {
        self.edge_index.get(&(from, to)).copied()
    }

    /// Node drawing the given entity.
    #[must_use]
    pub fn node_for(&self, kind: NodeKind, entity_id: &str) -> Option<NodeId> {
        self.entity_index
            .get(&(kind, entity_id.to_string()))
            .copied()
    }

    /// Node of a user group.
    #[must_use]
    pub fn group_node(&self, group_id: &str) -> Option<NodeId> {
        self.node_for(NodeKind::UserGroup, group_id)
    }

    /// Node of a router.
    #[must_use]
    pub fn router_node(&self, router_id: &str) -> Option<NodeId> {
        self.node_for(NodeKind::Router, router_id)
    }

    /// Node of a model.
    #[must_use]
    pub fn model_node(&self, model_id: &str) -> Option<NodeId> {
        self.node_for(NodeKind::Model, model_id)
    }

    /// Router node ids per non-empty layer.
    #[must_use]
    pub fn layers(&self) -> &[Vec<NodeId>] {
        &self.layers
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_node(
        &mut self,
        kind: NodeKind,
        entity_id: &str,
        position: Point,
        layer: Option<usize>,
    ) -> NodeId {
        let id = NodeId {
            generation: self.generation,
            index: self.nodes.len() as u32,
        };
        self.entity_index.insert((kind, entity_id.to_string()), id);
        self.nodes.push(Node {
            id,
            kind,
            position,
            layer,
            entity_id: entity_id.to_string(),
        });
        id
    }

    fn connect(&mut self, from: NodeId, to: NodeId, tint: Rgb) {
        let (Some(a), Some(b)) = (self.node(from), self.node(to)) else {
            return;
        };
        let (a, b) = (a.position, b.position);
        let mid_x = (a.x + b.x) / 2.0;
        let points = vec![a, Point::new(mid_x, a.y), Point::new(mid_x, b.y), b];
        self.edge_index.insert((from, to), self.edges.len());
        self.edges.push(Edge {
            from,
            to,
            points,
            tint,
        });
    }

    fn connect_all(&mut self, sources: &[NodeId], targets: &[NodeId], tint: Rgb) {
        for &from in sources {
            for &to in targets {
                self.connect(from, to, tint);
            }
        }
    }
}

/// Builds graphs, stamping each rebuild with a fresh generation.
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    generation: u32,
}

impl GraphBuilder {
    /// Creates a builder; the first graph gets generation 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the most recent build (0 before the first).
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Lays out one node per group, enabled router, and model, and wires
    /// consecutive columns together.
    ///
    /// Positions are jittered with `rng`, or with a generator seeded from
    /// `scatter_seed` when `keep_scatter` is set, so a resize reproduces the
    /// same relative scatter.
    pub fn build(
        &mut self,
        config: &SimulationConfig,
        width: f64,
        height: f64,
        rng: &mut FlowRng,
        keep_scatter: bool,
        scatter_seed: u32,
    ) -> Graph {
        self.generation = self.generation.wrapping_add(1);
        if keep_scatter {
            let mut scatter = FlowRng::new(scatter_seed);
            layout(config, width, height, &mut scatter, self.generation)
        } else {
            layout(config, width, height, rng, self.generation)
        }
    }
}

struct Column {
    x: f64,
    step_x: f64,
    height: f64,
}

impl Column {
    #[allow(clippy::cast_precision_loss)]
    fn place(&self, index: usize, count: usize, rng: &mut FlowRng) -> Point {
        let spacing = self.height / (count + 1) as f64;
        let x = self.x + rng.range(-JITTER_X, JITTER_X) * self.step_x;
        let y = spacing * (index + 1) as f64 + rng.range(-JITTER_Y, JITTER_Y) * spacing;
        Point::new(x, y)
    }
}

#[allow(clippy::cast_precision_loss)]
fn layout(
    config: &SimulationConfig,
    width: f64,
    height: f64,
    rng: &mut FlowRng,
    generation: u32,
) -> Graph {
    let mut graph = Graph::empty(generation, width, height);
    let layers = config.enabled_layers();
    let columns = layers.len() + 2;
    let margin = width * MARGIN_FRACTION;
    let step_x = (width - 2.0 * margin) / (columns - 1) as f64;
    let column = |idx: usize| Column {
        x: margin + step_x * idx as f64,
        step_x,
        height,
    };

    let group_column = column(0);
    let groups: Vec<NodeId> = config
        .groups
        .iter()
        .enumerate()
        .map(|(idx, group)| {
            let position = group_column.place(idx, config.groups.len(), rng);
            graph.add_node(NodeKind::UserGroup, &group.id, position, None)
        })
        .collect();

    for (layer_idx, members) in layers.iter().enumerate() {
        let router_column = column(layer_idx + 1);
        let ids: Vec<NodeId> = members
            .iter()
            .enumerate()
            .map(|(idx, &router_idx)| {
                let router = &config.routers[router_idx];
                let position = router_column.place(idx, members.len(), rng);
                graph.add_node(NodeKind::Router, &router.id, position, Some(layer_idx))
            })
            .collect();
        graph.layers.push(ids);
    }

    let model_column = column(columns - 1);
    let models: Vec<NodeId> = config
        .models
        .iter()
        .enumerate()
        .map(|(idx, model)| {
            let position = model_column.place(idx, config.models.len(), rng);
            graph.add_node(NodeKind::Model, &model.id, position, None)
        })
        .collect();

    let mut previous = groups;
    let router_layers = graph.layers.clone();
    for (col, layer) in router_layers.iter().enumerate() {
        graph.connect_all(&previous, layer, PALETTE[col % PALETTE.len()]);
        previous.clone_from(layer);
    }
    graph.connect_all(&previous, &models, PALETTE[router_layers.len() % PALETTE.len()]);
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        tests::{router, scenario_config},
        GroupConfig, ModelConfig,
    };

    fn layered_config() -> SimulationConfig {
        let mut config = scenario_config();
        config.groups.push(GroupConfig {
            id: "g2".into(),
            size: 10,
            profile: "steady".into(),
        });
        config.routers = vec![
            router("edge-a", 0, 0.01),
            router("edge-b", 0, 0.01),
            router("core", 1, 0.02),
        ];
        let mut second = config.models[0].clone();
        second.id = "m2".into();
        config.models.push(second);
        config
    }

    #[test]
    fn builds_layered_edges() {
        let config = layered_config();
        let graph = GraphBuilder::new().build(
            &config,
            1000.0,
            600.0,
            &mut FlowRng::new(1),
            false,
            0,
        );
        // 2 groups + 3 routers + 2 models
        assert_eq!(graph.nodes().len(), 7);
        // 2x2 + 2x1 + 1x2
        assert_eq!(graph.edges().len(), 8);
        assert_eq!(graph.layers().len(), 2);
        let g1 = graph.group_node("g1").unwrap();
        let edge_a = graph.router_node("edge-a").unwrap();
        let core = graph.router_node("core").unwrap();
        assert!(graph.edge_between(g1, edge_a).is_some());
        assert!(graph.edge_between(g1, core).is_none());
        assert!(graph.edge_between(edge_a, graph.model_node("m2").unwrap()).is_none());
        assert_eq!(graph.node(core).unwrap().layer, Some(1));
    }

    #[test]
    fn groups_connect_to_models_without_routers() {
        let config = scenario_config();
        let graph = GraphBuilder::new().build(
            &config,
            800.0,
            400.0,
            &mut FlowRng::new(1),
            false,
            0,
        );
        assert_eq!(graph.edges().len(), 1);
        let edge = &graph.edges()[0];
        assert_eq!(edge.from, graph.group_node("g1").unwrap());
        assert_eq!(edge.to, graph.model_node("m1").unwrap());
    }

    #[test]
    fn edges_are_rectilinear() {
        let graph = GraphBuilder::new().build(
            &layered_config(),
            1000.0,
            600.0,
            &mut FlowRng::new(4),
            false,
            0,
        );
        for edge in graph.edges() {
            let [a, b, c, d] = edge.points[..] else {
                panic!("expected four points");
            };
            assert_eq!(b.y, a.y);
            assert_eq!(b.x, c.x);
            assert_eq!(c.y, d.y);
            assert!((b.x - (a.x + d.x) / 2.0).abs() < 1e-9);
            assert_eq!(a, graph.node(edge.from).unwrap().position);
            assert_eq!(d, graph.node(edge.to).unwrap().position);
        }
    }

    #[test]
    fn disabled_routers_get_no_node() {
        let mut config = layered_config();
        config.routers[2].enabled = false;
        let graph = GraphBuilder::new().build(
            &config,
            1000.0,
            600.0,
            &mut FlowRng::new(1),
            false,
            0,
        );
        assert!(graph.router_node("core").is_none());
        assert_eq!(graph.layers().len(), 1);
        let edge_b = graph.router_node("edge-b").unwrap();
        assert!(graph.edge_between(edge_b, graph.model_node("m1").unwrap()).is_some());
    }

    #[test]
    fn keep_scatter_reproduces_layout() {
        let config = layered_config();
        let mut builder = GraphBuilder::new();
        let mut rng = FlowRng::new(99);
        let first = builder.build(&config, 1000.0, 600.0, &mut rng, true, 5);
        let second = builder.build(&config, 1000.0, 600.0, &mut rng, true, 5);
        let positions = |g: &Graph| g.nodes().iter().map(|n| n.position).collect::<Vec<_>>();
        assert_eq!(positions(&first), positions(&second));
        // the shared rng is untouched when the scatter is kept
        assert_eq!(rng, FlowRng::new(99));
        let scattered = builder.build(&config, 1000.0, 600.0, &mut rng, false, 5);
        assert_ne!(positions(&first), positions(&scattered));
    }

    #[test]
    fn generations_do_not_alias() {
        let config = scenario_config();
        let mut builder = GraphBuilder::new();
        let old = builder.build(&config, 800.0, 400.0, &mut FlowRng::new(1), false, 0);
        let new = builder.build(&config, 800.0, 400.0, &mut FlowRng::new(1), false, 0);
        let stale = old.group_node("g1").unwrap();
        assert_eq!(builder.generation(), 2);
        assert!(new.node(stale).is_none());
        assert!(old.node(stale).is_some());
        assert_ne!(stale, new.group_node("g1").unwrap());
    }

    #[test]
    fn nodes_stay_inside_canvas() {
        let mut config = layered_config();
        config.models.push(ModelConfig {
            id: "m3".into(),
            name: String::new(),
            price_per_1k: 1.0,
            min_billable_tokens: None,
            energy: None,
            weight: None,
        });
        let graph = GraphBuilder::new().build(
            &config,
            1200.0,
            800.0,
            &mut FlowRng::new(3),
            false,
            0,
        );
        for node in graph.nodes() {
            assert!((0.0..=1200.0).contains(&node.position.x));
            assert!((0.0..=800.0).contains(&node.position.y));
        }
        assert_eq!(Rgb(255, 0, 16).to_hex(), "#ff0010");
    }
}
