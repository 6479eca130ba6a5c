use super::graph::{Edge, Graph, NodeId};

/// Edges a request traverses from its group to its model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestPath {
    /// Indices into [`Graph::edges`], in traversal order.
    pub edges: Vec<usize>,
    /// Hops skipped because the graph had no matching node or edge.
    pub missing_hops: u32,
}

impl RequestPath {
    /// Whether every hop resolved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing_hops == 0
    }

    /// Resolves the edge indices against the graph they came from.
    #[must_use]
    pub fn resolve<'g>(&self, graph: &'g Graph) -> Vec<&'g Edge> {
        self.edges.iter().filter_map(|&idx| graph.edge(idx)).collect()
    }
}

/// Walks `group → routers… → model`, one layer at a time.
///
/// Each hop looks up the precomputed edge between the current node and the
/// next router's node. A hop with no edge is skipped and counted in
/// [`RequestPath::missing_hops`]; the walk continues from the next node so
/// later hops can still resolve.
#[must_use]
pub fn find_request_path(
    graph: &Graph,
    group_node: NodeId,
    router_path: &[&str],
    target_model: NodeId,
) -> RequestPath {
    let mut path = RequestPath::default();
    let mut current = group_node;
    let hops = router_path
        .iter()
        .map(|router_id| graph.router_node(router_id))
        .chain(std::iter::once(graph.node(target_model).map(|node| node.id)));
    for next in hops {
        let Some(next) = next else {
            path.missing_hops += 1;
            continue;
        };
        match graph.edge_between(current, next) {
            Some(edge) => path.edges.push(edge),
            None => path.missing_hops += 1,
        }
        current = next;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::tests::{router, scenario_config},
        rng::FlowRng,
        routing::GraphBuilder,
    };

    fn graph() -> Graph {
        let mut config = scenario_config();
        config.routers = vec![
            router("edge-a", 0, 0.0),
            router("edge-b", 0, 0.0),
            router("core", 1, 0.0),
        ];
        GraphBuilder::new().build(&config, 1000.0, 600.0, &mut FlowRng::new(1), false, 0)
    }

    #[test]
    fn resolves_full_path() {
        let graph = graph();
        let group = graph.group_node("g1").unwrap();
        let model = graph.model_node("m1").unwrap();
        let path = find_request_path(&graph, group, &["edge-b", "core"], model);
        assert!(path.is_complete());
        let edges = path.resolve(&graph);
        assert_eq!(edges.len(), 3);
        assert_eq!(edges[0].from, group);
        assert_eq!(edges[0].to, graph.router_node("edge-b").unwrap());
        assert_eq!(edges[1].to, graph.router_node("core").unwrap());
        assert_eq!(edges[2].to, model);
        for pair in edges.windows(2) {
            assert_eq!(pair[0].to, pair[1].from);
        }
    }

    #[test]
    fn direct_path_without_routers() {
        let graph = graph();
        let config = scenario_config();
        let direct = GraphBuilder::new().build(
            &config,
            800.0,
            400.0,
            &mut FlowRng::new(1),
            false,
            0,
        );
        let path = find_request_path(
            &direct,
            direct.group_node("g1").unwrap(),
            &[],
            direct.model_node("m1").unwrap(),
        );
        assert_eq!(path.edges.len(), 1);
        assert!(path.is_complete());
        // group → model does not exist once routers are present
        let layered = find_request_path(
            &graph,
            graph.group_node("g1").unwrap(),
            &[],
            graph.model_node("m1").unwrap(),
        );
        assert!(layered.edges.is_empty());
        assert_eq!(layered.missing_hops, 1);
    }

    #[test]
    fn skipped_layer_counts_missing_hop() {
        let graph = graph();
        let group = graph.group_node("g1").unwrap();
        let model = graph.model_node("m1").unwrap();
        let path = find_request_path(&graph, group, &["core"], model);
        assert_eq!(path.missing_hops, 1);
        assert_eq!(path.edges.len(), 1);
        assert_eq!(path.resolve(&graph)[0].from, graph.router_node("core").unwrap());
    }

    #[test]
    fn unknown_router_and_stale_model_are_counted() {
        let graph = graph();
        let group = graph.group_node("g1").unwrap();
        let mut stale_model = graph.model_node("m1").unwrap();
        stale_model.generation += 1;
        let path = find_request_path(&graph, group, &["ghost", "core"], stale_model);
        assert_eq!(path.missing_hops, 3);
        assert!(path.edges.is_empty());
    }
}
