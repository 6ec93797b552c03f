//! Traversal queries over the pose graph: sensor-filtered range search and
//! topology distance.

use std::collections::{HashMap, VecDeque};

use petgraph::algo::dijkstra;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use types::MapOrigin;

use crate::graph::PoseGraph;

/// Weight of edges not produced by any sensor (the root link); keeps
/// topology-distance queries from shortcutting through the origin.
const UNMATCHED_EDGE_WEIGHT: f64 = 100.0;

impl PoseGraph {
    /// Vertices reachable from `start` within `max_depth` hops, walking only
    /// edges produced by the given sensor.
    pub fn vertices_in_range(
        &self,
        start: NodeIndex,
        max_depth: u32,
        sensor: &str,
    ) -> Vec<NodeIndex> {
        let mut depth: HashMap<NodeIndex, u32> = HashMap::new();
        let mut queue = VecDeque::new();
        depth.insert(start, 0);
        queue.push_back(start);

        while let Some(node) = queue.pop_front() {
            let d = depth[&node];
            if d >= max_depth {
                continue;
            }
            for edge in self.inner().edges(node) {
                if edge.weight().sensor != sensor {
                    continue;
                }
                let next = edge.target();
                depth.entry(next).or_insert_with(|| {
                    queue.push_back(next);
                    d + 1
                });
            }
        }
        depth.into_keys().collect()
    }

    /// Shortest-path length from `source` to `target`, counting 1.0 per edge
    /// and [`UNMATCHED_EDGE_WEIGHT`] for root-link edges. Returns infinity
    /// when the target is unreachable.
    pub fn graph_distance(&self, source: NodeIndex, target: NodeIndex) -> f64 {
        let costs = dijkstra(self.inner(), source, Some(target), |e| {
            if e.weight().sensor == MapOrigin::SENSOR_NAME {
                UNMATCHED_EDGE_WEIGHT
            } else {
                1.0
            }
        });
        costs.get(&target).copied().unwrap_or(f64::INFINITY)
    }
}
