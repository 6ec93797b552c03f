//! Nearest-pose index over the vertices of one sensor.
//!
//! Rebuilt from scratch after every insertion for that sensor: the optimizer
//! may move every corrected pose between rebuilds, so incremental
//! maintenance cannot be trusted at typical graph sizes.

use nalgebra::Vector3;
use petgraph::graph::NodeIndex;
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use tracing::debug;

use crate::graph::PoseGraph;

/// One indexed vertex translation, carrying its graph descriptor.
#[derive(Debug, Clone)]
struct IndexedTranslation {
    point: [f64; 3],
    node: NodeIndex,
}

impl RTreeObject for IndexedTranslation {
    type Envelope = AABB<[f64; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

impl PointDistance for IndexedTranslation {
    fn distance_2(&self, point: &[f64; 3]) -> f64 {
        let dx = self.point[0] - point[0];
        let dy = self.point[1] - point[1];
        let dz = self.point[2] - point[2];
        dx * dx + dy * dy + dz * dz
    }
}

/// 3D radius-search index over vertex translations.
pub struct SpatialIndex {
    tree: RTree<IndexedTranslation>,
    sensor: String,
}

impl SpatialIndex {
    /// Index every vertex whose measurement belongs to the given sensor.
    pub fn build(graph: &PoseGraph, sensor: &str) -> Self {
        let entries: Vec<IndexedTranslation> = graph
            .nodes_from_sensor(sensor)
            .into_iter()
            .map(|node| {
                let t = graph.vertex(node).corrected_pose.translation();
                IndexedTranslation {
                    point: [t.x, t.y, t.z],
                    node,
                }
            })
            .collect();
        debug!(sensor, vertices = entries.len(), "rebuilt nearest-pose index");
        Self {
            tree: RTree::bulk_load(entries),
            sensor: sensor.to_string(),
        }
    }

    /// Sensor this index was built for.
    pub fn sensor(&self) -> &str {
        &self.sensor
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// All indexed vertices within Euclidean distance `radius` of `point`.
    /// Completeness is guaranteed; ordering is not.
    pub fn neighbors_within(&self, point: Vector3<f64>, radius: f64) -> Vec<NodeIndex> {
        self.tree
            .locate_within_distance([point.x, point.y, point.z], radius * radius)
            .map(|entry| entry.node)
            .collect()
    }

    /// Translations currently stored in the index.
    pub fn positions(&self) -> impl Iterator<Item = Vector3<f64>> + '_ {
        self.tree
            .iter()
            .map(|entry| Vector3::new(entry.point[0], entry.point[1], entry.point[2]))
    }
}
