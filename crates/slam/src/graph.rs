//! Pose graph: measurement vertices linked by rigid-body constraints.
//!
//! Every logical constraint is stored once, in its canonical (forward)
//! direction; the inverse view is synthesized when edges are read from the
//! target side. Vertices and constraints are append-only for the lifetime of
//! the graph.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use thiserror::Error;
use transforms::{Covariance, Transform};
use types::MeasurementRef;
use uuid::Uuid;

/// Monotonically increasing vertex id, never reused. Id 0 is the root.
pub type VertexId = u64;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("vertex {0} does not exist")]
    UnknownVertex(VertexId),
    #[error("no vertex with uuid {0}")]
    UnknownUuid(Uuid),
    #[error("measurement {0} is already attached to a vertex")]
    DuplicateMeasurement(Uuid),
    #[error("no '{sensor}' edge between vertex {source_vertex} and vertex {target}")]
    InvalidEdge {
        source_vertex: VertexId,
        target: VertexId,
        sensor: String,
    },
    #[error("a '{sensor}' edge between vertex {source_vertex} and vertex {target} already exists")]
    DuplicateEdge {
        source_vertex: VertexId,
        target: VertexId,
        sensor: String,
    },
}

/// A vertex of the pose graph.
#[derive(Clone)]
pub struct VertexObject {
    /// Unique identifier
    pub id: VertexId,
    /// Human-readable label, `{robot}:{sensor}({id})`
    pub label: String,
    /// Best current global pose estimate; mutated on insertion and by
    /// optimizer corrections only
    pub corrected_pose: Transform,
    /// The reading this vertex represents
    pub measurement: MeasurementRef,
}

/// A constraint between two vertices, oriented source -> target.
#[derive(Debug, Clone)]
pub struct EdgeObject {
    pub source: VertexId,
    pub target: VertexId,
    /// Relative transform measured from source to target
    pub transform: Transform,
    pub covariance: Covariance,
    /// Name of the sensor that produced this constraint
    pub sensor: String,
    /// Constraint kind: "root-link", "odom", "seq", "loop" or "ext"
    pub label: String,
}

impl EdgeObject {
    /// The same constraint viewed from the target side.
    pub fn inverted(&self) -> EdgeObject {
        EdgeObject {
            source: self.target,
            target: self.source,
            transform: self.transform.inverse(),
            covariance: self.covariance,
            sensor: self.sensor.clone(),
            label: self.label.clone(),
        }
    }
}

/// Directed multi-graph of pose vertices with id and uuid lookup.
pub struct PoseGraph {
    graph: UnGraph<VertexObject, EdgeObject>,
    id_index: HashMap<VertexId, NodeIndex>,
    uuid_index: HashMap<Uuid, NodeIndex>,
    next_id: VertexId,
}

impl PoseGraph {
    pub fn new() -> Self {
        Self {
            graph: UnGraph::default(),
            id_index: HashMap::new(),
            uuid_index: HashMap::new(),
            next_id: 0,
        }
    }

    /// Id that the next inserted vertex will receive.
    pub fn next_id(&self) -> VertexId {
        self.next_id
    }

    /// Insert a vertex, assigning the next free id.
    pub fn add_vertex(
        &mut self,
        measurement: MeasurementRef,
        corrected_pose: Transform,
        label: String,
    ) -> (VertexId, NodeIndex) {
        let id = self.next_id;
        self.next_id += 1;
        let uuid = measurement.uuid();
        let node = self.graph.add_node(VertexObject {
            id,
            label,
            corrected_pose,
            measurement,
        });
        self.id_index.insert(id, node);
        self.uuid_index.insert(uuid, node);
        (id, node)
    }

    /// Insert a constraint between two vertices. Returns the vertex ids in
    /// the forward direction.
    pub fn add_edge(
        &mut self,
        source: NodeIndex,
        target: NodeIndex,
        transform: Transform,
        covariance: Covariance,
        sensor: &str,
        label: &str,
    ) -> (VertexId, VertexId) {
        let source_id = self.graph[source].id;
        let target_id = self.graph[target].id;
        self.graph.add_edge(
            source,
            target,
            EdgeObject {
                source: source_id,
                target: target_id,
                transform,
                covariance,
                sensor: sensor.to_string(),
                label: label.to_string(),
            },
        );
        (source_id, target_id)
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of logical constraints (each counted once).
    pub fn constraint_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains_uuid(&self, uuid: Uuid) -> bool {
        self.uuid_index.contains_key(&uuid)
    }

    pub fn node_index(&self, id: VertexId) -> Result<NodeIndex, GraphError> {
        self.id_index
            .get(&id)
            .copied()
            .ok_or(GraphError::UnknownVertex(id))
    }

    pub fn node_index_by_uuid(&self, uuid: Uuid) -> Result<NodeIndex, GraphError> {
        self.uuid_index
            .get(&uuid)
            .copied()
            .ok_or(GraphError::UnknownUuid(uuid))
    }

    pub fn vertex(&self, node: NodeIndex) -> &VertexObject {
        &self.graph[node]
    }

    pub fn vertex_by_id(&self, id: VertexId) -> Result<&VertexObject, GraphError> {
        Ok(&self.graph[self.node_index(id)?])
    }

    pub fn vertex_by_uuid(&self, uuid: Uuid) -> Result<&VertexObject, GraphError> {
        Ok(&self.graph[self.node_index_by_uuid(uuid)?])
    }

    pub fn set_corrected_pose(&mut self, node: NodeIndex, pose: Transform) {
        self.graph[node].corrected_pose = pose;
    }

    /// Overwrite a vertex pose with an optimizer correction.
    pub fn apply_correction(&mut self, id: VertexId, pose: Transform) -> Result<(), GraphError> {
        let node = self.node_index(id)?;
        self.graph[node].corrected_pose = pose;
        Ok(())
    }

    pub fn vertices(&self) -> impl Iterator<Item = &VertexObject> {
        self.graph.node_weights()
    }

    /// All logical constraints, each once in its forward direction.
    pub fn constraints(&self) -> impl Iterator<Item = &EdgeObject> {
        self.graph.edge_weights()
    }

    pub fn vertices_from_sensor(&self, sensor: &str) -> Vec<VertexObject> {
        self.graph
            .node_weights()
            .filter(|v| v.measurement.sensor_name() == sensor)
            .cloned()
            .collect()
    }

    pub fn nodes_from_sensor(&self, sensor: &str) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&n| self.graph[n].measurement.sensor_name() == sensor)
            .collect()
    }

    pub fn edges_from_sensor(&self, sensor: &str) -> Vec<EdgeObject> {
        self.graph
            .edge_weights()
            .filter(|e| e.sensor == sensor)
            .cloned()
            .collect()
    }

    /// All constraints incident to a vertex, oriented away from it.
    pub fn out_edges(&self, node: NodeIndex) -> Vec<EdgeObject> {
        let id = self.graph[node].id;
        self.graph
            .edges(node)
            .map(|e| {
                let obj = e.weight();
                if obj.source == id {
                    obj.clone()
                } else {
                    obj.inverted()
                }
            })
            .collect()
    }

    /// Vertices connected to `node` by a constraint of the given sensor.
    pub fn neighbors_by_sensor(&self, node: NodeIndex, sensor: &str) -> Vec<NodeIndex> {
        self.graph
            .edges(node)
            .filter(|e| e.weight().sensor == sensor)
            .map(|e| e.target())
            .collect()
    }

    /// Probe for a constraint of the given sensor between two vertices.
    ///
    /// The returned edge is oriented so that `source` matches the queried
    /// source id.
    pub fn get_edge(
        &self,
        source: VertexId,
        target: VertexId,
        sensor: &str,
    ) -> Result<EdgeObject, GraphError> {
        let node = self.node_index(source)?;
        for e in self.graph.edges(node) {
            if self.graph[e.target()].id == target && e.weight().sensor == sensor {
                let obj = e.weight();
                return Ok(if obj.source == source {
                    obj.clone()
                } else {
                    obj.inverted()
                });
            }
        }
        Err(GraphError::InvalidEdge {
            source_vertex: source,
            target,
            sensor: sensor.to_string(),
        })
    }

    /// Constraints whose both endpoints lie in the given vertex set.
    pub fn induced_edges(&self, ids: &HashSet<VertexId>) -> Vec<EdgeObject> {
        self.graph
            .edge_weights()
            .filter(|e| ids.contains(&e.source) && ids.contains(&e.target))
            .cloned()
            .collect()
    }

    /// Dot-format dump for offline inspection. One line per vertex keyed by
    /// id, one line per forward edge.
    pub fn write_dot<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "digraph pose_graph {{")?;
        for v in self.graph.node_weights() {
            writeln!(out, "    {} [label=\"{}\"];", v.id, v.label)?;
        }
        for e in self.graph.edge_weights() {
            writeln!(out, "    {} -> {} [label=\"{}\"];", e.source, e.target, e.label)?;
        }
        writeln!(out, "}}")
    }

    pub(crate) fn inner(&self) -> &UnGraph<VertexObject, EdgeObject> {
        &self.graph
    }
}

impl Default for PoseGraph {
    fn default() -> Self {
        Self::new()
    }
}
