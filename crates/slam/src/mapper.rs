//! Incremental pose-graph mapper.
//!
//! Ingests measurements, decides which become vertices, solicits pairwise
//! scan matches for sequential and loop-closure edges, and drives the
//! attached solver incrementally. All operations are caller-serialized;
//! the mapper offers no internal locking.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;

use nalgebra::Translation3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use transforms::{Covariance, Transform, TransformWithCovariance};
use types::{MapOrigin, MeasurementRef};
use uuid::Uuid;

use crate::graph::{EdgeObject, GraphError, PoseGraph, VertexId, VertexObject};
use crate::odometry::Odometry;
use crate::sensor::{SensorError, SensorRef};
use crate::solver::Solver;
use crate::spatial_index::SpatialIndex;

use petgraph::graph::NodeIndex;

/// Id of the root vertex, created at construction and fixed at identity.
pub const ROOT_ID: VertexId = 0;

/// Sensor tag of odometry edges.
const ODOMETRY_SENSOR: &str = "Odometry";

#[derive(Error, Debug)]
pub enum MapperError {
    #[error("sensor '{0}' has not been registered")]
    UnknownSensor(String),
    #[error("a solver must be set before optimize() is called")]
    NoSolver,
    #[error("the solver failed to compute a solution")]
    OptimizationFailed,
    #[error("add_odometry_edges is set but no odometry source is attached")]
    MissingOdometry,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Solver(#[from] crate::solver::SolverError),
}

/// Mapper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperConfig {
    /// On first insert, adopt odometry's rotation as the initial orientation
    pub use_odometry_heading: bool,
    /// Create a vertex at the odometry-predicted pose with an "Odometry"
    /// edge before scan matching
    pub add_odometry_edges: bool,
    /// Cap on loop-closure attempts per insertion
    pub max_neighbor_links: usize,
    /// Radius (meters) of the nearest-pose query for loop-closure candidates
    pub neighbor_radius: f64,
    /// Hop radius for virtual-measurement construction; 0 disables patches
    pub patch_building_range: u32,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            use_odometry_heading: false,
            add_odometry_edges: false,
            max_neighbor_links: 1,
            neighbor_radius: 1.0,
            patch_building_range: 0,
        }
    }
}

/// Incremental pose-graph mapper.
///
/// Owns the pose graph, the indexes and the solver handle for its lifetime.
/// Multiple mappers may coexist in one process.
pub struct Mapper {
    config: MapperConfig,
    graph: PoseGraph,
    sensors: HashMap<String, SensorRef>,
    solver: Option<Box<dyn Solver>>,
    patch_solver: Option<Box<dyn Solver>>,
    odometry: Option<Box<dyn Odometry>>,
    spatial_index: Option<SpatialIndex>,
    root: NodeIndex,
    last_vertex: Option<NodeIndex>,
    last_odometric_pose: Transform,
    /// Accumulated motion since the last inserted vertex
    current_pose: Transform,
    optimized: bool,
}

impl Mapper {
    /// Create a mapper with the root vertex already in place.
    pub fn new(config: MapperConfig) -> Self {
        let mut graph = PoseGraph::new();
        let origin: MeasurementRef = std::sync::Arc::new(MapOrigin::new());
        let (_, root) = graph.add_vertex(origin, Transform::identity(), "root".to_string());
        Self {
            config,
            graph,
            sensors: HashMap::new(),
            solver: None,
            patch_solver: None,
            odometry: None,
            spatial_index: None,
            root,
            last_vertex: None,
            last_odometric_pose: Transform::identity(),
            current_pose: Transform::identity(),
            optimized: false,
        }
    }

    /// Register a sensor under its unique name. An already registered name
    /// is kept and the new sensor ignored.
    pub fn register_sensor(&mut self, sensor: SensorRef) {
        let name = sensor.name().to_string();
        if self.sensors.contains_key(&name) {
            warn!(sensor = %name, "sensor is already registered");
            return;
        }
        self.sensors.insert(name, sensor);
    }

    /// Attach the global solver. The current graph is replayed into it
    /// (every vertex, every constraint once) and the root is anchored, so
    /// the solver's state matches the graph from here on.
    pub fn set_solver(&mut self, mut solver: Box<dyn Solver>) -> Result<(), MapperError> {
        for v in self.graph.vertices() {
            solver.add_node(v.id, v.corrected_pose)?;
        }
        for e in self.graph.constraints() {
            solver.add_constraint(e.source, e.target, e.transform, e.covariance)?;
        }
        solver.set_fixed(ROOT_ID)?;
        self.solver = Some(solver);
        Ok(())
    }

    /// Attach the scratch solver used to relax patches before building
    /// virtual measurements.
    pub fn set_patch_solver(&mut self, solver: Box<dyn Solver>) {
        self.patch_solver = Some(solver);
    }

    /// Attach a dead-reckoning source.
    pub fn set_odometry(&mut self, odometry: Box<dyn Odometry>) {
        self.odometry = Some(odometry);
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    pub fn set_use_odometry_heading(&mut self, enabled: bool) {
        self.config.use_odometry_heading = enabled;
    }

    pub fn set_add_odometry_edges(&mut self, enabled: bool) {
        self.config.add_odometry_edges = enabled;
    }

    pub fn set_max_neighbor_links(&mut self, links: usize) {
        self.config.max_neighbor_links = links;
    }

    pub fn set_neighbor_radius(&mut self, radius: f64) {
        self.config.neighbor_radius = radius;
    }

    pub fn set_patch_building_range(&mut self, range: u32) {
        self.config.patch_building_range = range;
    }

    /// Best current estimate of the robot pose: the last vertex's corrected
    /// pose composed with the motion accumulated since.
    pub fn current_pose(&self) -> Transform {
        match self.last_vertex {
            Some(vertex) => self.graph.vertex(vertex).corrected_pose * self.current_pose,
            None => self.current_pose,
        }
    }

    /// Whether a successful optimization has been applied.
    pub fn optimized(&self) -> bool {
        self.optimized
    }

    pub fn graph(&self) -> &PoseGraph {
        &self.graph
    }

    pub fn spatial_index(&self) -> Option<&SpatialIndex> {
        self.spatial_index.as_ref()
    }

    pub fn vertex(&self, id: VertexId) -> Result<&VertexObject, GraphError> {
        self.graph.vertex_by_id(id)
    }

    pub fn vertex_by_uuid(&self, uuid: Uuid) -> Result<&VertexObject, GraphError> {
        self.graph.vertex_by_uuid(uuid)
    }

    pub fn edge(
        &self,
        source: VertexId,
        target: VertexId,
        sensor: &str,
    ) -> Result<EdgeObject, GraphError> {
        self.graph.get_edge(source, target, sensor)
    }

    pub fn out_edges(&self, id: VertexId) -> Result<Vec<EdgeObject>, GraphError> {
        Ok(self.graph.out_edges(self.graph.node_index(id)?))
    }

    pub fn vertices_from_sensor(&self, sensor: &str) -> Vec<VertexObject> {
        self.graph.vertices_from_sensor(sensor)
    }

    pub fn edges_from_sensor(&self, sensor: &str) -> Vec<EdgeObject> {
        self.graph.edges_from_sensor(sensor)
    }

    /// Dump the graph to `<base_name>.dot` for offline inspection.
    pub fn write_graph_to_file(&self, base_name: &str) -> io::Result<()> {
        let path = format!("{base_name}.dot");
        info!(path = %path, "writing graph to file");
        let mut file = File::create(&path)?;
        self.graph.write_dot(&mut file)
    }

    /// Process a new reading.
    ///
    /// Returns `Ok(true)` when a vertex was inserted, `Ok(false)` when the
    /// reading was rejected (below the admission thresholds, no odometry
    /// data, or unmatched without odometry support). `force` bypasses the
    /// admission thresholds.
    pub fn add_reading(
        &mut self,
        measurement: MeasurementRef,
        force: bool,
    ) -> Result<bool, MapperError> {
        let sensor = self
            .sensors
            .get(measurement.sensor_name())
            .cloned()
            .ok_or_else(|| MapperError::UnknownSensor(measurement.sensor_name().to_string()))?;
        debug!(sensor = sensor.name(), "adding reading");

        let mut odometric_pose = Transform::identity();
        if let Some(odometry) = self.odometry.as_mut() {
            match odometry.odometric_pose(measurement.timestamp()) {
                Ok(pose) => odometric_pose = pose,
                Err(e) => {
                    warn!(error = %e, "could not get odometry data, reading rejected");
                    return Ok(false);
                }
            }
        }

        let Some(last_vertex) = self.last_vertex else {
            return self.add_first_reading(measurement, &sensor, odometric_pose);
        };

        let mut new_vertex: Option<NodeIndex> = None;
        let mut odom_dist = Transform::identity();

        if self.odometry.is_some() {
            odom_dist = (self.last_odometric_pose.inverse() * odometric_pose).orthogonalized();
            self.current_pose = odom_dist;
            if !force && !sensor.check_min_distance(&odom_dist) {
                return Ok(false);
            }
        }

        if self.config.add_odometry_edges {
            let Some(odometry) = self.odometry.as_ref() else {
                return Err(MapperError::MissingOdometry);
            };
            let covariance = odometry.calculate_covariance(&odom_dist);
            let last_pose = self.graph.vertex(last_vertex).corrected_pose;
            let vertex =
                self.add_vertex(measurement.clone(), (last_pose * self.current_pose).orthogonalized())?;
            self.add_edge(last_vertex, vertex, odom_dist, covariance, ODOMETRY_SENSOR, "odom")?;
            new_vertex = Some(vertex);
        }

        // Sequential edge to the previous vertex, matched against its raw
        // measurement or a patch built around it
        let target_m = if self.config.patch_building_range > 0 {
            self.build_patch(last_vertex, &sensor)?
        } else {
            self.graph.vertex(last_vertex).measurement.clone()
        };

        match sensor.calculate_transform(
            target_m.as_ref(),
            measurement.as_ref(),
            self.current_pose,
            false,
        ) {
            Ok(twc) => {
                self.current_pose = twc.transform;
                let last_pose = self.graph.vertex(last_vertex).corrected_pose;
                let corrected = (last_pose * twc.transform).orthogonalized();
                let vertex = match new_vertex {
                    Some(vertex) => {
                        self.graph.set_corrected_pose(vertex, corrected);
                        vertex
                    }
                    None => {
                        if !force && !sensor.check_min_distance(&twc.transform) {
                            return Ok(false);
                        }
                        self.add_vertex(measurement.clone(), corrected)?
                    }
                };
                self.add_edge(
                    last_vertex,
                    vertex,
                    twc.transform,
                    twc.covariance,
                    sensor.name(),
                    "seq",
                )?;
                new_vertex = Some(vertex);
            }
            Err(SensorError::NoMatch(reason)) => match new_vertex {
                Some(vertex) => {
                    warn!(
                        vertex = self.graph.vertex(vertex).id,
                        %reason,
                        "failed to match new vertex to previous"
                    );
                }
                None => {
                    warn!(%reason, "measurement could not be matched and no odometry was available");
                    return Ok(false);
                }
            },
            Err(e) => return Err(e.into()),
        }

        let Some(vertex) = new_vertex else {
            return Ok(false);
        };

        self.rebuild_spatial_index(sensor.name());
        self.link_to_neighbors(vertex, &sensor)?;

        self.last_vertex = Some(vertex);
        self.last_odometric_pose = odometric_pose;
        self.current_pose = Transform::identity();
        Ok(true)
    }

    /// The very first reading is admitted unconditionally and linked to the
    /// root.
    fn add_first_reading(
        &mut self,
        measurement: MeasurementRef,
        sensor: &SensorRef,
        odometric_pose: Transform,
    ) -> Result<bool, MapperError> {
        if self.config.use_odometry_heading {
            self.current_pose = Transform::from_parts(
                Translation3::from(self.current_pose.translation()),
                odometric_pose.rotation(),
            );
        }
        let vertex = self.add_vertex(measurement, self.current_pose)?;
        self.add_edge(
            self.root,
            vertex,
            self.current_pose,
            Covariance::identity() * 100.0,
            MapOrigin::SENSOR_NAME,
            "root-link",
        )?;
        info!("added first vertex to the graph");

        self.last_vertex = Some(vertex);
        self.last_odometric_pose = odometric_pose;
        self.rebuild_spatial_index(sensor.name());
        self.link_to_neighbors(vertex, sensor)?;
        self.current_pose = Transform::identity();
        Ok(true)
    }

    /// Insert a vertex referenced from a known vertex of another robot.
    pub fn add_external_reading(
        &mut self,
        measurement: MeasurementRef,
        source: Uuid,
        transform: Transform,
        covariance: Covariance,
        sensor: &str,
    ) -> Result<(), MapperError> {
        if self.graph.contains_uuid(measurement.uuid()) {
            return Err(GraphError::DuplicateMeasurement(measurement.uuid()).into());
        }
        let source_node = self.graph.node_index_by_uuid(source)?;
        let pose = (self.graph.vertex(source_node).corrected_pose * transform).orthogonalized();
        let vertex = self.add_vertex(measurement, pose)?;
        self.add_edge(source_node, vertex, transform, covariance, sensor, "ext")
    }

    /// Insert an externally supplied constraint between two known vertices.
    pub fn add_external_constraint(
        &mut self,
        source: Uuid,
        target: Uuid,
        transform: Transform,
        covariance: Covariance,
        sensor: &str,
    ) -> Result<(), MapperError> {
        let source_node = self.graph.node_index_by_uuid(source)?;
        let target_node = self.graph.node_index_by_uuid(target)?;
        let source_id = self.graph.vertex(source_node).id;
        let target_id = self.graph.vertex(target_node).id;
        match self.graph.get_edge(source_id, target_id, sensor) {
            Ok(_) => Err(GraphError::DuplicateEdge {
                source_vertex: source_id,
                target: target_id,
                sensor: sensor.to_string(),
            }
            .into()),
            Err(GraphError::InvalidEdge { .. }) => {
                self.add_edge(source_node, target_node, transform, covariance, sensor, "ext")
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run the attached solver and apply its corrections to the graph.
    pub fn optimize(&mut self) -> Result<(), MapperError> {
        let corrections = {
            let Some(solver) = self.solver.as_mut() else {
                error!("a solver must be set before optimize() is called");
                return Err(MapperError::NoSolver);
            };
            if !solver.compute() {
                return Err(MapperError::OptimizationFailed);
            }
            solver.corrections()
        };
        self.optimized = true;
        for (id, pose) in corrections {
            if self.graph.apply_correction(id, pose).is_err() {
                error!(id, "correction references a vertex that does not exist");
            }
        }
        Ok(())
    }

    fn add_vertex(
        &mut self,
        measurement: MeasurementRef,
        corrected_pose: Transform,
    ) -> Result<NodeIndex, MapperError> {
        let id = self.graph.next_id();
        let label = format!(
            "{}:{}({})",
            measurement.robot_name(),
            measurement.sensor_name(),
            id
        );
        let (id, vertex) = self.graph.add_vertex(measurement, corrected_pose, label);
        if let Some(solver) = self.solver.as_mut() {
            solver.add_node(id, corrected_pose)?;
        }
        info!(id, "created vertex");
        Ok(vertex)
    }

    fn add_edge(
        &mut self,
        source: NodeIndex,
        target: NodeIndex,
        transform: Transform,
        covariance: Covariance,
        sensor: &str,
        label: &str,
    ) -> Result<(), MapperError> {
        let (source_id, target_id) =
            self.graph
                .add_edge(source, target, transform, covariance, sensor, label);
        if let Some(solver) = self.solver.as_mut() {
            solver.add_constraint(source_id, target_id, transform, covariance)?;
        }
        info!(source = source_id, target = target_id, sensor, label, "created edge");
        Ok(())
    }

    /// Condense the local history around `source` into a virtual reference
    /// measurement. With a patch solver attached the local subgraph is
    /// relaxed first; corrections touch local copies only, never the graph.
    fn build_patch(
        &mut self,
        source: NodeIndex,
        sensor: &SensorRef,
    ) -> Result<MeasurementRef, MapperError> {
        let nodes =
            self.graph
                .vertices_in_range(source, self.config.patch_building_range, sensor.name());
        let mut objects: Vec<VertexObject> = nodes
            .iter()
            .map(|&node| self.graph.vertex(node).clone())
            .collect();

        if let Some(patch_solver) = self.patch_solver.as_mut() {
            patch_solver.clear();
            for v in &objects {
                patch_solver.add_node(v.id, v.corrected_pose)?;
            }
            let ids: HashSet<VertexId> = objects.iter().map(|v| v.id).collect();
            for e in self.graph.induced_edges(&ids) {
                patch_solver.add_constraint(e.source, e.target, e.transform, e.covariance)?;
            }
            patch_solver.set_fixed(self.graph.vertex(source).id)?;
            patch_solver.compute();
            for (id, pose) in patch_solver.corrections() {
                match objects.iter_mut().find(|v| v.id == id) {
                    Some(v) => v.corrected_pose = pose,
                    None => {
                        error!(id, "patch solver returned a correction for a vertex outside the patch")
                    }
                }
            }
        }

        let origin = self.graph.vertex(source).corrected_pose;
        Ok(sensor.create_combined_measurement(&objects, &origin)?)
    }

    /// Match two vertices and add a loop-closure edge between them.
    fn link(
        &mut self,
        source: NodeIndex,
        target: NodeIndex,
        sensor: &SensorRef,
    ) -> Result<TransformWithCovariance, MapperError> {
        let source_id = self.graph.vertex(source).id;
        let target_id = self.graph.vertex(target).id;
        if self.graph.vertex(target).measurement.sensor_name() != sensor.name() {
            return Err(GraphError::InvalidEdge {
                source_vertex: source_id,
                target: target_id,
                sensor: sensor.name().to_string(),
            }
            .into());
        }

        let source_pose = self.graph.vertex(source).corrected_pose;
        let target_pose = self.graph.vertex(target).corrected_pose;

        let (source_m, target_m) = if self.config.patch_building_range > 0 {
            (
                self.build_patch(source, sensor)?,
                self.build_patch(target, sensor)?,
            )
        } else {
            (
                self.graph.vertex(source).measurement.clone(),
                self.graph.vertex(target).measurement.clone(),
            )
        };

        // Coarse pass widens the basin, fine pass refines its estimate
        let guess = source_pose.inverse() * target_pose;
        let coarse =
            sensor.calculate_transform(source_m.as_ref(), target_m.as_ref(), guess, true)?;
        let twc = sensor.calculate_transform(
            source_m.as_ref(),
            target_m.as_ref(),
            coarse.transform,
            false,
        )?;

        self.add_edge(
            source,
            target,
            twc.transform,
            twc.covariance,
            sensor.name(),
            "loop",
        )?;
        Ok(twc)
    }

    /// Try to close loops between a fresh vertex and spatially nearby,
    /// topologically distant vertices of the same sensor.
    fn link_to_neighbors(
        &mut self,
        vertex: NodeIndex,
        sensor: &SensorRef,
    ) -> Result<(), MapperError> {
        let mut excluded: HashSet<NodeIndex> = HashSet::new();
        excluded.insert(vertex);
        for neighbor in self.graph.neighbors_by_sensor(vertex, sensor.name()) {
            excluded.insert(neighbor);
        }

        let neighbors = match &self.spatial_index {
            Some(index) => index.neighbors_within(
                self.graph.vertex(vertex).corrected_pose.translation(),
                self.config.neighbor_radius,
            ),
            None => Vec::new(),
        };

        let vertex_id = self.graph.vertex(vertex).id;
        let mut attempts = 0;
        for candidate in neighbors {
            if attempts >= self.config.max_neighbor_links {
                break;
            }
            if excluded.contains(&candidate) {
                continue;
            }
            let distance = self.graph.graph_distance(candidate, vertex);
            let candidate_id = self.graph.vertex(candidate).id;
            debug!(
                from = candidate_id,
                to = vertex_id,
                distance,
                "graph distance to loop-closure candidate"
            );
            if distance < f64::from(2 * self.config.patch_building_range) {
                continue;
            }
            attempts += 1;
            match self.link(candidate, vertex, sensor) {
                Ok(_) => {}
                Err(MapperError::Sensor(SensorError::NoMatch(reason))) => {
                    warn!(
                        from = candidate_id,
                        to = vertex_id,
                        %reason,
                        "failed to match loop-closure candidate"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn rebuild_spatial_index(&mut self, sensor: &str) {
        self.spatial_index = Some(SpatialIndex::build(&self.graph, sensor));
    }
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new(MapperConfig::default())
    }
}
