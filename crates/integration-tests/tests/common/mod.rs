//! Mock ports for driving the mapper through end-to-end scenarios.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use nalgebra::{DMatrix, DVector, Translation3, Vector3};
use slam::{
    IdPoseVec, Odometry, OdometryError, Sensor, SensorError, Solver, SolverError, VertexId,
    VertexObject,
};
use transforms::{Covariance, Transform, TransformWithCovariance};
use types::{BasicMeasurement, Measurement, MeasurementRef, Timestamp};

/// A reading for the given sensor, stamped with the given time.
pub fn reading_at(sensor: &str, time: Timestamp) -> MeasurementRef {
    Arc::new(BasicMeasurement::new(
        "robot",
        sensor,
        time,
        Transform::identity(),
    ))
}

/// A reading for the given sensor, stamped now.
pub fn reading(sensor: &str) -> MeasurementRef {
    reading_at(sensor, Utc::now())
}

/// Scan matcher that replays a scripted queue of responses, falling back to
/// a fixed transform (or NoMatch) once the queue runs dry.
pub struct ScriptedSensor {
    name: String,
    responses: RefCell<VecDeque<Transform>>,
    fallback: Option<Transform>,
    echo_guess: bool,
    min_translation: f64,
    min_rotation: f64,
}

impl ScriptedSensor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            responses: RefCell::new(VecDeque::new()),
            fallback: None,
            echo_guess: false,
            min_translation: 0.0,
            min_rotation: 0.0,
        }
    }

    pub fn with_fallback(mut self, transform: Transform) -> Self {
        self.fallback = Some(transform);
        self
    }

    /// Confirm every guess unchanged, like a matcher fed perfect odometry.
    pub fn with_echo(mut self) -> Self {
        self.echo_guess = true;
        self
    }

    pub fn with_thresholds(mut self, translation: f64, rotation: f64) -> Self {
        self.min_translation = translation;
        self.min_rotation = rotation;
        self
    }

    pub fn push_transform(&self, transform: Transform) {
        self.responses.borrow_mut().push_back(transform);
    }
}

impl Sensor for ScriptedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn sensor_pose(&self) -> Transform {
        Transform::identity()
    }

    fn calculate_transform(
        &self,
        _source: &dyn Measurement,
        _target: &dyn Measurement,
        guess: Transform,
        _coarse: bool,
    ) -> Result<TransformWithCovariance, SensorError> {
        if let Some(transform) = self.responses.borrow_mut().pop_front() {
            return Ok(TransformWithCovariance::from_transform(transform));
        }
        if let Some(transform) = self.fallback {
            return Ok(TransformWithCovariance::from_transform(transform));
        }
        if self.echo_guess {
            return Ok(TransformWithCovariance::from_transform(guess));
        }
        Err(SensorError::NoMatch("script exhausted".to_string()))
    }

    fn create_combined_measurement(
        &self,
        _vertices: &[VertexObject],
        _origin: &Transform,
    ) -> Result<MeasurementRef, SensorError> {
        Ok(Arc::new(BasicMeasurement::new(
            "virtual",
            &self.name,
            Utc::now(),
            Transform::identity(),
        )))
    }

    fn min_pose_distance(&self) -> (f64, f64) {
        (self.min_translation, self.min_rotation)
    }
}

/// Odometry source backed by a timestamp table.
pub struct TableOdometry {
    poses: HashMap<Timestamp, Transform>,
}

impl TableOdometry {
    pub fn new() -> Self {
        Self {
            poses: HashMap::new(),
        }
    }

    pub fn insert(&mut self, time: Timestamp, pose: Transform) {
        self.poses.insert(time, pose);
    }
}

impl Odometry for TableOdometry {
    fn odometric_pose(&mut self, time: Timestamp) -> Result<Transform, OdometryError> {
        self.poses
            .get(&time)
            .copied()
            .ok_or(OdometryError::NoData(time))
    }

    fn calculate_covariance(&self, _relative_motion: &Transform) -> Covariance {
        Covariance::identity()
    }
}

#[derive(Default)]
struct SolverState {
    nodes: HashMap<VertexId, Transform>,
    constraints: Vec<(VertexId, VertexId, Transform, Covariance)>,
    fixed: Option<VertexId>,
    corrections: IdPoseVec,
}

/// Translation-only least-squares backend.
///
/// Relaxes vertex translations against the recorded constraints with a
/// Gauss-Newton iteration, holding rotations at their current estimates.
/// Clones share state, so tests can keep a handle to the solver they hand
/// to the mapper.
#[derive(Clone, Default)]
pub struct LeastSquaresSolver {
    state: Arc<Mutex<SolverState>>,
}

impl LeastSquaresSolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Solver for LeastSquaresSolver {
    fn add_node(&mut self, id: VertexId, pose: Transform) -> Result<(), SolverError> {
        let mut state = self.state.lock().unwrap();
        if state.nodes.contains_key(&id) {
            return Err(SolverError::DuplicateVertex(id));
        }
        state.nodes.insert(id, pose);
        Ok(())
    }

    fn add_constraint(
        &mut self,
        source: VertexId,
        target: VertexId,
        transform: Transform,
        covariance: Covariance,
    ) -> Result<(), SolverError> {
        let mut state = self.state.lock().unwrap();
        for id in [source, target] {
            if !state.nodes.contains_key(&id) {
                return Err(SolverError::UnknownVertex(id));
            }
        }
        state.constraints.push((source, target, transform, covariance));
        Ok(())
    }

    fn set_fixed(&mut self, id: VertexId) -> Result<(), SolverError> {
        let mut state = self.state.lock().unwrap();
        if !state.nodes.contains_key(&id) {
            return Err(SolverError::UnknownVertex(id));
        }
        state.fixed = Some(id);
        Ok(())
    }

    fn clear(&mut self) {
        let mut state = self.state.lock().unwrap();
        *state = SolverState::default();
    }

    fn compute(&mut self) -> bool {
        const MAX_ITERATIONS: usize = 10;
        const CONVERGENCE_THRESHOLD: f64 = 1e-9;

        let mut state = self.state.lock().unwrap();
        if state.nodes.is_empty() {
            return true;
        }

        let mut ids: Vec<VertexId> = state.nodes.keys().copied().collect();
        ids.sort_unstable();
        let index: HashMap<VertexId, usize> =
            ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let anchor = state.fixed.or_else(|| ids.first().copied());
        let n = ids.len() * 3;

        for _ in 0..MAX_ITERATIONS {
            let mut h = DMatrix::<f64>::zeros(n, n);
            let mut b = DVector::<f64>::zeros(n);

            for (source, target, transform, covariance) in &state.constraints {
                let i = index[source] * 3;
                let j = index[target] * 3;
                let weight = 1.0 / covariance[(0, 0)].max(1e-9);
                let pose_i = state.nodes[source];
                let pose_j = state.nodes[target];
                let expected = pose_i.rotation() * transform.translation();
                let error = (pose_j.translation() - pose_i.translation()) - expected;

                for r in 0..3 {
                    h[(i + r, i + r)] += weight;
                    h[(j + r, j + r)] += weight;
                    h[(i + r, j + r)] -= weight;
                    h[(j + r, i + r)] -= weight;
                    b[i + r] -= weight * error[r];
                    b[j + r] += weight * error[r];
                }
            }

            for d in 0..n {
                h[(d, d)] += 1e-6;
            }
            // Pin the anchor (gauge freedom)
            if let Some(a) = anchor {
                let k = index[&a] * 3;
                for r in 0..3 {
                    h[(k + r, k + r)] += 1e9;
                }
            }

            let Some(dx) = h.lu().solve(&(-&b)) else {
                return false;
            };

            for (row, id) in ids.iter().enumerate() {
                let pose = state.nodes[id];
                let translation = pose.translation()
                    + Vector3::new(dx[row * 3], dx[row * 3 + 1], dx[row * 3 + 2]);
                state.nodes.insert(
                    *id,
                    Transform::from_parts(Translation3::from(translation), pose.rotation()),
                );
            }

            if dx.norm() < CONVERGENCE_THRESHOLD {
                break;
            }
        }

        state.corrections = ids.iter().map(|&id| (id, state.nodes[&id])).collect();
        true
    }

    fn corrections(&self) -> IdPoseVec {
        self.state.lock().unwrap().corrections.clone()
    }
}
