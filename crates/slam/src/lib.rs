//! Incremental pose-graph SLAM frontend.
//!
//! Provides:
//! - A pose graph of measurement vertices linked by rigid-body constraints
//! - An admission policy deciding which readings become vertices
//! - Loop-closure discovery over a nearest-pose spatial index
//! - Patch building: condensing local history into virtual reference
//!   measurements
//! - Ports for scan-matching sensors, odometry sources and nonlinear solvers
//!
//! The mapper is single-threaded and caller-serialized; long-running sensor
//! and solver calls block synchronously. Callers that need responsiveness
//! run the mapper on a dedicated thread and snapshot reads themselves.

pub mod graph;
pub mod mapper;
pub mod odometry;
mod queries;
pub mod sensor;
pub mod solver;
pub mod spatial_index;

pub use graph::{EdgeObject, GraphError, PoseGraph, VertexId, VertexObject};
pub use mapper::{Mapper, MapperConfig, MapperError, ROOT_ID};
pub use odometry::{Odometry, OdometryError};
pub use sensor::{Sensor, SensorError, SensorRef};
pub use solver::{IdPoseVec, Solver, SolverError};
pub use spatial_index::SpatialIndex;
