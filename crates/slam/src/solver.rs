//! Solver port: contract to an external nonlinear pose-graph optimizer.

use thiserror::Error;
use transforms::{Covariance, Transform};

use crate::graph::VertexId;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("solver does not know vertex {0}")]
    UnknownVertex(VertexId),
    #[error("vertex {0} was already added to the solver")]
    DuplicateVertex(VertexId),
}

/// Corrections returned by an optimization run.
pub type IdPoseVec = Vec<(VertexId, Transform)>;

/// An external nonlinear least-squares backend.
///
/// The mapper drives the solver incrementally: one `add_node` per vertex
/// creation and one `add_constraint` per logical edge, always in the forward
/// direction, so `compute` is cheap relative to a batch re-solve. Correction
/// application is idempotent; replaying [`Solver::corrections`] yields the
/// same poses.
pub trait Solver {
    /// Register a vertex with its initial pose estimate.
    fn add_node(&mut self, id: VertexId, pose: Transform) -> Result<(), SolverError>;

    /// Register a relative-pose constraint between two known vertices.
    fn add_constraint(
        &mut self,
        source: VertexId,
        target: VertexId,
        transform: Transform,
        covariance: Covariance,
    ) -> Result<(), SolverError>;

    /// Anchor a vertex; its pose is held constant during optimization.
    fn set_fixed(&mut self, id: VertexId) -> Result<(), SolverError>;

    /// Drop all nodes and constraints.
    fn clear(&mut self);

    /// Run the optimization. Returns false when no solution was found.
    fn compute(&mut self) -> bool;

    /// Corrected poses from the last successful `compute`.
    fn corrections(&self) -> IdPoseVec;
}
