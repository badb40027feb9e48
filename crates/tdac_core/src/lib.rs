//! Acceleration core for per-cell chemical source terms in reactive-flow
//! solvers, combining on-the-fly mechanism reduction with in-situ adaptive
//! tabulation.
//!
//! Key components:
//! - **Traits**: `Kinetics` (thermo/kinetics adapter), `Integrator` (the
//!   external stiff ODE solver), `Observer` (diagnostics hook).
//! - **Reduction**: the DAC reducer selecting a per-cell active species set
//!   from the direct interaction graph.
//! - **Tabulation**: a binary-tree cache of integrated results, each valid
//!   inside a growing ellipsoid of accuracy.
//! - **Solver**: the `ChemistrySolver` facade orchestrating
//!   retrieve -> reduce -> integrate -> tabulate for every cell and step.

pub mod config;
pub mod error;
pub mod linalg;
pub mod mechanism;
pub mod reduction;
pub mod solver;
pub mod solvers;
pub mod tabulation;
pub mod traits;

pub use config::{IsatSettings, TdacConfig};
pub use error::ChemError;
pub use solver::ChemistrySolver;
pub use traits::{Integrator, Kinetics, Observer, SpecieThermo};
