use thiserror::Error;

/// Errors that escape the acceleration core.
///
/// Everything recoverable (a full cache, a rejected ellipsoid growth, a badly
/// conditioned interaction coefficient) is handled internally; only the three
/// variants below ever reach the caller.
#[derive(Debug, Error)]
pub enum ChemError {
    /// Invalid configuration, detected at construction time.
    #[error("configuration error: {0}")]
    Config(String),

    /// The kinetics evaluation produced a non-finite quantity, or the query
    /// state itself is non-finite. The current cell is aborted; the upstream
    /// solver decides whether to retry with a smaller time step.
    #[error("kinetics error: {0}")]
    Kinetics(String),

    /// The external stiff integrator failed; propagated unchanged.
    #[error("chemistry integration failed: {0}")]
    Integration(anyhow::Error),
}
