//! Return modeling and Monte Carlo simulation.

mod mixture;
mod simulator;

pub use mixture::GaussianMixture;
pub use simulator::{MonteCarloSimulator, SimulatedPaths};
