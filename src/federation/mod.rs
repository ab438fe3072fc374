//! Federated execution across registered cores.

pub mod engine;
pub mod response;

pub use engine::{CoreStats, FederationEngine};
pub use response::{FederatedResponse, Hit, PhaseTiming};
