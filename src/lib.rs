// src/lib.rs
pub mod artifact;
pub mod calibration;
pub mod dataset;
pub mod engine;
pub mod ensemble;
pub mod errors;
pub mod explain;
pub mod features;
pub mod feedback;
pub mod models;
pub mod registry;
pub mod retrain;
pub mod store;
pub mod utils;

pub use engine::{ExplainedPrediction, Prediction, ScoringEngine};
pub use errors::{EngineError, EngineResult};
