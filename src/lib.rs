pub mod camera;
pub mod config;
pub mod decision;
pub mod error;
pub mod frame;
pub mod labels;
pub mod mock;
pub mod models;
pub mod pipeline;
pub mod presentation;

pub use decision::{ClassPrediction, DecisionPolicy, DisplayDecision, PredictionBatch, Warning};
pub use error::{DetectorError, DetectorResult};
pub use labels::{LabelEntry, LabelRegistry};
pub use pipeline::{ClassificationLoop, LoopSettings, LoopState, LoopStats};
