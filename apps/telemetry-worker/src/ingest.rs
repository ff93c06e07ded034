mod processor;
mod resolver;


pub use processor::{BatchOutcome, TelemetryProcessor};
