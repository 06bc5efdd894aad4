// Observability: metric catalogue and recording functions

pub mod metrics;

pub use metrics::init;
