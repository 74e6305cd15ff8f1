pub mod engine;
pub mod evaluation;
pub mod metrics;
pub mod normalizer;
pub mod window;

pub use engine::*;
pub use evaluation::*;
pub use metrics::*;
pub use normalizer::*;
pub use window::*;
