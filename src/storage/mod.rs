pub mod output;
pub mod state;

// Re-export common types
pub use output::{JsonlOutputWriter, OutputWriter};
pub use state::QueueSnapshot;
