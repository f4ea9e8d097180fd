pub mod error;
pub mod feedback;
pub mod flags;
pub mod progress;
