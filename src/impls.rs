//! Ready-made producers, consumers, and processors.

pub mod consumers;
pub mod processors;
pub mod producers;

// Re-export commonly used implementations
pub use consumers::*;
pub use processors::*;
pub use producers::*;
