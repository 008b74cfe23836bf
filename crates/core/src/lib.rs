pub mod inference;
pub mod pipeline;
pub mod runner;
pub mod shared;
