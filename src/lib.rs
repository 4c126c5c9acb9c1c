pub mod config;
pub mod errors;
pub mod flow;
pub mod orchestrator;
pub mod prompt;
pub mod retry;
pub mod review;
pub mod scratch;
pub mod tasks;
