pub mod cache;
pub mod orchestrator;
pub mod retry;
pub mod transitions;
pub mod wrap;
