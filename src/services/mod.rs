pub mod control;
pub mod gemini;
pub mod generator;
pub mod naming;
pub mod processor;
pub mod queue;
pub mod rate_governor;
pub mod scheduler;
pub mod store;
pub mod validation;
