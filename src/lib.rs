pub mod agent_loop;
pub mod approvals;
pub mod board;
pub mod bots;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod events;
pub mod git;
pub mod models;
pub mod orchestrator;
pub mod processor;
pub mod queue;
pub mod router;
pub mod sandbox;
pub mod server;
pub mod util;
