pub mod config;
pub mod conversation;
pub mod database;
pub mod email;
pub mod evaluate;
pub mod llm;
pub mod pairing;
pub mod ratelimit;
pub mod report;
pub mod scheduler;
pub mod scoring;
pub mod service;

pub use config::PipelineConfig;
pub use scheduler::{BatchOptions, BatchSummary};
pub use service::MatchmakerService;
