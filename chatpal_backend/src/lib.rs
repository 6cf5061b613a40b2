pub mod agent;
pub mod config;
pub mod conversation;
pub mod group_monitor;
pub mod http_client;
pub mod llm_client;
pub mod memory;
pub mod persona;
pub mod runtime;
pub mod stats;
pub mod store;
pub mod summarizer;
