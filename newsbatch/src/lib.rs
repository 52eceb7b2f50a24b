// Library interface for newsbatch modules
// This allows tests and the binary to import modules

pub mod analysis;
pub mod ingestion;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod traffic;
