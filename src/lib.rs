pub mod arbiter;
pub mod config;
pub mod database;
pub mod error;
pub mod history;
pub mod job_source;
pub mod models;
pub mod process;
pub mod routes;
pub mod runtime;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod worker_processing;
