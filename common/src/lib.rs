// Common library for step execution shared by the worker and the exe proxy

pub mod cancellation;
pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod models;
pub mod output;
pub mod parameters;
pub mod retry;
pub mod storage;
pub mod telemetry;
