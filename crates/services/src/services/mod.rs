pub mod config;
pub mod credentials;
pub mod engine;
pub mod progress;
pub mod remote_operation;
pub mod staging;
pub mod status;
pub mod working_copy;
