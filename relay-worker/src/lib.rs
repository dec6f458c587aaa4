pub mod config;
pub mod consumer;
pub mod cursor;
pub mod error;
pub mod source;
pub mod supervisor;
