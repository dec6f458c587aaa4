pub mod dedup;
pub mod event;
pub mod health;
pub mod intake;
pub mod metrics;
pub mod queue;
