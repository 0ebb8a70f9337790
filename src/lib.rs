pub mod cli;
pub mod clock;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod feeder;
pub mod logging;
pub mod pacer;
pub mod queue;
pub mod shutdown;
pub mod state_machine;
pub mod status;
pub mod ui;

pub use error::QueueError;
