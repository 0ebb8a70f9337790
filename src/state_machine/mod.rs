mod job;
mod state;

pub use job::{Job, JobId, NewJob};
pub use state::{Event, JobState, StateMachine};
