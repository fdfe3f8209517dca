//! The asynchronous synthesis pipeline and its scheduler.

pub mod pipeline;
pub mod scheduler;
mod utterance;

pub use pipeline::SynthesisPipeline;
pub use scheduler::{SchedulerOptions, UtteranceScheduler};
pub use utterance::{Bookmark, DriverEvent, Outcome, PipelineState, Prosody, SpeakRequest, Utterance, UtteranceId};
