//! Data models for the job orchestration pipeline
//!
//! - Job rows and the job state machine
//! - Call (artifact) rollup rows
//! - Stage parameter envelope

pub mod call;
pub mod job;
pub mod params;

pub use call::{ArtifactState, Call, CallUpdate};
pub use job::{Job, JobStatus, NewJob, Stage};
pub use params::{StageParams, PARAMS_SCHEMA_VERSION};
