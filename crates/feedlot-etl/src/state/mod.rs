//! File lifecycle: the state machine, retry policy and the controller that
//! applies transitions to the store.

pub mod controller;
pub mod error;
pub mod machine;
pub mod retry;

pub use controller::{
    FailureOutcome, LifecycleConfig, NewUpload, Resolution, StateController, Transition,
};
pub use error::TransitionError;
pub use machine::{FileState, StateChange};
pub use retry::{FailureKind, RetryAttempt, RetryConfig, RetryDecision};
