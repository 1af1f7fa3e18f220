//! Crate-level error type.
//!
//! Handler failures never surface here — per the engine's failure model
//! they are captured as node outcomes (see [`crate::recipe::DoneResult`])
//! and flow through the workflow-policy propagator instead. This type
//! covers the handful of programmer-misuse conditions that are detectable
//! outside of scheduling.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskTreeError {
    #[error("controller was already started")]
    AlreadyStarted,

    #[error("progress was queried before the controller was started")]
    NotStarted,

    #[error("storage key is not declared on the recipe's root group")]
    UnknownStorageKey,
}
