//! A declarative hierarchical task orchestration engine.
//!
//! Given a [`recipe`] — a tree whose leaves are asynchronous tasks and
//! whose internal nodes are groups with configurable execution and
//! completion policies — this crate schedules every node, propagates
//! success/error/cancel outcomes according to each group's [workflow
//! policy](recipe::WorkflowPolicy), maintains [`progress`] counts, and
//! carries typed [`storage`](recipe::StorageDecl) objects alongside the
//! running subtree for shared data between handlers.
//!
//! The engine is deliberately narrow: it does not define its own I/O, does
//! not provide a thread pool, does not discover tasks at runtime, and does
//! not serialize recipes. Concrete task adapters (network requests,
//! subprocess launches, async function calls, ...) are external
//! collaborators the engine only sees through the [`capability::TaskAdapter`]
//! trait.
//!
//! Entry point: build a [`recipe::RecipeNode`] with [`recipe::builder`],
//! hand it to [`Controller::new`], then either [`Controller::start`]
//! (non-blocking) or [`Controller::run_blocking`] (awaits completion).

mod compile;
mod runtime;
mod scheduler;
mod storage;

pub mod capability;
pub mod config;
mod controller;
pub mod ctx;
pub mod error;
pub mod log;
pub mod progress;
pub mod recipe;

pub use config::EngineConfig;
pub use controller::Controller;
pub use error::TaskTreeError;
pub use runtime::NodeId;
