//! Agent task runner and sandbox lifecycle core.

pub mod classifier;
pub mod cli;
pub mod config;
pub mod context_window;
pub mod conversation;
pub mod events;
pub mod model;
pub mod router;
pub mod runner;
pub mod stream;
pub mod supervisor;
pub mod tasks;
pub mod tools;
