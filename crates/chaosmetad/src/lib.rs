//! The chaosmetad agent: experiment persistence and the runner that takes
//! one fault through inject and recover.

pub mod runner;
pub mod store;

pub use runner::{Config, InjectRequest, Runner};
pub use store::{Experiment, Filter, Store};
