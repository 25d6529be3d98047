#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::unnecessary_literal_bound,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod circuit;
pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod failsafe;
pub mod kernel;
pub mod recovery;
pub mod runtime;
pub mod snapshot;
pub mod state;
pub mod thresholds;
pub mod utils;

pub use config::Config;
pub use error::KernelError;
pub use kernel::Kernel;
