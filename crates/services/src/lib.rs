#![forbid(unsafe_code)]

pub mod app_services;
pub mod error;
pub mod runs;

pub use runs_core::Clock;

pub use app_services::AppServices;
pub use error::{AppServicesError, RunServiceError};

pub use runs::{
    ProgressUpdate, RunLifecycleService, RunProgress, SessionDirectory, StartOutcome,
    StaticSessionDirectory,
};
