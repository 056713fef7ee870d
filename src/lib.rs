pub mod cadence;
pub mod config;
pub mod delivery;
pub mod error;
pub mod fetch;
pub mod render;
pub mod stats;
pub mod worker;

pub use config::{Config, Settings};
pub use error::Error;
pub use worker::{Scheduler, refresh_stats};
