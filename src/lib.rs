pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod hamming;
pub mod http;
pub mod imhash;
mod metrics;
pub mod neardup;
pub mod queue;
pub mod scraper;
pub mod snowflake;
pub mod worker;

pub use config::Opts;
pub use error::{Error, Result};
