pub mod builder;
pub mod client;
pub mod config;
pub mod emsort;
pub mod encoding;
pub mod error;
pub mod fastmap;
pub mod http;
pub mod merkle;
pub mod server;
pub mod types;

#[cfg(test)]
mod testutil;

pub use builder::Builder;
pub use config::BuildConfig;
pub use error::{Error, Result};
pub use server::{Item, Server};
