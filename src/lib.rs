pub mod admin;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod hostrpc;
pub mod installer;
pub mod logging;
pub mod message;
pub mod port;
pub mod registry;
pub mod supervisor;

pub mod proto {
    tonic::include_proto!("botplane.v1");
}

pub use error::{BotError, Result};
