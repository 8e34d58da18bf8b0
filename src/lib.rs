pub mod app;
pub mod client;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod fs_util;
pub mod identity;
pub mod output;
pub mod poller;
pub mod store;
pub mod submit;
