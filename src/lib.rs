pub mod background;
pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod keyring;
pub mod messages;
pub mod password_cache;
pub mod ports;
pub mod signing;
pub mod state;
pub mod storage;
pub mod util;
