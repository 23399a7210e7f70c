pub mod botconfig;
pub mod bridge;
pub mod config;
pub mod download;
pub mod process_monitor;
pub mod resource;
pub mod supervisor;
pub mod update;
pub mod utils;
