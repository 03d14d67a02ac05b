pub mod agent;
pub mod config;
pub mod event;
pub mod export;
pub mod output;
pub mod pipeline;
pub mod transport;
