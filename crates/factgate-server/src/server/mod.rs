pub mod config;
pub mod service;
pub mod streaming;
pub mod telemetry;

#[cfg(test)]
pub mod testing;
