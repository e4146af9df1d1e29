pub mod api;
pub mod bus;
pub mod config;
pub mod device;
pub mod frame;
pub mod scheduler;
pub mod settings;
pub mod wifi;

#[cfg(test)]
mod testing;
