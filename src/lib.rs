pub mod configuration;
pub mod connectivity;
pub mod controller;
pub mod dht22;
pub mod errors;
pub mod global_settings;
pub mod power;
pub mod provisioning;
pub mod reading;
pub mod telemetry;

#[cfg(target_os = "espidf")]
pub mod peripherals;
#[cfg(target_os = "espidf")]
pub mod services;

#[cfg(not(target_os = "espidf"))]
pub mod simulator;

#[cfg(test)]
mod test_support;
