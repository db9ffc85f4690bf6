pub mod budget;
pub mod clock;
pub mod config;
pub mod gateway;
pub mod pricing;
pub mod upstream;
pub mod usage;
