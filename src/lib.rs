pub mod commands;
pub mod connection;
pub mod device;
pub mod output;
pub mod parameters;
pub mod protocol;
