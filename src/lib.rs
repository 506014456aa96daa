//! Buffered current acquisition with a Keithley 6485 picoammeter over RS-232.

pub mod config;
pub mod devices;
pub mod experiment;
