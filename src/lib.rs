/// Film Scanner Library
/// 
/// Transport link, capture link, scanner state and the web controller

pub mod config_loader;
pub mod arduino_connection;
pub mod camera;
pub mod simulated;
pub mod scanner_state;
pub mod scan_journal;
pub mod status;
pub mod workflow;
pub mod web;
