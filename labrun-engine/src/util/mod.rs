pub mod command;
pub mod format;
pub mod logging;
pub mod network;
