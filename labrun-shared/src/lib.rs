pub mod any;
pub mod dut;
pub mod operation;
pub mod request;
pub mod services;
