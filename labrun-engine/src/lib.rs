//! Orchestration engine for containerized lab test runs.
//!
//! A run is a sequence of [`commands`] driven one step at a time by
//! [`pipeline::run_step`] against a shared [`state::StateKeeper`]. Side
//! effects (containers, service RPCs, tunnels, cloud images) belong to the
//! [`executors`].

pub mod clients;
pub mod command;
pub mod commands;
pub mod config;
pub mod container;
pub mod error;
pub mod executors;
pub mod log_relay;
pub mod lro;
pub mod pipeline;
pub mod state;
pub mod topology;
pub mod tunnel;
pub mod ui;
pub mod util;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
