//! vmctl controller
//!
//! Keeps virtual machine instances converged with their RunPolicy, tracks
//! each instance through its lifecycle phases and coordinates live
//! migrations between hosts. Exposes the machine actions over a REST API.

pub mod actions;
pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod handler;
pub mod migration;
pub mod reconciler;
pub mod runtime;
pub mod state;
pub mod store;
pub mod tracker;
pub mod worker;
