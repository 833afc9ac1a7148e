//! BlueZ host for the session controller.
//!
//! This module provides the `bluer`-backed radio, the adapter event monitor
//! and the actor that drives the controller.

pub mod adapter;
pub mod manager;
pub mod monitor;
