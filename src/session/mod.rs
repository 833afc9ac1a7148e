//! Adapter session state machine.
//!
//! This module contains the platform-independent part of the service: the
//! adapter state model, permission handling, the radio contract and the
//! session controller that ties them together.

pub mod controller;
pub mod device;
pub mod permission;
pub mod pulse;
pub mod radio;
pub mod state;
