//! Integration scenarios.

pub mod fixtures;

mod delivery;
mod lifecycle;
mod reconnect;
mod serving;
