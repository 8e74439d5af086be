//! Core module - collection scheduler, client registry and shared data

pub mod app;
pub mod clients;
pub mod clock;
pub mod collector;
pub mod events;
pub mod history;
pub mod point;
pub mod snapshot;
mod worker;
