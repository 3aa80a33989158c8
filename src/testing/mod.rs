//! Test doubles for the broker client contract

pub mod mocks;

pub use mocks::{MockBroker, MockBus};
