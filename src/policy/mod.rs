//! Policy Gate — pre-send and post-generation compliance checks.

pub mod gate;

pub use gate::{GateDecision, PolicyGate, TurnSnapshot};
