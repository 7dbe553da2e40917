//! Wallet module for UTXO tracking and spend planning

pub mod planner;

pub use planner::{
    PlannedInput, Receiver, SelectionOrder, SpendPlan, SpendPlanner, SpendRequest, Utxo,
    DUST_THRESHOLD,
};
