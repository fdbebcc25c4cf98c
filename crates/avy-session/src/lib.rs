//! Session Isolation Manager: one live session per identity, grouped
//! into isolation groups, with contamination detection and enforced
//! termination.

pub mod manager;
pub mod state;

pub use manager::SessionManager;
pub use state::{
    Activity, HistoryRecord, IsolationGroup, IsolationLevel, SessionState, TerminationReason,
};
