//! Execution frame governance.
//!
//! Every state change is proposed as a frame. Frames are matched against the
//! approval gates, checked by the constraint checker, and either approved on
//! the spot, rejected, or left pending for a human.

pub mod gates;
pub mod governor;

pub use gates::{GateDecision, GateRegistry};
pub use governor::{FrameGovernor, FrameOutcome, FrameRequest};
