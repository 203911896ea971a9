//! Stateright model checks
//!
//! Exhaustive state-space exploration of the two state machines whose
//! correctness is easiest to get subtly wrong:
//!
//! - `window_lifecycle`: open → closed → emitted, late updates, flush
//! - `membership`: discovery, handshake rounds and the fallback rules
//!
//! The deterministic simulation in `aggregation::dst` covers the same ground
//! with randomized inputs at realistic sizes; these models cover every
//! interleaving at toy sizes.
//!
//! ```bash
//! # Exhaustive runs are #[ignore]d for CI speed
//! cargo test stateright -- --ignored --nocapture
//! ```

pub mod membership;
pub mod window_lifecycle;

pub use membership::{MembershipAction, MembershipModel, MembershipModelState};
pub use window_lifecycle::{
    WindowLifecycleAction, WindowLifecycleConfig, WindowLifecycleModel, WindowLifecycleState,
};
