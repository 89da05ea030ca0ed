pub mod local;
pub mod splice;

pub use local::LocalForward;
pub use splice::{splice, Cause, Op, ProxyOutcome, Side, Termination};
