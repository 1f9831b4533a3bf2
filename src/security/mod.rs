pub mod policy;

pub use policy::{ActionPolicy, ActionTracker};
