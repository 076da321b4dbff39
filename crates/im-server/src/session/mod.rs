//! Live client sessions: the registry and per-connection handles.

pub mod registry;

pub use registry::{ClientHandle, Outbound, SessionRegistry};
