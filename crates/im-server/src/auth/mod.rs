//! Connection admission: bearer token + device binding checks.

pub mod admission;

pub use admission::{apply_query_fallback, bearer_token, Admission};
