//! Pipeline services.
//!
//! Source acquisition, transformation, and the coordinator that ties them
//! to the content store.

pub mod coordinator;
pub mod source;
pub mod transform;
