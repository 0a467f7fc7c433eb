//! Shared data model for campaign execution.
//!
//! A campaign describes a change to roll out across many repositories. This
//! crate holds the resolved model the execution engine consumes (repositories,
//! steps, changeset templates), the changeset specs it produces, the campaign
//! document format, and the content fingerprint used to cache executions.

pub mod campaign;
pub mod fingerprint;
pub mod model;

pub use campaign::*;
pub use fingerprint::*;
pub use model::*;
