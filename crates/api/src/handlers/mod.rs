//! Route handlers, grouped by the collaborator that calls them.

pub mod dataclips;
pub mod runs;
pub mod webhooks;
pub mod work_orders;
pub mod worker;
pub mod workflows;
