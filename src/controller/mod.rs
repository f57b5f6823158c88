//! Controllers owned by this provider
//!
//! Only the NodeClass status reconciler lives in-process; everything else
//! (NodeClaim lifecycle, disruption, GC) belongs to the host runtime.

pub mod nodeclass_status;

pub use nodeclass_status::{error_policy, reconcile, Context};
