//! Autoscaling decisions
//!
//! - [`autoscaler`]: one full iteration and the periodic loop
//! - [`scale_up`] / [`expander`]: growing node groups for pending pods
//! - [`scale_down`] / [`limits`]: removing unneeded nodes within resource minimums
//! - [`utils`]: templates and reconciliation fixes shared by both directions

pub mod autoscaler;
pub mod context;
pub mod expander;
pub mod limits;
pub mod scale_down;
pub mod scale_up;
pub mod utils;

pub use autoscaler::{spawn_autoscaler, StaticAutoscaler};
pub use context::AutoscalingContext;
pub use expander::{new_expander, Expander, ExpansionOption};
pub use limits::{ScaleDownResourcesDelta, ScaleDownResourcesLimits, SCALE_DOWN_LIMIT_UNKNOWN};
pub use scale_down::{NodeDeleteStatus, ScaleDown, ScaleDownResult};
pub use scale_up::{scale_up, ScaleUpResult};
