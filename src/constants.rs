//! # Constants and type definitions for millealign
//!
//! This module centralizes the **label layout**, the **default file names** used
//! to talk to the Millepede solver, and the **common type aliases** shared by every
//! other module.
//!
//! ## Label layout
//!
//! ```text
//! time-independent : unique_id * 10^7 + element * 100 + param        (< 10^9)
//! time-dependent   : 10^9 + index * 1000 + slice                     (<= i32::MAX)
//! ```
//!
//! `index` is the dense registration index of the base label inside the
//! [`TimeTable`](crate::timeline::TimeTable). Label `0` is never produced.

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Millepede global parameter label (positive 32-bit integer)
pub type Label = i32;
/// Identifier of a payload kind (one per detector component)
pub type UniqueId = u32;
/// Identifier of one calibrated element inside a payload (sensor, layer, module…)
pub type ElementId = u32;
/// Identifier of one scalar parameter of an element
pub type ParamId = u32;
/// Key of a constraint in the constraint map
pub type ConstraintLabel = u64;

// -------------------------------------------------------------------------------------------------
// Label layout
// -------------------------------------------------------------------------------------------------

/// Largest accepted payload unique id
pub const MAX_UNIQUE_ID: UniqueId = 99;
/// Largest accepted element id
pub const MAX_ELEMENT_ID: ElementId = 99_999;
/// Largest accepted parameter id
pub const MAX_PARAM_ID: ParamId = 99;

/// Weight of the element id in a time-independent label
pub const ELEMENT_OFFSET: i32 = 100;
/// Weight of the unique id in a time-independent label
pub const UNIQUE_ID_OFFSET: i32 = 10_000_000;

/// First label of the time-dependent label range
pub const TIMEDEP_OFFSET: i32 = 1_000_000_000;
/// Number of slices reserved for every time-dependent parameter
pub const MAX_SLICES: u32 = 1_000;
/// Number of time-dependent parameters that fit in the label range
pub const MAX_TIMEDEP_PARAMS: usize = ((i32::MAX - TIMEDEP_OFFSET) / MAX_SLICES as i32) as usize;

// -------------------------------------------------------------------------------------------------
// Solver file names
// -------------------------------------------------------------------------------------------------

/// Default steering file written for the solver
pub const PEDE_STEERING_FILE: &str = "PedeSteering.txt";
/// Result table written by the solver
pub const PEDE_RESULT_FILE: &str = "millepede.res";
/// Exit summary written by the solver
pub const PEDE_END_FILE: &str = "millepede.end";
/// Covariance dump written by the solver
pub const PEDE_COVARIANCE_FILE: &str = "millepede.cov";
/// Default name of the constraint file handed to the solver
pub const CONSTRAINTS_FILE: &str = "constraints.txt";
/// Default solver executable
pub const PEDE_EXECUTABLE: &str = "pede";

/// Coefficients below this magnitude are not written into hierarchy constraints
pub const CONSTRAINT_COEFF_EPS: f64 = 1.0e-5;
