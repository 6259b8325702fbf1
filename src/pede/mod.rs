//! # Millepede solver interface
//!
//! The global fit itself is done by the external `pede` executable. This module
//! covers the three steps around it:
//!
//! * [`PedeSteering`] – writes the steering file listing the binary inputs,
//!   constraint files and solver directives.
//! * [`PedeApplication`] – runs the solver as a child process with an optional
//!   timeout and checks its exit status.
//! * [`PedeResult`] – parses `millepede.res` (and an optional covariance dump)
//!   into per-label values, errors and determination status.
//!
//! The files are exchanged through the directory holding the steering file, which
//! is also the solver's working directory.
pub mod application;
pub mod result;
pub mod steering;

pub use application::PedeApplication;
pub use result::{ParamResult, ParamStatus, PedeResult};
pub use steering::PedeSteering;
