use std::time::Duration;

use thiserror::Error;

use crate::constants::{ElementId, Label, ParamId, UniqueId};

#[derive(Error, Debug)]
pub enum AlignError {
    #[error("Unknown parameter: unique id {unique_id}, element {element}, param {param}")]
    UnknownParameter {
        unique_id: UniqueId,
        element: ElementId,
        param: ParamId,
    },

    #[error("Unknown label: {0}")]
    UnknownLabel(Label),

    #[error("Invalid global label: {0}")]
    InvalidLabel(String),

    #[error("Unknown calibration component: {0}")]
    UnknownComponent(String),

    #[error("Invalid time slices: {0}")]
    InvalidTimeSlices(String),

    #[error("Invalid algorithm parameter: {0}")]
    InvalidAlgorithmParameter(String),

    #[error("Invalid hierarchy: {0}")]
    InvalidHierarchy(String),

    #[error("Calibration manager used before initialize()")]
    NotInitialized,

    #[error("Millepede solver failed: {0}")]
    SolverFailure(String),

    #[error("Millepede solver did not finish within {0:?}")]
    SolverTimeout(Duration),

    #[error("Pede result accessed before a successful read")]
    InvalidResultAccess,

    #[error("Error while parsing the pede result: {0}")]
    ResultParsing(String),

    #[error("Error while parsing constraints: {0}")]
    ConstraintParsing(String),

    #[error("Malformed Millepede binary data: {0}")]
    MilleFormat(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<csv::Error> for AlignError {
    fn from(err: csv::Error) -> Self {
        AlignError::Csv(err.to_string())
    }
}

impl PartialEq for AlignError {
    fn eq(&self, other: &Self) -> bool {
        use AlignError::*;
        match (self, other) {
            (
                UnknownParameter {
                    unique_id: u1,
                    element: e1,
                    param: p1,
                },
                UnknownParameter {
                    unique_id: u2,
                    element: e2,
                    param: p2,
                },
            ) => u1 == u2 && e1 == e2 && p1 == p2,
            (UnknownLabel(a), UnknownLabel(b)) => a == b,
            (InvalidLabel(a), InvalidLabel(b)) => a == b,
            (UnknownComponent(a), UnknownComponent(b)) => a == b,
            (InvalidTimeSlices(a), InvalidTimeSlices(b)) => a == b,
            (InvalidAlgorithmParameter(a), InvalidAlgorithmParameter(b)) => a == b,
            (InvalidHierarchy(a), InvalidHierarchy(b)) => a == b,
            (SolverFailure(a), SolverFailure(b)) => a == b,
            (SolverTimeout(a), SolverTimeout(b)) => a == b,
            (ResultParsing(a), ResultParsing(b)) => a == b,
            (ConstraintParsing(a), ConstraintParsing(b)) => a == b,
            (MilleFormat(a), MilleFormat(b)) => a == b,
            (Csv(a), Csv(b)) => a == b,

            // io errors are not comparable: same variant is enough
            (IoError(_), IoError(_)) => true,

            (NotInitialized, NotInitialized) => true,
            (InvalidResultAccess, InvalidResultAccess) => true,

            _ => false,
        }
    }
}
