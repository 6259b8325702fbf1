//! # Global parameter labels
//!
//! A [`GlobalLabel`] is the identity of one scalar calibration parameter inside the
//! global fit. It is composed of the payload unique id, the element id and the
//! parameter id, and encodes them into the single positive integer that Millepede
//! uses to address the parameter.
//!
//! ## Encoding
//! -----------------
//! Time-independent labels are a pure function of the triple
//! (see [`crate::constants`] for the digit layout). Time-dependent labels are not
//! produced here: the [`TimeTable`](crate::timeline::TimeTable) owns the registry of
//! time-dependent parameters and maps `(base label, slice)` to a label in the
//! reserved upper range.
//!
//! ## Errors
//! -----------------
//! * Out-of-range ids, and the all-zero triple (which would encode label `0`), are
//!   rejected with [`AlignError::InvalidLabel`].
//! * Decoding a label from the time-dependent range with [`GlobalLabel::from_label`]
//!   fails as well; use [`TimeTable::decode`](crate::timeline::TimeTable::decode) first.
use std::fmt;

use crate::{
    align_errors::AlignError,
    constants::{
        ElementId, Label, ParamId, UniqueId, ELEMENT_OFFSET, MAX_ELEMENT_ID, MAX_PARAM_ID,
        MAX_UNIQUE_ID, TIMEDEP_OFFSET, UNIQUE_ID_OFFSET,
    },
};

/// Identity of one calibration parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalLabel {
    unique_id: UniqueId,
    element: ElementId,
    param: ParamId,
}

impl GlobalLabel {
    /// Build the label of a time-independent parameter.
    ///
    /// Arguments
    /// -----------------
    /// * `unique_id`: payload unique id (`0..=99`).
    /// * `element`: element id inside the payload (`0..=99 999`).
    /// * `param`: parameter id of the element (`0..=99`).
    ///
    /// Return
    /// ----------
    /// * The [`GlobalLabel`] or [`AlignError::InvalidLabel`] if one id is out of range
    ///   or the triple would encode the reserved label `0`.
    pub fn construct(
        unique_id: UniqueId,
        element: ElementId,
        param: ParamId,
    ) -> Result<Self, AlignError> {
        if unique_id > MAX_UNIQUE_ID {
            return Err(AlignError::InvalidLabel(format!(
                "unique id {unique_id} exceeds {MAX_UNIQUE_ID}"
            )));
        }
        if element > MAX_ELEMENT_ID {
            return Err(AlignError::InvalidLabel(format!(
                "element id {element} exceeds {MAX_ELEMENT_ID}"
            )));
        }
        if param > MAX_PARAM_ID {
            return Err(AlignError::InvalidLabel(format!(
                "param id {param} exceeds {MAX_PARAM_ID}"
            )));
        }
        if unique_id == 0 && element == 0 && param == 0 {
            return Err(AlignError::InvalidLabel(
                "(0, 0, 0) encodes the reserved label 0".into(),
            ));
        }
        Ok(GlobalLabel {
            unique_id,
            element,
            param,
        })
    }

    /// Decode a time-independent label back into its triple.
    pub fn from_label(label: Label) -> Result<Self, AlignError> {
        if label <= 0 {
            return Err(AlignError::InvalidLabel(format!(
                "label {label} is not positive"
            )));
        }
        if label >= TIMEDEP_OFFSET {
            return Err(AlignError::InvalidLabel(format!(
                "label {label} belongs to the time-dependent range"
            )));
        }
        let unique_id = (label / UNIQUE_ID_OFFSET) as UniqueId;
        let element = ((label % UNIQUE_ID_OFFSET) / ELEMENT_OFFSET) as ElementId;
        let param = (label % ELEMENT_OFFSET) as ParamId;
        Ok(GlobalLabel {
            unique_id,
            element,
            param,
        })
    }

    /// Encoded integer label.
    pub fn label(&self) -> Label {
        self.unique_id as i32 * UNIQUE_ID_OFFSET + self.element as i32 * ELEMENT_OFFSET
            + self.param as i32
    }

    pub fn unique_id(&self) -> UniqueId {
        self.unique_id
    }

    pub fn element_id(&self) -> ElementId {
        self.element
    }

    pub fn param_id(&self) -> ParamId {
        self.param
    }
}

impl fmt::Display for GlobalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (uid {}, element {}, param {})",
            self.label(),
            self.unique_id,
            self.element,
            self.param
        )
    }
}
