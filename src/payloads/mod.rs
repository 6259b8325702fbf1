//! # Calibration payloads
//!
//! A payload is one conditions-database object holding the calibration constants
//! of a detector component. The set of components taking part in the global fit is
//! closed and known at compile time, so payloads are modelled as the tagged
//! variants of [`Payload`], one per [`Component`], all exposing the common
//! [`GlobalParamSet`] capability:
//!
//! * enumerate `(element, param, value)` triples,
//! * read one value,
//! * overwrite one value.
//!
//! ## Components
//! -----------------
//! | Component              | Name                    | Unique id | Payload shape          |
//! |------------------------|-------------------------|-----------|------------------------|
//! | `BeamSpot`             | `BeamSpot`              | 1         | [`BeamSpot`]           |
//! | `VxdAlignment`         | `VXDAlignment`          | 10        | [`CalibrationConstMap`]|
//! | `CdcTimeZeros`         | `CDCTimeZeros`          | 27        | [`CalibrationConstMap`]|
//! | `CdcAlignment`         | `CDCAlignment`          | 29        | [`CalibrationConstMap`]|
//! | `CdcLayerAlignment`    | `CDCLayerAlignment`     | 31        | [`CalibrationConstMap`]|
//! | `BklmAlignment`        | `BKLMAlignment`         | 35        | [`CalibrationConstMap`]|
//! | `EklmAlignment`        | `EKLMAlignment`         | 40        | [`CalibrationConstMap`]|
//! | `EklmSegmentAlignment` | `EKLMSegmentAlignment`  | 41        | [`CalibrationConstMap`]|
//!
//! ## See also
//! ------------
//! * [`GlobalParamVector`](crate::param_vector::GlobalParamVector) – flat view over the active payloads.
//! * [`ConditionsStore`](crate::payloads::conditions::ConditionsStore) – where payloads come from and go back to.
pub mod conditions;

use std::{collections::BTreeMap, fmt, str::FromStr};

use nalgebra::Vector3;

use crate::{
    align_errors::AlignError,
    constants::{ElementId, ParamId, UniqueId},
};

/// Rigid-body parameter ids shared by every alignment payload.
pub mod rigid_body {
    use crate::constants::ParamId;

    pub const DU: ParamId = 1;
    pub const DV: ParamId = 2;
    pub const DW: ParamId = 3;
    pub const DALPHA: ParamId = 4;
    pub const DBETA: ParamId = 5;
    pub const DGAMMA: ParamId = 6;

    /// All six parameters in derivative-matrix order.
    pub const PARAMS: [ParamId; 6] = [DU, DV, DW, DALPHA, DBETA, DGAMMA];
}

/// Lorentz-shift parameter ids of the vertex-detector sensors.
pub mod lorentz_shift {
    use crate::constants::ParamId;

    pub const SHIFT_U: ParamId = 31;
    pub const SHIFT_V: ParamId = 32;

    pub const PARAMS: [ParamId; 2] = [SHIFT_U, SHIFT_V];
}

/// Beam-spot position parameter ids. The beam spot is the single element `0`.
pub mod beam_spot {
    use crate::constants::ParamId;

    pub const X: ParamId = 1;
    pub const Y: ParamId = 2;
    pub const Z: ParamId = 3;

    pub const PARAMS: [ParamId; 3] = [X, Y, Z];
}

/// Drift-chamber time-zero parameter id, one per wire element.
pub mod cdc_time_zero {
    use crate::constants::ParamId;

    pub const T0: ParamId = 0;

    pub const PARAMS: [ParamId; 1] = [T0];
}

const VXD_PARAMS: [ParamId; 8] = [
    rigid_body::DU,
    rigid_body::DV,
    rigid_body::DW,
    rigid_body::DALPHA,
    rigid_body::DBETA,
    rigid_body::DGAMMA,
    lorentz_shift::SHIFT_U,
    lorentz_shift::SHIFT_V,
];

/// Detector components able to take part in the global fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    BeamSpot,
    VxdAlignment,
    CdcTimeZeros,
    CdcAlignment,
    CdcLayerAlignment,
    BklmAlignment,
    EklmAlignment,
    EklmSegmentAlignment,
}

impl Component {
    pub const ALL: [Component; 8] = [
        Component::BeamSpot,
        Component::VxdAlignment,
        Component::CdcTimeZeros,
        Component::CdcAlignment,
        Component::CdcLayerAlignment,
        Component::BklmAlignment,
        Component::EklmAlignment,
        Component::EklmSegmentAlignment,
    ];

    /// Payload name as used in the component filter.
    pub fn name(&self) -> &'static str {
        match self {
            Component::BeamSpot => "BeamSpot",
            Component::VxdAlignment => "VXDAlignment",
            Component::CdcTimeZeros => "CDCTimeZeros",
            Component::CdcAlignment => "CDCAlignment",
            Component::CdcLayerAlignment => "CDCLayerAlignment",
            Component::BklmAlignment => "BKLMAlignment",
            Component::EklmAlignment => "EKLMAlignment",
            Component::EklmSegmentAlignment => "EKLMSegmentAlignment",
        }
    }

    /// Unique id encoded in every global label of this payload.
    pub fn unique_id(&self) -> UniqueId {
        match self {
            Component::BeamSpot => 1,
            Component::VxdAlignment => 10,
            Component::CdcTimeZeros => 27,
            Component::CdcAlignment => 29,
            Component::CdcLayerAlignment => 31,
            Component::BklmAlignment => 35,
            Component::EklmAlignment => 40,
            Component::EklmSegmentAlignment => 41,
        }
    }

    pub fn from_unique_id(unique_id: UniqueId) -> Option<Component> {
        Component::ALL
            .into_iter()
            .find(|c| c.unique_id() == unique_id)
    }

    /// Parameter ids an element of this component can carry.
    pub fn param_ids(&self) -> &'static [ParamId] {
        match self {
            Component::BeamSpot => &beam_spot::PARAMS,
            Component::VxdAlignment => &VXD_PARAMS,
            Component::CdcTimeZeros => &cdc_time_zero::PARAMS,
            Component::CdcAlignment
            | Component::CdcLayerAlignment
            | Component::BklmAlignment
            | Component::EklmAlignment
            | Component::EklmSegmentAlignment => &rigid_body::PARAMS,
        }
    }

    /// `true` if `(element, param)` can exist in a payload of this component.
    pub fn accepts(&self, element: ElementId, param: ParamId) -> bool {
        let element_ok = match self {
            Component::BeamSpot => element == 0,
            _ => true,
        };
        element_ok && self.param_ids().contains(&param)
    }

    /// Empty payload of this component.
    pub fn empty_payload(&self) -> Payload {
        match self {
            Component::BeamSpot => Payload::BeamSpot(BeamSpot::default()),
            other => Payload::ConstMap(*other, CalibrationConstMap::default()),
        }
    }
}

impl FromStr for Component {
    type Err = AlignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Component::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| AlignError::UnknownComponent(s.to_string()))
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Common capability of every payload: a keyed set of scalar parameters.
pub trait GlobalParamSet {
    /// Unique id of the payload kind.
    fn unique_id(&self) -> UniqueId;

    /// Every `(element, param, value)` triple, in a stable order.
    fn parameters(&self) -> Vec<(ElementId, ParamId, f64)>;

    fn get(&self, element: ElementId, param: ParamId) -> Option<f64>;

    /// Overwrite one value; returns `false` if the parameter does not exist.
    fn set(&mut self, element: ElementId, param: ParamId, value: f64) -> bool;
}

/// Position of the interaction region.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BeamSpot {
    pub position: Vector3<f64>,
}

impl BeamSpot {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        BeamSpot {
            position: Vector3::new(x, y, z),
        }
    }
}

impl GlobalParamSet for BeamSpot {
    fn unique_id(&self) -> UniqueId {
        Component::BeamSpot.unique_id()
    }

    fn parameters(&self) -> Vec<(ElementId, ParamId, f64)> {
        vec![
            (0, beam_spot::X, self.position.x),
            (0, beam_spot::Y, self.position.y),
            (0, beam_spot::Z, self.position.z),
        ]
    }

    fn get(&self, element: ElementId, param: ParamId) -> Option<f64> {
        match (element, param) {
            (0, beam_spot::X) => Some(self.position.x),
            (0, beam_spot::Y) => Some(self.position.y),
            (0, beam_spot::Z) => Some(self.position.z),
            _ => None,
        }
    }

    fn set(&mut self, element: ElementId, param: ParamId, value: f64) -> bool {
        match (element, param) {
            (0, beam_spot::X) => self.position.x = value,
            (0, beam_spot::Y) => self.position.y = value,
            (0, beam_spot::Z) => self.position.z = value,
            _ => return false,
        }
        true
    }
}

/// Generic `(element, param) → value` calibration constants.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalibrationConstMap {
    constants: BTreeMap<(ElementId, ParamId), f64>,
}

impl CalibrationConstMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a constant (builder style).
    pub fn with(mut self, element: ElementId, param: ParamId, value: f64) -> Self {
        self.insert(element, param, value);
        self
    }

    pub fn insert(&mut self, element: ElementId, param: ParamId, value: f64) {
        self.constants.insert((element, param), value);
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }
}

/// One loaded payload, tagged by component.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    BeamSpot(BeamSpot),
    ConstMap(Component, CalibrationConstMap),
}

impl Payload {
    pub fn component(&self) -> Component {
        match self {
            Payload::BeamSpot(_) => Component::BeamSpot,
            Payload::ConstMap(component, _) => *component,
        }
    }
}

impl GlobalParamSet for Payload {
    fn unique_id(&self) -> UniqueId {
        self.component().unique_id()
    }

    fn parameters(&self) -> Vec<(ElementId, ParamId, f64)> {
        match self {
            Payload::BeamSpot(bs) => bs.parameters(),
            Payload::ConstMap(_, map) => map
                .constants
                .iter()
                .map(|(&(element, param), &value)| (element, param, value))
                .collect(),
        }
    }

    fn get(&self, element: ElementId, param: ParamId) -> Option<f64> {
        match self {
            Payload::BeamSpot(bs) => bs.get(element, param),
            Payload::ConstMap(_, map) => map.constants.get(&(element, param)).copied(),
        }
    }

    fn set(&mut self, element: ElementId, param: ParamId, value: f64) -> bool {
        match self {
            Payload::BeamSpot(bs) => bs.set(element, param, value),
            Payload::ConstMap(_, map) => match map.constants.get_mut(&(element, param)) {
                Some(v) => {
                    *v = value;
                    true
                }
                None => false,
            },
        }
    }
}
