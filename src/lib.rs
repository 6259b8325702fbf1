pub mod algorithm;
pub mod align_errors;
pub mod constants;
pub mod global_label;
pub mod hierarchy;
pub mod manager;
pub mod mille;
pub mod param_vector;
pub mod payloads;
pub mod pede;
pub mod timeline;

#[cfg(test)]
pub(crate) mod unit_test_global {
    use crate::{
        payloads::{
            conditions::{InMemoryConditions, IntervalOfValidity},
            rigid_body, BeamSpot, CalibrationConstMap, Component, Payload,
        },
        timeline::EventKey,
    };

    /// Store holding an open-ended beam spot and a two-sensor VXD alignment.
    pub(crate) fn seeded_conditions() -> InMemoryConditions {
        let mut store = InMemoryConditions::new();
        let iov = IntervalOfValidity::new(EventKey::origin(), None);
        store.insert(Payload::BeamSpot(BeamSpot::new(0.0, 0.0, 0.0)), iov);
        let mut map = CalibrationConstMap::new();
        for element in [1, 2] {
            for param in rigid_body::PARAMS {
                map.insert(element, param, 0.0);
            }
        }
        store.insert(Payload::ConstMap(Component::VxdAlignment, map), iov);
        store
    }
}
