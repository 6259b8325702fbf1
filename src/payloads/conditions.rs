//! Access to the conditions database.
//!
//! The database itself is an external collaborator; the calibration core only
//! needs to fetch the payload valid at a given [`EventKey`] and to store an updated
//! payload for an [`IntervalOfValidity`]. [`InMemoryConditions`] is a complete
//! implementation keyed by the first key of validity, used by the tests and by
//! callers that stage payloads before uploading them.
use std::collections::BTreeMap;

use crate::{align_errors::AlignError, timeline::EventKey};

use super::{Component, Payload};

/// Half-open validity range `[first, until)`; `until = None` means open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalOfValidity {
    pub first: EventKey,
    pub until: Option<EventKey>,
}

impl IntervalOfValidity {
    pub fn new(first: EventKey, until: Option<EventKey>) -> Self {
        IntervalOfValidity { first, until }
    }

    pub fn contains(&self, key: &EventKey) -> bool {
        self.first <= *key && self.until.map_or(true, |end| *key < end)
    }
}

pub trait ConditionsStore {
    /// Payload of `component` valid at `key`, if any.
    fn fetch(&self, component: Component, key: &EventKey) -> Option<Payload>;

    /// Store `payload` as valid for `iov`. Each call stands alone: a failing call
    /// does not undo earlier ones.
    fn store(&mut self, payload: Payload, iov: IntervalOfValidity) -> Result<(), AlignError>;
}

/// Conditions kept in memory, one entry per component and first key of validity.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConditions {
    payloads: BTreeMap<(Component, EventKey), (Payload, Option<EventKey>)>,
    n_stored: usize,
}

impl InMemoryConditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a payload without counting it as a calibration write.
    pub fn insert(&mut self, payload: Payload, iov: IntervalOfValidity) {
        self.payloads
            .insert((payload.component(), iov.first), (payload, iov.until));
    }

    /// Number of [`ConditionsStore::store`] calls that reached this store.
    pub fn n_stored(&self) -> usize {
        self.n_stored
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }
}

impl ConditionsStore for InMemoryConditions {
    fn fetch(&self, component: Component, key: &EventKey) -> Option<Payload> {
        self.payloads
            .range((component, EventKey::origin())..=(component, *key))
            .next_back()
            .filter(|(_, (_, until))| until.map_or(true, |end| *key < end))
            .map(|(_, (payload, _))| payload.clone())
    }

    fn store(&mut self, payload: Payload, iov: IntervalOfValidity) -> Result<(), AlignError> {
        self.n_stored += 1;
        self.insert(payload, iov);
        Ok(())
    }
}

#[cfg(test)]
mod test_conditions {
    use super::*;
    use crate::payloads::BeamSpot;

    #[test]
    fn test_fetch_latest_valid() {
        let mut db = InMemoryConditions::new();
        db.insert(
            Payload::BeamSpot(BeamSpot::new(0.0, 0.0, 0.0)),
            IntervalOfValidity::new(EventKey::origin(), None),
        );
        db.insert(
            Payload::BeamSpot(BeamSpot::new(1.0, 0.0, 0.0)),
            IntervalOfValidity::new(EventKey::new(0, 5, 0), Some(EventKey::new(0, 8, 0))),
        );

        let early = db.fetch(Component::BeamSpot, &EventKey::new(10, 2, 0)).unwrap();
        assert_eq!(early, Payload::BeamSpot(BeamSpot::new(0.0, 0.0, 0.0)));

        let late = db.fetch(Component::BeamSpot, &EventKey::new(0, 6, 0)).unwrap();
        assert_eq!(late, Payload::BeamSpot(BeamSpot::new(1.0, 0.0, 0.0)));

        // closed interval of the newest payload, nothing valid afterwards
        assert!(db.fetch(Component::BeamSpot, &EventKey::new(0, 9, 0)).is_none());
        assert!(db.fetch(Component::VxdAlignment, &EventKey::origin()).is_none());
        assert_eq!(db.n_stored(), 0);
    }

    #[test]
    fn test_iov_contains() {
        let iov = IntervalOfValidity::new(EventKey::new(0, 1, 0), Some(EventKey::new(0, 2, 0)));
        assert!(iov.contains(&EventKey::new(77, 1, 0)));
        assert!(!iov.contains(&EventKey::new(0, 2, 0)));
        assert!(!iov.contains(&EventKey::new(0, 0, 0)));
    }
}
