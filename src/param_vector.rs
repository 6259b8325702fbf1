//! # Global parameter vector
//!
//! [`GlobalParamVector`] exposes the constants of many heterogeneous payloads as a
//! single flat vector of `(label, value)` pairs, and maps fitted corrections back
//! onto those payloads.
//!
//! ## Lifecycle
//! -----------------
//! 1. [`GlobalParamVector::new`] validates the component filter (fail fast on
//!    unknown names). An empty filter means *calibrate everything available*.
//! 2. [`GlobalParamVector::init_global_vector`] registers one adapter for each
//!    allowed component; registering is idempotent.
//! 3. [`GlobalParamVector::load_from`] fetches the backing payloads for one key.
//!    A payload that cannot be found is skipped with a warning and recorded in
//!    [`GlobalParamVector::missing_components`]; its labels are still *covered*, so
//!    the algorithm can report them as not determined.
//! 4. [`GlobalParamVector::apply_correction`] updates one value, with the sign
//!    convention `v + c` (default) or `v - c` (`invert_sign`).
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::{
    align_errors::AlignError,
    constants::{ElementId, Label, ParamId, UniqueId},
    global_label::GlobalLabel,
    payloads::{conditions::ConditionsStore, Component, GlobalParamSet, Payload},
    timeline::EventKey,
};

#[derive(Debug, Clone, Default)]
pub struct GlobalParamVector {
    filter: BTreeSet<Component>,
    registered: BTreeSet<Component>,
    payloads: BTreeMap<Component, Payload>,
    missing: BTreeSet<Component>,
}

impl GlobalParamVector {
    /// Create a vector restricted to the named components.
    ///
    /// Arguments
    /// -----------------
    /// * `components`: payload names (e.g. `"VXDAlignment"`); empty means all.
    ///
    /// Return
    /// ----------
    /// * The (still empty) vector, or [`AlignError::UnknownComponent`].
    pub fn new<S: AsRef<str>>(components: &[S]) -> Result<Self, AlignError> {
        let filter = components
            .iter()
            .map(|name| name.as_ref().parse::<Component>())
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(GlobalParamVector {
            filter,
            ..Default::default()
        })
    }

    /// `true` if `component` passes the filter.
    pub fn is_allowed(&self, component: Component) -> bool {
        self.filter.is_empty() || self.filter.contains(&component)
    }

    /// Register the adapter of `component` if the filter allows it.
    ///
    /// Return
    /// ----------
    /// * `true` if the component is registered after the call.
    pub fn add_db_obj(&mut self, component: Component) -> bool {
        if !self.is_allowed(component) {
            debug!(component = %component, "component filtered out");
            return false;
        }
        self.registered.insert(component);
        true
    }

    /// Register every adapter allowed by the filter.
    pub fn init_global_vector(&mut self) {
        for component in Component::ALL {
            self.add_db_obj(component);
        }
    }

    /// Registered components, in label order.
    pub fn components(&self) -> impl Iterator<Item = Component> + '_ {
        self.registered.iter().copied()
    }

    pub fn has_component(&self, component: Component) -> bool {
        self.registered.contains(&component)
    }

    /// Load the payload of every registered component valid at `key`.
    pub fn load_from<S: ConditionsStore + ?Sized>(&mut self, store: &S, key: &EventKey) {
        self.payloads.clear();
        self.missing.clear();
        for component in self.registered.clone() {
            match store.fetch(component, key) {
                Some(payload) => {
                    self.payloads.insert(component, payload);
                }
                None => {
                    warn!(component = %component, key = %key, "no payload found, skipping component");
                    self.missing.insert(component);
                }
            }
        }
    }

    /// Put a payload in place directly (it must belong to a registered component).
    pub fn set_payload(&mut self, payload: Payload) -> bool {
        let component = payload.component();
        if !self.registered.contains(&component) {
            return false;
        }
        self.missing.remove(&component);
        self.payloads.insert(component, payload);
        true
    }

    /// Registered components whose payload could not be loaded.
    pub fn missing_components(&self) -> impl Iterator<Item = Component> + '_ {
        self.missing.iter().copied()
    }

    /// Flat `(label, value)` view over every loaded payload.
    pub fn global_params(&self) -> Vec<(Label, f64)> {
        self.payloads
            .values()
            .flat_map(|payload| {
                let uid = payload.unique_id();
                payload
                    .parameters()
                    .into_iter()
                    .filter_map(move |(element, param, value)| {
                        GlobalLabel::construct(uid, element, param)
                            .ok()
                            .map(|label| (label.label(), value))
                    })
            })
            .collect()
    }

    /// Label of a registered parameter.
    ///
    /// Return
    /// ----------
    /// * The label, or [`AlignError::UnknownParameter`] if no loaded payload carries
    ///   that parameter.
    pub fn label_of(
        &self,
        unique_id: UniqueId,
        element: ElementId,
        param: ParamId,
    ) -> Result<Label, AlignError> {
        let unknown = || AlignError::UnknownParameter {
            unique_id,
            element,
            param,
        };
        let payload = self.payload_by_uid(unique_id).ok_or_else(unknown)?;
        payload.get(element, param).ok_or_else(unknown)?;
        Ok(GlobalLabel::construct(unique_id, element, param)?.label())
    }

    /// Current value of a base label.
    pub fn get(&self, label: Label) -> Result<f64, AlignError> {
        let gl = GlobalLabel::from_label(label)?;
        self.payload_by_uid(gl.unique_id())
            .and_then(|p| p.get(gl.element_id(), gl.param_id()))
            .ok_or(AlignError::UnknownLabel(label))
    }

    /// `true` if the base label belongs to a registered component, loaded or not.
    pub fn covers_label(&self, label: Label) -> bool {
        GlobalLabel::from_label(label)
            .ok()
            .and_then(|gl| Component::from_unique_id(gl.unique_id()))
            .is_some_and(|c| self.registered.contains(&c))
    }

    /// `true` if the base label belongs to a component that could not be loaded.
    pub fn is_missing_label(&self, label: Label) -> bool {
        GlobalLabel::from_label(label)
            .ok()
            .and_then(|gl| Component::from_unique_id(gl.unique_id()))
            .is_some_and(|c| self.missing.contains(&c))
    }

    /// Apply a fitted correction to a base label.
    ///
    /// Arguments
    /// -----------------
    /// * `label`: base (time-independent) label.
    /// * `correction`: fitted correction `c`.
    /// * `invert_sign`: `false` → `v + c`, `true` → `v - c`.
    ///
    /// Return
    /// ----------
    /// * The new value, or [`AlignError::UnknownLabel`] if no loaded payload has it.
    pub fn apply_correction(
        &mut self,
        label: Label,
        correction: f64,
        invert_sign: bool,
    ) -> Result<f64, AlignError> {
        let gl = GlobalLabel::from_label(label)?;
        let component =
            Component::from_unique_id(gl.unique_id()).ok_or(AlignError::UnknownLabel(label))?;
        let payload = self
            .payloads
            .get_mut(&component)
            .ok_or(AlignError::UnknownLabel(label))?;
        let old = payload
            .get(gl.element_id(), gl.param_id())
            .ok_or(AlignError::UnknownLabel(label))?;
        let new = if invert_sign {
            old - correction
        } else {
            old + correction
        };
        payload.set(gl.element_id(), gl.param_id(), new);
        Ok(new)
    }

    pub fn payload(&self, component: Component) -> Option<&Payload> {
        self.payloads.get(&component)
    }

    pub fn payloads(&self) -> impl Iterator<Item = &Payload> {
        self.payloads.values()
    }

    pub fn into_payloads(self) -> impl Iterator<Item = Payload> {
        self.payloads.into_values()
    }

    fn payload_by_uid(&self, unique_id: UniqueId) -> Option<&Payload> {
        Component::from_unique_id(unique_id).and_then(|c| self.payloads.get(&c))
    }
}
