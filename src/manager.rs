//! # Global calibration manager
//!
//! [`GlobalCalibrationManager`] is the context shared by the collection and the
//! fitting side of a calibration job. It owns:
//!
//! * the time slicing ([`TimedepConfig`]) and the derived [`TimeTable`],
//! * the [`GlobalParamVector`] restricted to the calibrated components,
//! * the rigid-body and Lorentz-shift hierarchies,
//! * the closure constraints generated from those hierarchies, plus any
//!   constraint added by the caller (e.g. zero-sum constraints).
//!
//! The manager is an explicit value owned by the caller: one job creates one
//! manager and hands it to whatever needs it. It is not `Clone`.
//!
//! ## Lifecycle
//! -----------------
//! ```text
//! new() ──initialize(components, time_slices)──▶ Ready ──pre_collect(key)* ──▶ …
//! ```
//!
//! [`GlobalCalibrationManager::initialize`] validates everything before touching
//! any state, so a configuration error leaves the manager as it was.
//!
//! ## Event tracking
//! -----------------
//! [`GlobalCalibrationManager::pre_collect`] is called for every event. While the
//! key stays inside the active time-table column it only does a bounds check.
//! Moving forward advances the column; an event older than the previous one is
//! logged and located by binary search, so it never gets the label of a wrong
//! slice.
use std::collections::HashSet;

use camino::Utf8Path;
use tracing::{debug, info, warn};

use crate::{
    align_errors::AlignError,
    constants::{ElementId, Label, ParamId, UniqueId},
    global_label::GlobalLabel,
    hierarchy::{
        constraints_io, Constraint, Constraints, Hierarchy, HierarchyElement, HierarchyKind,
        LorentzShiftHierarchy, RigidBodyHierarchy,
    },
    param_vector::GlobalParamVector,
    payloads::{conditions::ConditionsStore, Component, GlobalParamSet},
    timeline::{EventKey, TimeTable, TimedepConfig},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Ready,
}

#[derive(Debug)]
pub struct GlobalCalibrationManager {
    state: ManagerState,
    time_slices: TimedepConfig,
    time_table: TimeTable,
    param_vector: GlobalParamVector,
    alignment: RigidBodyHierarchy,
    lorentz_shift: LorentzShiftHierarchy,
    constraints: Constraints,
    extra_constraints: Vec<Constraint>,
    column: usize,
    last_key: Option<EventKey>,
}

impl Default for GlobalCalibrationManager {
    fn default() -> Self {
        GlobalCalibrationManager {
            state: ManagerState::Uninitialized,
            time_slices: TimedepConfig::new(),
            time_table: TimeTable::default(),
            param_vector: GlobalParamVector::default(),
            alignment: RigidBodyHierarchy::new(),
            lorentz_shift: LorentzShiftHierarchy::new(),
            constraints: Constraints::new(),
            extra_constraints: Vec::new(),
            column: 0,
            last_key: None,
        }
    }
}

impl GlobalCalibrationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the calibrated components and their time dependence.
    ///
    /// Arguments
    /// -----------------
    /// * `components`: payload names to calibrate (empty: every known component).
    /// * `time_slices`: groups of base labels with the keys where they may change.
    ///
    /// Return
    /// ----------
    /// * [`AlignError::UnknownComponent`] or [`AlignError::InvalidTimeSlices`] on a
    ///   bad configuration; the manager is left untouched in that case.
    pub fn initialize<S: AsRef<str>>(
        &mut self,
        components: &[S],
        time_slices: TimedepConfig,
    ) -> Result<(), AlignError> {
        let mut param_vector = GlobalParamVector::new(components)?;
        param_vector.init_global_vector();
        let time_table = TimeTable::setup_timedep_global_labels(&time_slices)?;

        self.param_vector = param_vector;
        self.time_table = time_table;
        self.time_slices = time_slices;
        self.column = 0;
        self.last_key = None;
        self.state = ManagerState::Ready;

        let n_constraints = self.build_constraints()?;
        info!(
            components = self.param_vector.components().count(),
            columns = self.time_table.n_columns(),
            constraints = n_constraints,
            "calibration manager initialized"
        );
        Ok(())
    }

    /// Regenerate the constraints from the current hierarchies and the constraints
    /// added with [`GlobalCalibrationManager::add_constraint`].
    ///
    /// One pass per time-table column, with the labels valid in that column. A
    /// constraint with the same labels, coefficients and value as one already
    /// produced is dropped. Constraints touching a component outside the parameter
    /// vector are skipped.
    ///
    /// Return
    /// ----------
    /// * The number of constraints kept.
    pub fn build_constraints(&mut self) -> Result<usize, AlignError> {
        self.ensure_ready()?;
        self.constraints.clear();
        let mut seen = HashSet::new();
        let mut next_label = 1u64;
        let mut skipped = 0usize;

        for column in 0..self.time_table.n_columns() {
            let generated = self
                .alignment
                .build_constraints(&self.time_table, column)?
                .into_iter()
                .chain(
                    self.lorentz_shift
                        .build_constraints(&self.time_table, column)?,
                )
                .chain(
                    self.extra_constraints
                        .iter()
                        .map(|c| c.in_column(&self.time_table, column)),
                );
            for constraint in generated {
                let covered = constraint.entries().keys().all(|&label| {
                    self.time_table
                        .decode(label)
                        .is_ok_and(|(base, _)| self.param_vector.covers_label(base))
                });
                if !covered {
                    skipped += 1;
                    continue;
                }
                if seen.insert(constraint.checksum()) {
                    self.constraints.insert(next_label, constraint);
                    next_label += 1;
                }
            }
        }

        if skipped > 0 {
            debug!(skipped, "constraints on inactive components skipped");
        }
        Ok(self.constraints.len())
    }

    /// Add a constraint on base labels, kept across
    /// [`GlobalCalibrationManager::build_constraints`] calls.
    ///
    /// Return
    /// ----------
    /// * The number of constraints after the addition (they are rebuilt if the
    ///   manager is initialized).
    pub fn add_constraint(&mut self, constraint: Constraint) -> Result<usize, AlignError> {
        if constraint.is_empty() {
            return Err(AlignError::InvalidHierarchy(
                "constraint without parameters".into(),
            ));
        }
        self.extra_constraints.push(constraint);
        if self.is_initialized() {
            self.build_constraints()
        } else {
            Ok(self.constraints.len())
        }
    }

    /// Fix the sum of the corrections of `param` over `elements` of `component`
    /// to zero, e.g. the time zeros of all drift-chamber wires.
    ///
    /// Return
    /// ----------
    /// * [`AlignError::UnknownParameter`] if an element cannot carry `param`.
    pub fn add_zero_sum_constraint(
        &mut self,
        component: Component,
        elements: impl IntoIterator<Item = ElementId>,
        param: ParamId,
    ) -> Result<usize, AlignError> {
        let unique_id = component.unique_id();
        let labels = elements
            .into_iter()
            .map(|element| {
                if !component.accepts(element, param) {
                    return Err(AlignError::UnknownParameter {
                        unique_id,
                        element,
                        param,
                    });
                }
                Ok(GlobalLabel::construct(unique_id, element, param)?.label())
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(component = %component, param, terms = labels.len(), "zero-sum constraint added");
        self.add_constraint(Constraint::zero_sum(labels))
    }

    fn ensure_ready(&self) -> Result<(), AlignError> {
        match self.state {
            ManagerState::Ready => Ok(()),
            ManagerState::Uninitialized => Err(AlignError::NotInitialized),
        }
    }

    /// Load the payloads of the calibrated components valid at `key`.
    pub fn load_payloads<S: ConditionsStore + ?Sized>(
        &mut self,
        store: &S,
        key: &EventKey,
    ) -> Result<(), AlignError> {
        self.ensure_ready()?;
        self.param_vector.load_from(store, key);
        Ok(())
    }

    /// Track the time-table column of the current event.
    ///
    /// Return
    /// ----------
    /// * `true` if the active column changed (hierarchy caches were refreshed).
    /// * [`AlignError::NotInitialized`] before [`GlobalCalibrationManager::initialize`].
    pub fn pre_collect(&mut self, key: &EventKey) -> Result<bool, AlignError> {
        self.ensure_ready()?;

        let column = match self.last_key {
            Some(last) if *key < last => {
                warn!(key = %key, previous = %last, "event out of order");
                self.time_table.column_of(key)
            }
            _ if self.time_table.column_contains(self.column, key) => self.column,
            _ => {
                let boundaries = self.time_table.boundaries();
                let mut column = self.column;
                while column + 1 < boundaries.len() && boundaries[column + 1] <= *key {
                    column += 1;
                }
                column
            }
        };
        self.last_key = Some(*key);

        let changed = column != self.column;
        if changed {
            debug!(from = self.column, to = column, key = %key, "time slice changed");
            self.column = column;
        }
        self.alignment.update_time_dependence(column);
        self.lorentz_shift.update_time_dependence(column);
        Ok(changed)
    }

    /// Label of a parameter in the active time slice.
    ///
    /// The parameter must belong to a calibrated component and to that component's
    /// parameter set. Once payloads are loaded
    /// ([`GlobalCalibrationManager::load_payloads`]), the element must also exist in
    /// the payload.
    ///
    /// Return
    /// ----------
    /// * [`AlignError::UnknownParameter`] for any parameter the fit does not know.
    pub fn global_label(
        &self,
        unique_id: UniqueId,
        element: ElementId,
        param: ParamId,
    ) -> Result<Label, AlignError> {
        self.ensure_ready()?;
        let unknown = || AlignError::UnknownParameter {
            unique_id,
            element,
            param,
        };
        let base = GlobalLabel::construct(unique_id, element, param)?.label();
        let component = Component::from_unique_id(unique_id)
            .filter(|c| self.param_vector.has_component(*c) && c.accepts(element, param))
            .ok_or_else(unknown)?;
        if let Some(payload) = self.param_vector.payload(component) {
            payload.get(element, param).ok_or_else(unknown)?;
        }
        Ok(self.current_label(base))
    }

    /// Resolve a base label in the active time slice.
    pub fn current_label(&self, base: Label) -> Label {
        self.time_table.resolve(base, self.column)
    }

    /// Rigid-body derivatives of a measurement on `element`, extended to all its
    /// ancestors, as `(label, derivative)` pairs for the active time slice.
    pub fn global_derivatives(
        &self,
        unique_id: UniqueId,
        element: ElementId,
        derivatives: &[f64],
    ) -> Result<Vec<(Label, f64)>, AlignError> {
        self.hierarchy_derivatives(&self.alignment, unique_id, element, derivatives)
    }

    /// Same as [`GlobalCalibrationManager::global_derivatives`] for Lorentz-shift
    /// parameters.
    pub fn lorentz_shift_derivatives(
        &self,
        unique_id: UniqueId,
        element: ElementId,
        derivatives: &[f64],
    ) -> Result<Vec<(Label, f64)>, AlignError> {
        self.hierarchy_derivatives(&self.lorentz_shift, unique_id, element, derivatives)
    }

    fn hierarchy_derivatives<K: HierarchyKind>(
        &self,
        hierarchy: &Hierarchy<K>,
        unique_id: UniqueId,
        element: ElementId,
        derivatives: &[f64],
    ) -> Result<Vec<(Label, f64)>, AlignError> {
        self.ensure_ready()?;
        if derivatives.len() != K::PARAMS.len() {
            return Err(AlignError::InvalidHierarchy(format!(
                "{} derivatives given, {} expected",
                derivatives.len(),
                K::PARAMS.len()
            )));
        }

        let me = HierarchyElement::new(unique_id, element);
        let own = K::PARAMS
            .iter()
            .zip(derivatives)
            .map(|(&param, &d)| (me, param, d));

        let mut out = Vec::with_capacity(2 * K::PARAMS.len());
        for (el, param, d) in own.chain(hierarchy.global_derivatives(&me, derivatives)) {
            let base = el.label(param)?;
            if self.param_vector.covers_label(base) {
                out.push((self.current_label(base), d));
            }
        }
        Ok(out)
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == ManagerState::Ready
    }

    /// Index of the active time-table column.
    pub fn current_column(&self) -> usize {
        self.column
    }

    pub fn time_slices(&self) -> &TimedepConfig {
        &self.time_slices
    }

    pub fn time_table(&self) -> &TimeTable {
        &self.time_table
    }

    pub fn param_vector(&self) -> &GlobalParamVector {
        &self.param_vector
    }

    pub fn alignment_hierarchy(&self) -> &RigidBodyHierarchy {
        &self.alignment
    }

    pub fn alignment_hierarchy_mut(&mut self) -> &mut RigidBodyHierarchy {
        &mut self.alignment
    }

    pub fn lorentz_shift_hierarchy(&self) -> &LorentzShiftHierarchy {
        &self.lorentz_shift
    }

    pub fn lorentz_shift_hierarchy_mut(&mut self) -> &mut LorentzShiftHierarchy {
        &mut self.lorentz_shift
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Dump the constraints in the text format read back by
    /// [`read_constraints`](crate::hierarchy::constraints_io::read_constraints).
    pub fn write_constraints(&self, path: &Utf8Path) -> Result<(), AlignError> {
        constraints_io::write_constraints(&self.constraints, path)
    }

    /// Write the constraints as a solver input file.
    pub fn write_pede_constraints(&self, path: &Utf8Path) -> Result<(), AlignError> {
        constraints_io::write_pede_constraints(&self.constraints, path)
    }

    pub fn sort_unique_vector(keys: Vec<EventKey>) -> Vec<EventKey> {
        crate::timeline::sort_unique_vector(keys)
    }
}

#[cfg(test)]
mod test_manager {
    use super::*;
    use crate::{
        payloads::{beam_spot, lorentz_shift, rigid_body},
        unit_test_global::seeded_conditions,
    };
    use nalgebra::{Isometry3, Translation3, UnitQuaternion};

    fn shell() -> HierarchyElement {
        HierarchyElement::new(10, 1)
    }

    fn ladder(i: u32) -> HierarchyElement {
        HierarchyElement::new(10, 100 + i)
    }

    fn with_ladders(manager: &mut GlobalCalibrationManager) {
        let h = manager.alignment_hierarchy_mut();
        h.insert_top(shell());
        for (i, x) in [(1, 1.0), (2, -1.0)] {
            h.insert_child(
                ladder(i),
                shell(),
                Isometry3::from_parts(Translation3::new(x, 0.0, 0.0), UnitQuaternion::identity()),
            )
            .unwrap();
        }
    }

    #[test]
    fn test_requires_initialize() {
        let mut manager = GlobalCalibrationManager::new();
        assert_eq!(
            manager.pre_collect(&EventKey::origin()),
            Err(AlignError::NotInitialized)
        );
        assert_eq!(
            manager.global_label(10, 101, rigid_body::DU),
            Err(AlignError::NotInitialized)
        );
        assert!(!manager.is_initialized());
    }

    #[test]
    fn test_failed_initialize_keeps_state() {
        let mut manager = GlobalCalibrationManager::new();
        manager.initialize(&["VXDAlignment"], vec![]).unwrap();
        assert!(manager.initialize(&["Bogus"], vec![]).is_err());
        let bad_slices = vec![(vec![0], vec![EventKey::new(0, 1, 0)])];
        assert!(manager.initialize(&["BeamSpot"], bad_slices).is_err());
        assert!(manager.param_vector().has_component(Component::VxdAlignment));
        assert!(!manager.param_vector().has_component(Component::BeamSpot));
    }

    #[test]
    fn test_constraints_deduplicated_over_columns() {
        let mut manager = GlobalCalibrationManager::new();
        with_ladders(&mut manager);
        let slices = vec![(vec![], vec![EventKey::new(0, 5, 0), EventKey::new(0, 9, 0)])];
        manager.initialize(&["VXDAlignment"], slices).unwrap();
        assert_eq!(manager.time_table().n_columns(), 3);
        assert_eq!(manager.constraints().len(), 6);
        assert_eq!(
            manager.constraints().keys().copied().collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5, 6]
        );

        // time-dependent ladder: one more set of constraints per new slice
        let du = ladder(1).label(rigid_body::DU).unwrap();
        let slices = vec![(vec![du], vec![EventKey::new(0, 5, 0)])];
        manager.initialize(&["VXDAlignment"], slices).unwrap();
        assert_eq!(manager.constraints().len(), 7);

        // constraints on a component outside the vector are skipped
        manager.initialize(&["BeamSpot"], vec![]).unwrap();
        assert!(manager.constraints().is_empty());
    }

    #[test]
    fn test_zero_sum_constraint_survives_rebuild() {
        use crate::payloads::cdc_time_zero;

        let mut manager = GlobalCalibrationManager::new();
        with_ladders(&mut manager);
        let wires = [0, 1, 159, 14_335];
        assert_eq!(
            manager
                .add_zero_sum_constraint(Component::CdcTimeZeros, wires, cdc_time_zero::T0)
                .unwrap(),
            0
        );
        assert_eq!(
            manager.add_zero_sum_constraint(Component::CdcTimeZeros, [3], rigid_body::DU),
            Err(AlignError::UnknownParameter {
                unique_id: 27,
                element: 3,
                param: rigid_body::DU
            })
        );

        manager
            .initialize(&["VXDAlignment", "CDCTimeZeros"], vec![])
            .unwrap();
        assert_eq!(manager.constraints().len(), 7);
        let zero_sum = &manager.constraints()[&7];
        assert_eq!(zero_sum.value, 0.0);
        assert_eq!(
            zero_sum.entries().keys().copied().collect::<Vec<_>>(),
            vec![270_000_000, 270_000_100, 270_015_900, 271_433_500]
        );
        assert!(zero_sum.entries().values().all(|&c| c == 1.0));

        // a T0 changing in run 5 gets one constraint per slice
        let t0 = zero_sum.entries().keys().copied().next().unwrap();
        let slices = vec![(vec![t0], vec![EventKey::new(0, 5, 0)])];
        manager.initialize(&["CDCTimeZeros"], slices).unwrap();
        assert_eq!(manager.constraints().len(), 2);

        assert!(manager.add_constraint(Constraint::new(1.0)).is_err());
    }

    #[test]
    fn test_pre_collect_tracks_columns() {
        let mut manager = GlobalCalibrationManager::new();
        let du = ladder(1).label(rigid_body::DU).unwrap();
        let slices = vec![(vec![du], vec![EventKey::new(0, 2, 0), EventKey::new(0, 4, 0)])];
        manager.initialize::<&str>(&[], slices).unwrap();

        assert!(!manager.pre_collect(&EventKey::new(1, 0, 0)).unwrap());
        let first = manager.global_label(10, 101, rigid_body::DU).unwrap();
        assert!(!manager.pre_collect(&EventKey::new(2, 1, 0)).unwrap());
        assert!(manager.pre_collect(&EventKey::new(0, 2, 0)).unwrap());
        let second = manager.global_label(10, 101, rigid_body::DU).unwrap();
        assert_ne!(first, second);
        assert!(manager.pre_collect(&EventKey::new(7, 9, 0)).unwrap());
        assert_eq!(manager.current_column(), 2);

        // out of order: back to the first slice, never a wrong one
        assert!(manager.pre_collect(&EventKey::new(3, 1, 0)).unwrap());
        assert_eq!(manager.current_label(du), first);

        // time-independent parameters keep their base label
        assert_eq!(
            manager.global_label(10, 101, rigid_body::DV).unwrap(),
            ladder(1).label(rigid_body::DV).unwrap()
        );
    }

    #[test]
    fn test_unknown_parameter() {
        let mut manager = GlobalCalibrationManager::new();
        manager.initialize(&["BeamSpot"], vec![]).unwrap();
        assert_eq!(
            manager.global_label(10, 101, rigid_body::DU),
            Err(AlignError::UnknownParameter {
                unique_id: 10,
                element: 101,
                param: rigid_body::DU
            })
        );
    }

    #[test]
    fn test_parameter_outside_component_set() {
        let mut manager = GlobalCalibrationManager::new();
        manager.initialize(&["BeamSpot", "VXDAlignment"], vec![]).unwrap();
        for (uid, element, param) in [(1, 5, 77), (1, 0, 77), (1, 5, beam_spot::X), (10, 101, 40)] {
            assert_eq!(
                manager.global_label(uid, element, param),
                Err(AlignError::UnknownParameter {
                    unique_id: uid,
                    element,
                    param
                })
            );
        }
        assert_eq!(manager.global_label(1, 0, beam_spot::Z), Ok(10_000_003));
        assert_eq!(
            manager.global_label(10, 101, lorentz_shift::SHIFT_U),
            Ok(100_010_131)
        );

        // with payloads loaded, elements are checked too
        manager
            .load_payloads(&seeded_conditions(), &EventKey::origin())
            .unwrap();
        assert_eq!(
            manager.global_label(10, 2, rigid_body::DW),
            Ok(HierarchyElement::new(10, 2).label(rigid_body::DW).unwrap())
        );
        assert!(matches!(
            manager.global_label(10, 101, rigid_body::DU),
            Err(AlignError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_global_derivatives_include_ancestors() {
        let mut manager = GlobalCalibrationManager::new();
        with_ladders(&mut manager);
        manager.initialize(&["VXDAlignment"], vec![]).unwrap();
        manager.pre_collect(&EventKey::origin()).unwrap();

        let derivs = manager
            .global_derivatives(10, 101, &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .unwrap();
        assert_eq!(derivs.len(), 12);
        assert_eq!(derivs[0], (ladder(1).label(rigid_body::DU).unwrap(), 1.0));
        assert_eq!(derivs[6].0, shell().label(rigid_body::DU).unwrap());
        assert!(manager.global_derivatives(10, 101, &[1.0]).is_err());
    }

    #[test]
    fn test_sort_unique_vector() {
        let keys = vec![
            EventKey::new(0, 3, 0),
            EventKey::new(0, 1, 0),
            EventKey::new(0, 3, 0),
        ];
        assert_eq!(
            GlobalCalibrationManager::sort_unique_vector(keys),
            vec![EventKey::new(0, 1, 0), EventKey::new(0, 3, 0)]
        );
    }
}
