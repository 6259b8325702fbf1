//! # Alignment hierarchies and linear constraints
//!
//! Composite detector structures (half-shells, ladders, sensors; sectors and
//! modules) are aligned together with their sub-structures. Doing so leaves the
//! global fit with redundant degrees of freedom: moving all children coherently is
//! the same as moving their parent. Each parent therefore gets one linear
//! **closure constraint** per parent parameter:
//!
//! ```text
//!   Σ_children Σ_j  J_child(i, j) · δchild_j  = 0        for every parent parameter i
//! ```
//!
//! where `J_child` maps a correction expressed in the child frame into the
//! equivalent correction in the parent frame.
//!
//! ## Storage
//! -----------------
//! Nodes live in a flat arena (`Vec<HierarchyNode>`) and refer to their parent by
//! index, which keeps the forest valid when it is rebuilt on a slice change.
//! Insertion rejects cycles and second parents.
//!
//! ## Time dependence
//! -----------------
//! A child placement can change from one time-table column to the next (e.g. after
//! a hardware intervention). [`Hierarchy::update_time_dependence`] refreshes the
//! cached derivative matrices when the active column changes, and constraints are
//! generated per column with the labels valid in that column.
//!
//! ## Kinds
//! -----------------
//! * [`RigidBodyHierarchy`] – six rigid-body parameters, `J = [[R, [t]x R], [0, R]]`.
//! * [`LorentzShiftHierarchy`] – two Lorentz-shift parameters, `J = R[0..2, 0..2]`.
pub mod constraints_io;

use std::{
    collections::BTreeMap,
    hash::{DefaultHasher, Hash, Hasher},
    marker::PhantomData,
};

use ahash::AHashMap;
use nalgebra::{DMatrix, Isometry3, Matrix3};
use tracing::{debug, warn};

use crate::{
    align_errors::AlignError,
    constants::{ConstraintLabel, ElementId, Label, ParamId, UniqueId, CONSTRAINT_COEFF_EPS},
    global_label::GlobalLabel,
    payloads::{lorentz_shift, rigid_body},
    timeline::TimeTable,
};

/// Sparse linear relation `Σ coefficient · parameter = value`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Constraint {
    pub value: f64,
    entries: BTreeMap<Label, f64>,
}

impl Constraint {
    pub fn new(value: f64) -> Self {
        Constraint {
            value,
            entries: BTreeMap::new(),
        }
    }

    /// `Σ labels = 0`: the corrections of `labels` sum to zero.
    pub fn zero_sum(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut constraint = Constraint::new(0.0);
        for label in labels {
            constraint.add(label, 1.0);
        }
        constraint
    }

    /// Copy of a constraint on base labels, with the labels valid in `column`.
    pub fn in_column(&self, table: &TimeTable, column: usize) -> Self {
        let mut resolved = Constraint::new(self.value);
        for (&label, &coefficient) in &self.entries {
            resolved.add(table.resolve(label, column), coefficient);
        }
        resolved
    }

    /// Add `coefficient` to the term of `label`.
    pub fn add(&mut self, label: Label, coefficient: f64) {
        *self.entries.entry(label).or_insert(0.0) += coefficient;
    }

    pub fn entries(&self) -> &BTreeMap<Label, f64> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hash of the entries and value, to spot the same constraint generated twice.
    pub fn checksum(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.value.to_bits().hash(&mut hasher);
        for (label, coefficient) in &self.entries {
            label.hash(&mut hasher);
            coefficient.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Constraints keyed by their constraint label.
pub type Constraints = BTreeMap<ConstraintLabel, Constraint>;

/// One calibrated object: a payload element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HierarchyElement {
    pub unique_id: UniqueId,
    pub element: ElementId,
}

impl HierarchyElement {
    pub fn new(unique_id: UniqueId, element: ElementId) -> Self {
        HierarchyElement { unique_id, element }
    }

    /// Base label of one of this element's parameters.
    pub fn label(&self, param: ParamId) -> Result<Label, AlignError> {
        Ok(GlobalLabel::construct(self.unique_id, self.element, param)?.label())
    }
}

/// How corrections of a child propagate to its parent.
pub trait HierarchyKind {
    /// Parameter ids, in derivative-matrix order.
    const PARAMS: &'static [ParamId];

    /// Matrix mapping child-frame corrections to parent-frame corrections.
    fn child_to_parent(placement: &Isometry3<f64>) -> DMatrix<f64>;
}

/// Six-parameter rigid-body corrections.
#[derive(Debug, Clone, Copy, Default)]
pub struct RigidBody;

impl HierarchyKind for RigidBody {
    const PARAMS: &'static [ParamId] = &rigid_body::PARAMS;

    fn child_to_parent(placement: &Isometry3<f64>) -> DMatrix<f64> {
        let r: Matrix3<f64> = placement.rotation.to_rotation_matrix().into_inner();
        let tr = placement.translation.vector.cross_matrix() * r;
        let mut j = DMatrix::zeros(6, 6);
        j.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
        j.fixed_view_mut::<3, 3>(0, 3).copy_from(&tr);
        j.fixed_view_mut::<3, 3>(3, 3).copy_from(&r);
        j
    }
}

/// Two-parameter Lorentz-shift corrections in the sensor plane.
#[derive(Debug, Clone, Copy, Default)]
pub struct LorentzShift;

impl HierarchyKind for LorentzShift {
    const PARAMS: &'static [ParamId] = &lorentz_shift::PARAMS;

    fn child_to_parent(placement: &Isometry3<f64>) -> DMatrix<f64> {
        let r: Matrix3<f64> = placement.rotation.to_rotation_matrix().into_inner();
        DMatrix::from_fn(2, 2, |i, j| r[(i, j)])
    }
}

#[derive(Debug, Clone)]
struct HierarchyNode {
    element: HierarchyElement,
    parent: Option<usize>,
    children: Vec<usize>,
    /// Placement in the parent frame, keyed by the first column it applies to.
    placements: BTreeMap<usize, Isometry3<f64>>,
}

impl HierarchyNode {
    fn placement_at(&self, column: usize) -> Isometry3<f64> {
        self.placements
            .range(..=column)
            .next_back()
            .map(|(_, iso)| *iso)
            .unwrap_or_else(Isometry3::identity)
    }
}

#[derive(Debug, Clone)]
struct CachedDerivatives {
    to_parent: DMatrix<f64>,
    to_child: Option<DMatrix<f64>>,
}

/// Forest of calibrated objects.
#[derive(Debug, Clone)]
pub struct Hierarchy<K: HierarchyKind> {
    nodes: Vec<HierarchyNode>,
    index: AHashMap<HierarchyElement, usize>,
    column: Option<usize>,
    cache: Vec<Option<CachedDerivatives>>,
    kind: PhantomData<K>,
}

pub type RigidBodyHierarchy = Hierarchy<RigidBody>;
pub type LorentzShiftHierarchy = Hierarchy<LorentzShift>;

impl<K: HierarchyKind> Default for Hierarchy<K> {
    fn default() -> Self {
        Hierarchy {
            nodes: Vec::new(),
            index: AHashMap::new(),
            column: None,
            cache: Vec::new(),
            kind: PhantomData,
        }
    }
}

impl<K: HierarchyKind> Hierarchy<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, element: &HierarchyElement) -> bool {
        self.index.contains_key(element)
    }

    pub fn parent_of(&self, element: &HierarchyElement) -> Option<HierarchyElement> {
        let idx = *self.index.get(element)?;
        self.nodes[idx].parent.map(|p| self.nodes[p].element)
    }

    pub fn children_of(&self, element: &HierarchyElement) -> Vec<HierarchyElement> {
        self.index
            .get(element)
            .map(|&idx| {
                self.nodes[idx]
                    .children
                    .iter()
                    .map(|&c| self.nodes[c].element)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn node_or_insert(&mut self, element: HierarchyElement) -> usize {
        if let Some(&idx) = self.index.get(&element) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(HierarchyNode {
            element,
            parent: None,
            children: Vec::new(),
            placements: BTreeMap::new(),
        });
        self.cache.push(None);
        self.index.insert(element, idx);
        idx
    }

    /// Insert a root object (no-op if it already exists).
    pub fn insert_top(&mut self, element: HierarchyElement) {
        self.node_or_insert(element);
    }

    /// Attach `child` to an existing `parent` with its placement in the parent frame.
    ///
    /// Return
    /// ----------
    /// * [`AlignError::InvalidHierarchy`] if the parent is unknown, the child already
    ///   has a parent, or the link would close a cycle.
    pub fn insert_child(
        &mut self,
        child: HierarchyElement,
        parent: HierarchyElement,
        placement: Isometry3<f64>,
    ) -> Result<(), AlignError> {
        let parent_idx = *self.index.get(&parent).ok_or_else(|| {
            AlignError::InvalidHierarchy(format!("unknown parent {parent:?}"))
        })?;
        if child == parent {
            return Err(AlignError::InvalidHierarchy(format!(
                "{child:?} cannot be its own parent"
            )));
        }
        if let Some(&child_idx) = self.index.get(&child) {
            if self.nodes[child_idx].parent.is_some() {
                return Err(AlignError::InvalidHierarchy(format!(
                    "{child:?} already has a parent"
                )));
            }
            if self.ancestors(parent_idx).any(|a| a == child_idx) {
                return Err(AlignError::InvalidHierarchy(format!(
                    "linking {child:?} under {parent:?} creates a cycle"
                )));
            }
        }

        let child_idx = self.node_or_insert(child);
        let node = &mut self.nodes[child_idx];
        node.parent = Some(parent_idx);
        node.placements.insert(0, placement);
        self.nodes[parent_idx].children.push(child_idx);
        self.cache[child_idx] = None;
        self.column = None;
        Ok(())
    }

    /// Change the placement of `child` starting at time-table column `from_column`.
    pub fn set_placement(
        &mut self,
        child: &HierarchyElement,
        from_column: usize,
        placement: Isometry3<f64>,
    ) -> Result<(), AlignError> {
        let idx = *self
            .index
            .get(child)
            .ok_or_else(|| AlignError::InvalidHierarchy(format!("unknown element {child:?}")))?;
        self.nodes[idx].placements.insert(from_column, placement);
        self.column = None;
        Ok(())
    }

    fn ancestors(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(idx), move |&i| self.nodes[i].parent)
    }

    /// Refresh the cached derivative matrices for `column`.
    ///
    /// Return
    /// ----------
    /// * `true` if the cache was rebuilt, `false` if it was already current.
    pub fn update_time_dependence(&mut self, column: usize) -> bool {
        if self.column == Some(column) {
            return false;
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            self.cache[idx] = node.parent.map(|_| {
                let to_parent = K::child_to_parent(&node.placement_at(column));
                let to_child = to_parent.clone().try_inverse();
                if to_child.is_none() {
                    warn!(element = ?node.element, "singular child-to-parent derivatives");
                }
                CachedDerivatives {
                    to_parent,
                    to_child,
                }
            });
        }
        debug!(column, nodes = self.nodes.len(), "hierarchy derivatives refreshed");
        self.column = Some(column);
        true
    }

    /// Closure constraints for `column`, labels resolved through `table`.
    ///
    /// Parents without children contribute nothing; coefficients below
    /// [`CONSTRAINT_COEFF_EPS`] are dropped.
    pub fn build_constraints(
        &self,
        table: &TimeTable,
        column: usize,
    ) -> Result<Vec<Constraint>, AlignError> {
        let mut constraints = Vec::new();
        for parent in self.nodes.iter().filter(|n| !n.children.is_empty()) {
            for i in 0..K::PARAMS.len() {
                let mut constraint = Constraint::new(0.0);
                for &child_idx in &parent.children {
                    let child = &self.nodes[child_idx];
                    let j_child = K::child_to_parent(&child.placement_at(column));
                    for (j, &param) in K::PARAMS.iter().enumerate() {
                        let coefficient = j_child[(i, j)];
                        if coefficient.abs() < CONSTRAINT_COEFF_EPS {
                            continue;
                        }
                        let label = table.resolve(child.element.label(param)?, column);
                        constraint.add(label, coefficient);
                    }
                }
                if !constraint.is_empty() {
                    constraints.push(constraint);
                }
            }
        }
        Ok(constraints)
    }

    /// Derivatives w.r.t. every ancestor's parameters by the chain rule.
    ///
    /// Arguments
    /// -----------------
    /// * `element`: the measured object.
    /// * `derivatives`: derivatives of the measurement w.r.t. `element`'s own
    ///   parameters, in [`HierarchyKind::PARAMS`] order.
    ///
    /// Return
    /// ----------
    /// * `(ancestor, param, derivative)` triples, nearest ancestor first. Empty if
    ///   `element` is not in the hierarchy or the cache is not built yet.
    pub fn global_derivatives(
        &self,
        element: &HierarchyElement,
        derivatives: &[f64],
    ) -> Vec<(HierarchyElement, ParamId, f64)> {
        let mut out = Vec::new();
        let Some(&start) = self.index.get(element) else {
            return out;
        };
        if derivatives.len() != K::PARAMS.len() {
            warn!(
                expected = K::PARAMS.len(),
                got = derivatives.len(),
                "wrong number of derivatives"
            );
            return out;
        }

        let mut current = DMatrix::from_row_slice(1, derivatives.len(), derivatives);
        let mut idx = start;
        while let Some(parent) = self.nodes[idx].parent {
            let Some(Some(cached)) = self.cache.get(idx) else {
                break;
            };
            let Some(to_child) = &cached.to_child else {
                break;
            };
            current = &current * to_child;
            let parent_element = self.nodes[parent].element;
            out.extend(
                K::PARAMS
                    .iter()
                    .zip(current.iter())
                    .map(|(&param, &d)| (parent_element, param, d)),
            );
            idx = parent;
        }
        out
    }

    /// Child-to-parent matrix of `element` for the cached column.
    pub fn cached_child_to_parent(&self, element: &HierarchyElement) -> Option<&DMatrix<f64>> {
        let idx = *self.index.get(element)?;
        self.cache
            .get(idx)?
            .as_ref()
            .map(|cached| &cached.to_parent)
    }
}
