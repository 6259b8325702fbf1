//! # Time slicing of calibration parameters
//!
//! Calibration constants are allowed to change at user-given points in the data
//! taking, expressed as `(event, run, experiment)` triples ([`EventKey`]). This
//! module turns that configuration into a [`TimeTable`]:
//!
//! ```text
//! column:        0          1            2          3
//! boundary:  (0,0,0)   (111,0,0)     (0,1,0)    (0,3,0)
//! label 1:       0          1            2          2      -> 3 slices
//! label 3:       0          0            0          1      -> 2 slices
//! ```
//!
//! * The **columns** are the sorted, deduplicated boundaries of all parameters.
//!   Column `i` covers the keys in `[boundaries[i], boundaries[i + 1])`.
//! * For every time-dependent label, each column carries the **slice index** of that
//!   parameter, i.e. how many of its own boundaries have been crossed.
//! * Every boundary inside a run (`event != 0`) also closes that run: a boundary at
//!   `(0, run + 1, experiment)` is added for the same parameters, because an
//!   event-level payload is valid inside a single run only.
//! * The origin `(0, 0, 0)` is always the first column.
//!
//! The table is built once, before data collection, and is read-only afterwards.
//! Building it from the same [`TimedepConfig`] in the collection and in the fitting
//! job yields identical labels.
//!
//! ## See also
//! ------------
//! * [`GlobalLabel`](crate::global_label::GlobalLabel) – time-independent part of a label.
//! * [`GlobalCalibrationManager::pre_collect`](crate::manager::GlobalCalibrationManager::pre_collect) – per-event column tracking.
mod label_index;
pub mod timedep_csv;

use std::{cmp::Ordering, fmt};

use ahash::AHashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    align_errors::AlignError,
    constants::{Label, MAX_SLICES, MAX_TIMEDEP_PARAMS, TIMEDEP_OFFSET},
};
use label_index::LabelIndex;

/// Position in the data taking: `(event, run, experiment)`.
///
/// Keys are ordered lexicographically on experiment, then run, then event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EventKey {
    pub event: u32,
    pub run: u32,
    pub experiment: u32,
}

impl EventKey {
    pub const fn new(event: u32, run: u32, experiment: u32) -> Self {
        EventKey {
            event,
            run,
            experiment,
        }
    }

    /// The smallest possible key, `(0, 0, 0)`.
    pub const fn origin() -> Self {
        EventKey::new(0, 0, 0)
    }

    /// First event of the run following this key's run, `None` past the last run.
    pub fn next_run(&self) -> Option<Self> {
        let run = self.run.checked_add(1)?;
        Some(EventKey::new(0, run, self.experiment))
    }
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.experiment, self.run, self.event).cmp(&(other.experiment, other.run, other.event))
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<(u32, u32, u32)> for EventKey {
    fn from((event, run, experiment): (u32, u32, u32)) -> Self {
        EventKey::new(event, run, experiment)
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(ev {}, run {}, exp {})",
            self.event, self.run, self.experiment
        )
    }
}

/// Time-dependence configuration: groups of base labels with the keys at which
/// their values may change. A group with no labels only adds table columns.
pub type TimedepConfig = Vec<(Vec<Label>, Vec<EventKey>)>;

/// Sort event keys and drop duplicates.
pub fn sort_unique_vector(mut keys: Vec<EventKey>) -> Vec<EventKey> {
    keys.sort();
    keys.dedup();
    keys
}

/// Boundaries of one group including the automatic end-of-run boundaries.
///
/// A boundary inside the last representable run has no run to close into and is
/// rejected with [`AlignError::InvalidTimeSlices`].
fn with_run_closures(events: &[EventKey]) -> Result<Vec<EventKey>, AlignError> {
    let closures = events
        .iter()
        .filter(|ev| ev.event != 0)
        .map(|ev| {
            ev.next_run().ok_or_else(|| {
                AlignError::InvalidTimeSlices(format!("boundary {ev} lies in the last run"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(sort_unique_vector(
        events.iter().copied().chain(closures).collect(),
    ))
}

/// Column table of time-dependent parameters.
#[derive(Debug, Clone)]
pub struct TimeTable {
    boundaries: Vec<EventKey>,
    slices: AHashMap<Label, Vec<u32>>,
    registry: LabelIndex,
}

impl Default for TimeTable {
    fn default() -> Self {
        TimeTable {
            boundaries: vec![EventKey::origin()],
            slices: AHashMap::new(),
            registry: LabelIndex::new(),
        }
    }
}

impl TimeTable {
    /// Build the table from a time-dependence configuration.
    ///
    /// Arguments
    /// -----------------
    /// * `config`: groups of base labels with their change points.
    ///
    /// Return
    /// ----------
    /// * The table, or [`AlignError::InvalidTimeSlices`] if a label is not a valid
    ///   time-independent label, appears in two groups, or needs more than
    ///   [`MAX_SLICES`] slices.
    pub fn setup_timedep_global_labels(config: &TimedepConfig) -> Result<Self, AlignError> {
        let origin = EventKey::origin();
        let mut all_boundaries = vec![origin];
        let mut per_label: Vec<(Label, Vec<EventKey>)> = Vec::new();
        let mut seen: AHashMap<Label, usize> = AHashMap::new();

        for (group, (labels, events)) in config.iter().enumerate() {
            let bounds = with_run_closures(events)?;
            all_boundaries.extend(bounds.iter().copied());

            for &label in labels {
                if label <= 0 || label >= TIMEDEP_OFFSET {
                    return Err(AlignError::InvalidTimeSlices(format!(
                        "label {label} cannot be made time dependent"
                    )));
                }
                if let Some(previous) = seen.insert(label, group) {
                    return Err(AlignError::InvalidTimeSlices(format!(
                        "label {label} configured in groups {previous} and {group}"
                    )));
                }
                per_label.push((label, bounds.clone()));
            }
        }

        if per_label.len() > MAX_TIMEDEP_PARAMS {
            return Err(AlignError::InvalidTimeSlices(format!(
                "{} time-dependent labels exceed the label range",
                per_label.len()
            )));
        }

        let boundaries = sort_unique_vector(all_boundaries);
        let mut slices = AHashMap::with_capacity(per_label.len());
        let mut registry = LabelIndex::new();

        for (label, bounds) in per_label {
            let columns: Vec<u32> = boundaries
                .iter()
                .map(|column| {
                    bounds
                        .iter()
                        .filter(|b| **b != origin && *b <= column)
                        .count() as u32
                })
                .collect();

            let n_slices = columns.last().map_or(1, |last| last + 1);
            if n_slices > MAX_SLICES {
                return Err(AlignError::InvalidTimeSlices(format!(
                    "label {label} needs {n_slices} slices, at most {MAX_SLICES} allowed"
                )));
            }
            registry.entry_or_insert(label);
            slices.insert(label, columns);
        }

        info!(
            columns = boundaries.len(),
            timedep_labels = registry.len(),
            "time table built"
        );

        Ok(TimeTable {
            boundaries,
            slices,
            registry,
        })
    }

    /// Sorted, deduplicated column boundaries (the first one is the origin).
    pub fn boundaries(&self) -> &[EventKey] {
        &self.boundaries
    }

    pub fn n_columns(&self) -> usize {
        self.boundaries.len()
    }

    /// Index of the column containing `key`: the last boundary `<= key`,
    /// or 0 if `key` precedes every boundary.
    pub fn column_of(&self, key: &EventKey) -> usize {
        self.boundaries
            .partition_point(|b| b <= key)
            .saturating_sub(1)
    }

    /// `true` if `key` lies inside column `column`.
    pub fn column_contains(&self, column: usize, key: &EventKey) -> bool {
        let Some(start) = self.boundaries.get(column) else {
            return false;
        };
        let after_start = start <= key || column == 0;
        let before_end = self
            .boundaries
            .get(column + 1)
            .map_or(true, |end| key < end);
        after_start && before_end
    }

    /// First key of `column` and first key of the next column (open-ended for the last one).
    pub fn column_range(&self, column: usize) -> Option<(EventKey, Option<EventKey>)> {
        let start = *self.boundaries.get(column)?;
        Some((start, self.boundaries.get(column + 1).copied()))
    }

    pub fn is_time_dependent(&self, label: Label) -> bool {
        self.slices.contains_key(&label)
    }

    /// Time-dependent base labels in registration order.
    pub fn timedep_labels(&self) -> &[Label] {
        self.registry.labels()
    }

    /// Slice index of `label` in `column`; `None` for time-independent labels.
    pub fn slice_of(&self, label: Label, column: usize) -> Option<u32> {
        self.slices
            .get(&label)
            .and_then(|cols| cols.get(column).copied())
    }

    /// Number of slices of `label` (1 for time-independent labels).
    pub fn n_slices(&self, label: Label) -> u32 {
        self.slices
            .get(&label)
            .and_then(|cols| cols.last())
            .map_or(1, |last| last + 1)
    }

    /// Label of `base` valid in `column`.
    ///
    /// Time-independent labels are returned unchanged; time-dependent labels are
    /// mapped into the reserved range.
    pub fn resolve(&self, base: Label, column: usize) -> Label {
        match (self.registry.index(base), self.slice_of(base, column)) {
            (Some(index), Some(slice)) => {
                TIMEDEP_OFFSET + (index as i32) * MAX_SLICES as i32 + slice as i32
            }
            _ => base,
        }
    }

    /// Label of `base` valid at `key`.
    pub fn update_time_dep_global_labels(&self, base: Label, key: &EventKey) -> Label {
        self.resolve(base, self.column_of(key))
    }

    /// Split a fitted label into its base label and slice.
    ///
    /// Return
    /// ----------
    /// * `(base, None)` for time-independent labels, `(base, Some(slice))` otherwise.
    /// * [`AlignError::UnknownLabel`] for a time-dependent label that this table never
    ///   produced.
    pub fn decode(&self, label: Label) -> Result<(Label, Option<u32>), AlignError> {
        if label <= 0 {
            return Err(AlignError::UnknownLabel(label));
        }
        if label < TIMEDEP_OFFSET {
            return Ok((label, None));
        }
        let offset = label - TIMEDEP_OFFSET;
        let index = (offset / MAX_SLICES as i32) as usize;
        let slice = (offset % MAX_SLICES as i32) as u32;
        let base = self
            .registry
            .label(index)
            .ok_or(AlignError::UnknownLabel(label))?;
        if slice >= self.n_slices(base) {
            return Err(AlignError::UnknownLabel(label));
        }
        Ok((base, Some(slice)))
    }

    /// Every distinct label of `base` over all columns, in column order.
    pub fn all_labels_of(&self, base: Label) -> Vec<Label> {
        (0..self.n_columns())
            .map(|column| self.resolve(base, column))
            .dedup()
            .collect()
    }
}

#[cfg(test)]
mod test_timeline {
    use super::*;

    fn example_table() -> TimeTable {
        let config: TimedepConfig = vec![
            (
                vec![1, 2],
                vec![EventKey::new(0, 0, 0), EventKey::new(111, 0, 0)],
            ),
            (vec![3], vec![EventKey::new(0, 3, 0)]),
        ];
        TimeTable::setup_timedep_global_labels(&config).unwrap()
    }

    #[test]
    fn test_event_key_order() {
        let a = EventKey::new(500, 1, 0);
        let b = EventKey::new(0, 2, 0);
        let c = EventKey::new(0, 0, 1);
        assert!(a < b && b < c);
        assert_eq!(
            sort_unique_vector(vec![c, a, b, a]),
            vec![a, b, c]
        );
    }

    #[test]
    fn test_setup_example_table() {
        let table = example_table();
        assert_eq!(
            table.boundaries(),
            &[
                EventKey::new(0, 0, 0),
                EventKey::new(111, 0, 0),
                EventKey::new(0, 1, 0),
                EventKey::new(0, 3, 0),
            ]
        );
        assert!(table.is_time_dependent(1));
        assert!(table.is_time_dependent(2));
        assert_eq!(table.n_slices(1), 3);
        assert_eq!(table.n_slices(2), 3);
        assert_eq!(table.n_slices(3), 2);
        assert_eq!(table.n_slices(4), 1);
        assert_eq!(table.timedep_labels(), &[1, 2, 3]);
    }

    #[test]
    fn test_column_lookup() {
        let table = example_table();
        assert_eq!(table.column_of(&EventKey::new(5, 0, 0)), 0);
        assert_eq!(table.column_of(&EventKey::new(111, 0, 0)), 1);
        assert_eq!(table.column_of(&EventKey::new(9999, 0, 0)), 1);
        assert_eq!(table.column_of(&EventKey::new(3, 2, 0)), 2);
        assert_eq!(table.column_of(&EventKey::new(0, 3, 0)), 3);
        assert_eq!(table.column_of(&EventKey::new(0, 0, 7)), 3);
        assert!(table.column_contains(1, &EventKey::new(200, 0, 0)));
        assert!(!table.column_contains(1, &EventKey::new(0, 1, 0)));
    }

    #[test]
    fn test_slices_are_monotonic() {
        let table = example_table();
        let keys = [
            EventKey::new(0, 0, 0),
            EventKey::new(110, 0, 0),
            EventKey::new(111, 0, 0),
            EventKey::new(4, 1, 0),
            EventKey::new(0, 2, 0),
            EventKey::new(0, 3, 0),
            EventKey::new(1, 0, 1),
        ];
        for label in [1, 2, 3] {
            let slices: Vec<u32> = keys
                .iter()
                .map(|k| table.slice_of(label, table.column_of(k)).unwrap())
                .collect();
            assert!(slices.windows(2).all(|w| w[0] <= w[1]), "{slices:?}");
        }
    }

    #[test]
    fn test_resolve_and_decode() {
        let table = example_table();
        let labels = table.all_labels_of(1);
        assert_eq!(labels.len(), 3);
        for (slice, label) in labels.iter().enumerate() {
            assert!(*label >= TIMEDEP_OFFSET);
            assert_eq!(table.decode(*label).unwrap(), (1, Some(slice as u32)));
        }
        assert_eq!(table.resolve(100_000_001, 2), 100_000_001);
        assert_eq!(table.decode(100_000_001).unwrap(), (100_000_001, None));
        assert_eq!(
            table.decode(TIMEDEP_OFFSET + 2 * MAX_SLICES as i32 + 5),
            Err(AlignError::UnknownLabel(
                TIMEDEP_OFFSET + 2 * MAX_SLICES as i32 + 5
            ))
        );
        // same inputs, same label
        let key = EventKey::new(120, 0, 0);
        assert_eq!(
            table.update_time_dep_global_labels(2, &key),
            table.update_time_dep_global_labels(2, &key)
        );
    }

    #[test]
    fn test_invalid_configuration() {
        let twice: TimedepConfig = vec![
            (vec![1], vec![EventKey::new(0, 1, 0)]),
            (vec![1], vec![EventKey::new(0, 2, 0)]),
        ];
        assert!(matches!(
            TimeTable::setup_timedep_global_labels(&twice),
            Err(AlignError::InvalidTimeSlices(_))
        ));

        let zero: TimedepConfig = vec![(vec![0], vec![EventKey::new(0, 1, 0)])];
        assert!(TimeTable::setup_timedep_global_labels(&zero).is_err());
    }

    #[test]
    fn test_boundary_in_last_run() {
        assert_eq!(EventKey::new(5, u32::MAX, 0).next_run(), None);
        assert_eq!(
            EventKey::new(5, 7, 2).next_run(),
            Some(EventKey::new(0, 8, 2))
        );

        let last_run: TimedepConfig = vec![(vec![1], vec![EventKey::new(5, u32::MAX, 0)])];
        assert!(matches!(
            TimeTable::setup_timedep_global_labels(&last_run),
            Err(AlignError::InvalidTimeSlices(_))
        ));

        // a run start needs no closure
        let run_start: TimedepConfig = vec![(vec![1], vec![EventKey::new(0, u32::MAX, 0)])];
        let table = TimeTable::setup_timedep_global_labels(&run_start).unwrap();
        assert_eq!(table.n_slices(1), 2);
    }

    #[test]
    fn test_boundary_only_group() {
        let config: TimedepConfig = vec![(vec![], vec![EventKey::new(0, 0, 1002)])];
        let table = TimeTable::setup_timedep_global_labels(&config).unwrap();
        assert_eq!(table.n_columns(), 2);
        assert!(table.timedep_labels().is_empty());
    }
}
