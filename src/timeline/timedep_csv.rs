//! Loader for time-dependence configurations stored as CSV.
//!
//! One row per `(label, boundary)` pair:
//!
//! ```text
//! label,event,run,experiment
//! 1,0,0,0
//! 1,111,0,0
//! 3,0,3,0
//! ```
//!
//! Labels sharing exactly the same boundary list end up in the same group.
use std::collections::BTreeMap;

use camino::Utf8Path;
use serde::Deserialize;

use crate::{align_errors::AlignError, constants::Label};

use super::{sort_unique_vector, EventKey, TimedepConfig};

#[derive(Debug, Deserialize)]
struct TimedepRow {
    label: Label,
    event: u32,
    run: u32,
    experiment: u32,
}

/// Group rows read from `reader` into a [`TimedepConfig`].
pub fn parse_timedep_csv<R: std::io::Read>(reader: R) -> Result<TimedepConfig, AlignError> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut per_label: BTreeMap<Label, Vec<EventKey>> = BTreeMap::new();

    for row in rdr.deserialize() {
        let row: TimedepRow = row?;
        per_label
            .entry(row.label)
            .or_default()
            .push(EventKey::new(row.event, row.run, row.experiment));
    }

    let mut groups: BTreeMap<Vec<EventKey>, Vec<Label>> = BTreeMap::new();
    for (label, events) in per_label {
        groups.entry(sort_unique_vector(events)).or_default().push(label);
    }

    Ok(groups
        .into_iter()
        .map(|(events, labels)| (labels, events))
        .collect())
}

/// Read a time-dependence configuration from a CSV file.
pub fn read_timedep_csv(path: &Utf8Path) -> Result<TimedepConfig, AlignError> {
    let file = std::fs::File::open(path)?;
    parse_timedep_csv(file)
}

#[cfg(test)]
mod test_timedep_csv {
    use super::*;

    #[test]
    fn test_group_by_boundaries() {
        let input = "label,event,run,experiment\n1,0,0,0\n2,111,0,0\n1,111,0,0\n2,0,0,0\n3,0,3,0\n";
        let config = parse_timedep_csv(input.as_bytes()).unwrap();
        assert_eq!(
            config,
            vec![
                (
                    vec![1, 2],
                    vec![EventKey::new(0, 0, 0), EventKey::new(111, 0, 0)]
                ),
                (vec![3], vec![EventKey::new(0, 3, 0)]),
            ]
        );
    }

    #[test]
    fn test_malformed_row() {
        let input = "label,event,run,experiment\n1,zero,0,0\n";
        assert!(matches!(
            parse_timedep_csv(input.as_bytes()),
            Err(AlignError::Csv(_))
        ));
    }
}
