//! Configuration of the Millepede calibration algorithm.
use std::{fmt, time::Duration};

use camino::Utf8PathBuf;
use itertools::Itertools;

use crate::{
    align_errors::AlignError,
    constants::PEDE_EXECUTABLE,
    param_vector::GlobalParamVector,
    timeline::{TimeTable, TimedepConfig},
};

/// Tuning of [`MillepedeAlgorithm`](crate::algorithm::MillepedeAlgorithm).
///
/// Fields
/// -----------------
/// * `components` – payload names to calibrate; empty means every known component.
/// * `invert_sign` – apply fitted corrections as `v - c` instead of `v + c`.
/// * `ignore_undetermined_params` – keep going when the solver could not determine
///   some parameters (they are left unchanged) instead of failing the calibration.
/// * `min_entries` – minimum number of collected records; a negative value
///   disables the check.
/// * `time_slices` – time-dependence configuration of the parameters.
/// * `records_per_file` – records written to one binary file before rolling over.
/// * `binary_prefix` – file name prefix of the binary files.
/// * `work_dir` – directory of the steering, binary and result files.
/// * `iterate_threshold` – request another iteration if a fitted correction has a
///   pull `|c / σ|` above this value.
/// * `pede_executable` – solver executable.
/// * `pede_timeout` – kill the solver after this duration.
/// * `constraint_files` – solver constraint files listed in the steering after
///   the generated constraints; relative paths are taken from the current
///   directory.
///
/// Defaults
/// -----------------
/// * `components`: all
/// * `invert_sign`: false
/// * `ignore_undetermined_params`: false
/// * `min_entries`: 10
/// * `time_slices`: none
/// * `records_per_file`: 100 000
/// * `binary_prefix`: `"mille"`
/// * `work_dir`: `"."`
/// * `iterate_threshold`: none
/// * `pede_executable`: `"pede"`
/// * `pede_timeout`: none
/// * `constraint_files`: none
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmParams {
    pub components: Vec<String>,
    pub invert_sign: bool,
    pub ignore_undetermined_params: bool,
    pub min_entries: i64,
    pub time_slices: TimedepConfig,
    pub records_per_file: usize,
    pub binary_prefix: String,
    pub work_dir: Utf8PathBuf,
    pub iterate_threshold: Option<f64>,
    pub pede_executable: Utf8PathBuf,
    pub pede_timeout: Option<Duration>,
    pub constraint_files: Vec<Utf8PathBuf>,
}

impl AlgorithmParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> AlgorithmParamsBuilder {
        AlgorithmParamsBuilder::new()
    }
}

impl Default for AlgorithmParams {
    fn default() -> Self {
        AlgorithmParams {
            components: Vec::new(),
            invert_sign: false,
            ignore_undetermined_params: false,
            min_entries: 10,
            time_slices: TimedepConfig::new(),
            records_per_file: 100_000,
            binary_prefix: "mille".into(),
            work_dir: Utf8PathBuf::from("."),
            iterate_threshold: None,
            pede_executable: Utf8PathBuf::from(PEDE_EXECUTABLE),
            pede_timeout: None,
            constraint_files: Vec::new(),
        }
    }
}

/// Builder for [`AlgorithmParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct AlgorithmParamsBuilder {
    params: AlgorithmParams,
}

impl AlgorithmParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn components<S: AsRef<str>>(mut self, v: &[S]) -> Self {
        self.params.components = v.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }
    pub fn invert_sign(mut self, v: bool) -> Self {
        self.params.invert_sign = v;
        self
    }
    pub fn ignore_undetermined_params(mut self, v: bool) -> Self {
        self.params.ignore_undetermined_params = v;
        self
    }
    pub fn min_entries(mut self, v: i64) -> Self {
        self.params.min_entries = v;
        self
    }
    pub fn time_slices(mut self, v: TimedepConfig) -> Self {
        self.params.time_slices = v;
        self
    }
    pub fn records_per_file(mut self, v: usize) -> Self {
        self.params.records_per_file = v;
        self
    }
    pub fn binary_prefix(mut self, v: impl Into<String>) -> Self {
        self.params.binary_prefix = v.into();
        self
    }
    pub fn work_dir(mut self, v: impl Into<Utf8PathBuf>) -> Self {
        self.params.work_dir = v.into();
        self
    }
    pub fn iterate_threshold(mut self, v: Option<f64>) -> Self {
        self.params.iterate_threshold = v;
        self
    }
    pub fn pede_executable(mut self, v: impl Into<Utf8PathBuf>) -> Self {
        self.params.pede_executable = v.into();
        self
    }
    pub fn pede_timeout(mut self, v: Option<Duration>) -> Self {
        self.params.pede_timeout = v;
        self
    }
    pub fn constraint_file(mut self, v: impl Into<Utf8PathBuf>) -> Self {
        self.params.constraint_files.push(v.into());
        self
    }

    /// Validate and return the parameters.
    ///
    /// Return
    /// ----------
    /// * [`AlignError::UnknownComponent`] for an unknown component name,
    ///   [`AlignError::InvalidTimeSlices`] for a bad time-dependence configuration,
    ///   [`AlignError::InvalidAlgorithmParameter`] for anything else.
    pub fn build(self) -> Result<AlgorithmParams, AlignError> {
        let p = &self.params;

        GlobalParamVector::new(p.components.as_slice())?;
        TimeTable::setup_timedep_global_labels(&p.time_slices)?;

        if p.records_per_file == 0 {
            return Err(AlignError::InvalidAlgorithmParameter(
                "records_per_file must be >= 1".into(),
            ));
        }
        if p.binary_prefix.is_empty() || p.binary_prefix.contains('/') {
            return Err(AlignError::InvalidAlgorithmParameter(
                "binary_prefix must be a non-empty file name".into(),
            ));
        }
        if p.pede_executable.as_str().is_empty() {
            return Err(AlignError::InvalidAlgorithmParameter(
                "pede_executable must not be empty".into(),
            ));
        }
        if p
            .iterate_threshold
            .is_some_and(|t| !t.is_finite() || t <= 0.0)
        {
            return Err(AlignError::InvalidAlgorithmParameter(
                "iterate_threshold must be > 0".into(),
            ));
        }
        if p.constraint_files.iter().any(|f| f.as_str().is_empty()) {
            return Err(AlignError::InvalidAlgorithmParameter(
                "constraint file paths must not be empty".into(),
            ));
        }
        if p.pede_timeout.is_some_and(|t| t.is_zero()) {
            return Err(AlignError::InvalidAlgorithmParameter(
                "pede_timeout must be > 0".into(),
            ));
        }

        Ok(self.params)
    }
}

impl fmt::Display for AlgorithmParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let components = if self.components.is_empty() {
            "all".to_string()
        } else {
            self.components.iter().join(", ")
        };
        let threshold = self
            .iterate_threshold
            .map_or_else(|| "none".to_string(), |t| format!("{t:.3}"));
        let timeout = self
            .pede_timeout
            .map_or_else(|| "none".to_string(), |t| format!("{t:?}"));

        if f.alternate() {
            const PARAM_COL: usize = 44;
            writeln!(f, "Millepede Algorithm Parameters")?;
            writeln!(f, "------------------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = if s.len() < PARAM_COL {
                        " ".repeat(PARAM_COL - s.len())
                    } else {
                        " ".to_string()
                    };
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            writeln!(f, "[Parameters]")?;
            line!("components        = {}", components, "Calibrated payloads")?;
            line!("invert_sign       = {}", self.invert_sign, "Apply v - c")?;
            line!(
                "ignore_undetermined = {}",
                self.ignore_undetermined_params,
                "Tolerate undetermined parameters"
            )?;
            line!("time_slices       = {}", self.time_slices.len(), "Time-dependent groups")?;

            writeln!(f, "\n[Input]")?;
            line!("min_entries       = {}", self.min_entries, "Negative disables the check")?;
            line!("records_per_file  = {}", self.records_per_file, "Records per binary file")?;
            line!("binary_prefix     = {}", self.binary_prefix, "Binary file prefix")?;
            line!("work_dir          = {}", self.work_dir, "Solver working directory")?;

            writeln!(f, "\n[Solver]")?;
            line!("pede_executable   = {}", self.pede_executable, "Solver binary")?;
            line!("pede_timeout      = {}", timeout, "Kill the solver after")?;
            line!("iterate_threshold = {}", threshold, "Pull triggering Iterate")?;
            line!(
                "constraint_files  = {}",
                self.constraint_files.len(),
                "Extra solver constraint files"
            )?;
            Ok(())
        } else {
            write!(
                f,
                "AlgorithmParams(components=[{}], invert_sign={}, ignore_undetermined={}, min_entries={}, time_slices={}, work_dir={}, pede={}, timeout={}, iterate>{})",
                components,
                self.invert_sign,
                self.ignore_undetermined_params,
                self.min_entries,
                self.time_slices.len(),
                self.work_dir,
                self.pede_executable,
                timeout,
                threshold
            )
        }
    }
}

#[cfg(test)]
mod test_algorithm_params {
    use super::*;
    use crate::timeline::EventKey;

    #[test]
    fn test_defaults() {
        let p = AlgorithmParams::builder().build().unwrap();
        assert_eq!(p, AlgorithmParams::default());
        assert_eq!(p.min_entries, 10);
        assert_eq!(p.records_per_file, 100_000);
        assert!(!p.invert_sign);
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            AlgorithmParams::builder().components(&["VXD"]).build(),
            Err(AlignError::UnknownComponent("VXD".into()))
        );
        assert!(matches!(
            AlgorithmParams::builder()
                .time_slices(vec![(vec![0], vec![EventKey::new(0, 1, 0)])])
                .build(),
            Err(AlignError::InvalidTimeSlices(_))
        ));
        assert!(matches!(
            AlgorithmParams::builder()
                .time_slices(vec![(vec![10_000_001], vec![EventKey::new(5, u32::MAX, 0)])])
                .build(),
            Err(AlignError::InvalidTimeSlices(_))
        ));
        for builder in [
            AlgorithmParams::builder().records_per_file(0),
            AlgorithmParams::builder().binary_prefix(""),
            AlgorithmParams::builder().binary_prefix("a/b"),
            AlgorithmParams::builder().iterate_threshold(Some(-1.0)),
            AlgorithmParams::builder().iterate_threshold(Some(f64::NAN)),
            AlgorithmParams::builder().pede_timeout(Some(Duration::ZERO)),
            AlgorithmParams::builder().pede_executable(""),
            AlgorithmParams::builder().constraint_file(""),
        ] {
            assert!(matches!(
                builder.build(),
                Err(AlignError::InvalidAlgorithmParameter(_))
            ));
        }
    }

    #[test]
    fn test_display() {
        let p = AlgorithmParams::builder()
            .components(&["BeamSpot", "VXDAlignment"])
            .invert_sign(true)
            .build()
            .unwrap();
        let short = p.to_string();
        assert!(short.contains("components=[BeamSpot, VXDAlignment]"));
        assert!(short.contains("invert_sign=true"));
        let long = format!("{p:#}");
        assert!(long.starts_with("Millepede Algorithm Parameters"));
        assert!(long.contains("# Apply v - c"));
    }
}
