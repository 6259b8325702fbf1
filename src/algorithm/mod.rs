//! # Millepede calibration algorithm
//!
//! [`MillepedeAlgorithm::calibrate`] turns collected Millepede records into updated
//! calibration payloads:
//!
//! 1. **Prepare input** – write the in-memory records to binary files and list
//!    them (with the binary files already produced by the collection) in the
//!    steering file.
//! 2. **Statistics check** – fewer usable records than `min_entries` returns
//!    [`CalibrationResult::NotEnoughData`] without running the solver.
//! 3. **Solve** – write the hierarchy constraints and run `pede`. Any solver
//!    failure or timeout returns [`CalibrationResult::Failure`].
//! 4. **Map back** – for every column of the time table, load the payloads valid
//!    at its first key and apply the fitted corrections of the labels valid in
//!    that column (`v + c`, or `v - c` with `invert_sign`).
//! 5. **Commit** – store every modified payload with the validity of its column.
//!
//! Nothing is written to the conditions store before step 5. If any calibrated
//! parameter was not determined by the fit the calibration fails at step 4,
//! unless `ignore_undetermined_params` is set: those parameters then keep their
//! previous value and a warning is logged for each one.
//!
//! ## Result
//! -----------------
//! | Outcome                                             | [`CalibrationResult`] |
//! |-----------------------------------------------------|-----------------------|
//! | not run yet                                         | `NotExecuted`         |
//! | too few records                                     | `NotEnoughData`       |
//! | solver error, undetermined parameters, I/O failure  | `Failure`             |
//! | a pull above `iterate_threshold`                    | `Iterate`             |
//! | otherwise                                           | `Ok`                  |
pub mod params;

use std::{collections::BTreeSet, fmt};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};

use crate::{
    align_errors::AlignError,
    constants::{Label, CONSTRAINTS_FILE, PEDE_COVARIANCE_FILE, PEDE_RESULT_FILE, PEDE_STEERING_FILE},
    global_label::GlobalLabel,
    manager::GlobalCalibrationManager,
    mille::{read_file, MilleBinary, MilleData},
    param_vector::GlobalParamVector,
    payloads::{
        conditions::{ConditionsStore, IntervalOfValidity},
        Component, Payload,
    },
    pede::{ParamStatus, PedeApplication, PedeResult, PedeSteering},
};

pub use params::{AlgorithmParams, AlgorithmParamsBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationResult {
    Ok,
    NotEnoughData,
    Iterate,
    Failure,
    NotExecuted,
}

impl fmt::Display for CalibrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CalibrationResult::Ok => "ok",
            CalibrationResult::NotEnoughData => "not enough data",
            CalibrationResult::Iterate => "iterate",
            CalibrationResult::Failure => "failure",
            CalibrationResult::NotExecuted => "not executed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct MillepedeAlgorithm {
    params: AlgorithmParams,
    steering: PedeSteering,
    pede: PedeApplication,
    result: PedeResult,
    status: CalibrationResult,
    n_entries: usize,
    undetermined: Vec<Label>,
    failure: Option<String>,
}

impl MillepedeAlgorithm {
    pub fn new(params: AlgorithmParams) -> Self {
        let pede = PedeApplication::new(params.pede_executable.clone())
            .with_timeout(params.pede_timeout);
        MillepedeAlgorithm {
            steering: PedeSteering::new(params.work_dir.join(PEDE_STEERING_FILE)),
            pede,
            result: PedeResult::new(),
            status: CalibrationResult::NotExecuted,
            n_entries: 0,
            undetermined: Vec::new(),
            failure: None,
            params,
        }
    }

    /// Initialize `manager` with the configured components and time slices.
    pub fn setup_manager(&self, manager: &mut GlobalCalibrationManager) -> Result<(), AlignError> {
        manager.initialize(
            self.params.components.as_slice(),
            self.params.time_slices.clone(),
        )
    }

    /// Run one calibration.
    ///
    /// Arguments
    /// -----------------
    /// * `manager`: initialized manager (time table, constraints, components).
    /// * `data`: collected records and binary files.
    /// * `store`: conditions the payloads are read from and written back to.
    ///
    /// Payloads are written only after the solver output passed every check. The
    /// writes are not atomic: if `store` fails part way, the payloads written
    /// before the error stay in the store and the outcome is
    /// [`CalibrationResult::Failure`].
    ///
    /// Return
    /// ----------
    /// * The outcome, also available afterwards through [`MillepedeAlgorithm::status`].
    pub fn calibrate<S: ConditionsStore + ?Sized>(
        &mut self,
        manager: &GlobalCalibrationManager,
        data: &MilleData,
        store: &mut S,
    ) -> CalibrationResult {
        self.status = CalibrationResult::NotExecuted;
        self.n_entries = 0;
        self.undetermined.clear();
        self.failure = None;
        self.result = PedeResult::new();

        let status = match self.run(manager, data, store) {
            Ok(status) => status,
            Err(err) => {
                error!(error = %err, "calibration failed");
                self.failure = Some(err.to_string());
                CalibrationResult::Failure
            }
        };
        info!(status = %status, entries = self.n_entries, "calibration finished");
        self.status = status;
        status
    }

    fn run<S: ConditionsStore + ?Sized>(
        &mut self,
        manager: &GlobalCalibrationManager,
        data: &MilleData,
        store: &mut S,
    ) -> Result<CalibrationResult, AlignError> {
        if !manager.is_initialized() {
            return Err(AlignError::NotInitialized);
        }

        std::fs::create_dir_all(&self.params.work_dir)?;
        let work_dir = self.params.work_dir.canonicalize_utf8()?;
        self.steering.set_path(work_dir.join(PEDE_STEERING_FILE));
        self.steering.clear_files();

        self.n_entries = self.prepare_mille_binary(data, &work_dir)?;
        if self.params.min_entries >= 0 && (self.n_entries as i64) < self.params.min_entries {
            info!(
                entries = self.n_entries,
                min_entries = self.params.min_entries,
                "not enough data, solver not run"
            );
            return Ok(CalibrationResult::NotEnoughData);
        }

        if !manager.constraints().is_empty() {
            let path = work_dir.join(CONSTRAINTS_FILE);
            manager.write_pede_constraints(&path)?;
            self.steering.add_file(path);
        }
        for file in &self.params.constraint_files {
            self.steering.add_file(file.canonicalize_utf8()?);
        }

        self.pede.execute(&mut self.steering)?;
        self.result.read(&work_dir.join(PEDE_RESULT_FILE))?;
        let covariance = work_dir.join(PEDE_COVARIANCE_FILE);
        if covariance.exists() {
            self.result.read_covariance(&covariance)?;
        }

        let (updates, max_pull) = self.map_corrections(manager, &*store)?;

        if !self.undetermined.is_empty() {
            if !self.params.ignore_undetermined_params {
                error!(
                    n = self.undetermined.len(),
                    "parameters not determined, no payload updated"
                );
                return Ok(CalibrationResult::Failure);
            }
            for label in &self.undetermined {
                warn!(label, "parameter not determined, left unchanged");
            }
        }

        let n_updates = updates.len();
        for (committed, (payload, iov)) in updates.into_iter().enumerate() {
            let component = payload.component();
            if let Err(err) = store.store(payload, iov) {
                error!(
                    component = %component,
                    committed,
                    total = n_updates,
                    %err,
                    "payload write failed, earlier writes are kept"
                );
                return Err(err);
            }
        }
        info!(payloads = n_updates, max_pull, "payloads updated");

        match self.params.iterate_threshold {
            Some(threshold) if max_pull > threshold => Ok(CalibrationResult::Iterate),
            _ => Ok(CalibrationResult::Ok),
        }
    }

    /// Write the in-memory records to binary files and list every input file in
    /// the steering.
    ///
    /// Return
    /// ----------
    /// * The number of usable (non-empty) records over all inputs.
    pub fn prepare_mille_binary(
        &mut self,
        data: &MilleData,
        work_dir: &Utf8Path,
    ) -> Result<usize, AlignError> {
        let mut entries = 0;
        for file in data.files() {
            let n = read_file(file)?.iter().filter(|r| !r.is_empty()).count();
            debug!(file = %file, records = n, "collected binary");
            entries += n;
            self.steering.add_file(file.canonicalize_utf8()?);
        }

        let mut writer = MilleBinary::new(
            work_dir,
            &self.params.binary_prefix,
            self.params.records_per_file,
        )?;
        for record in data.records() {
            writer.write_record(record)?;
        }
        entries += writer.n_records();
        for file in writer.close()? {
            self.steering.add_file(file);
        }
        Ok(entries)
    }

    /// Apply the fitted corrections column by column, without storing anything.
    ///
    /// Fills `self.undetermined` and returns the payloads to store with the
    /// largest pull among the applied corrections.
    fn map_corrections<S: ConditionsStore + ?Sized>(
        &mut self,
        manager: &GlobalCalibrationManager,
        store: &S,
    ) -> Result<(Vec<(Payload, IntervalOfValidity)>, f64), AlignError> {
        let table = manager.time_table();
        let components: Vec<&str> = manager
            .param_vector()
            .components()
            .map(|c| c.name())
            .collect();
        let mut undetermined = BTreeSet::new();
        let mut updates = Vec::new();
        let mut max_pull: f64 = 0.0;

        for column in 0..table.n_columns() {
            let Some((first, until)) = table.column_range(column) else {
                continue;
            };
            let mut vector = GlobalParamVector::new(components.as_slice())?;
            vector.init_global_vector();
            vector.load_from(store, &first);
            let mut touched: BTreeSet<Component> = BTreeSet::new();

            for param in self.result.params()? {
                let Ok((base, slice)) = table.decode(param.label) else {
                    debug!(label = param.label, "label not produced by this job, ignored");
                    continue;
                };
                if !vector.covers_label(base) {
                    continue;
                }
                if slice.is_some() && table.slice_of(base, column) != slice {
                    continue;
                }

                match param.status {
                    ParamStatus::Fixed => {}
                    ParamStatus::NotDetermined => {
                        undetermined.insert(param.label);
                    }
                    ParamStatus::Determined if vector.is_missing_label(base) => {
                        undetermined.insert(param.label);
                    }
                    ParamStatus::Determined => {
                        match vector.apply_correction(base, param.value, self.params.invert_sign) {
                            Ok(_) => {
                                if let Some(pull) = param.pull() {
                                    max_pull = max_pull.max(pull.abs());
                                }
                                if let Some(c) = GlobalLabel::from_label(base)
                                    .ok()
                                    .and_then(|gl| Component::from_unique_id(gl.unique_id()))
                                {
                                    touched.insert(c);
                                }
                            }
                            Err(AlignError::UnknownLabel(_)) => {
                                warn!(label = param.label, "parameter missing in its payload");
                                undetermined.insert(param.label);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            let iov = IntervalOfValidity::new(first, until);
            updates.extend(
                vector
                    .into_payloads()
                    .filter(|p| touched.contains(&p.component()))
                    .map(|p| (p, iov)),
            );
        }

        self.undetermined = undetermined.into_iter().collect();
        Ok((updates, max_pull))
    }

    pub fn params(&self) -> &AlgorithmParams {
        &self.params
    }

    pub fn steering(&self) -> &PedeSteering {
        &self.steering
    }

    /// Extra solver directives can be added here before calibrating. The file list
    /// is rebuilt by every [`MillepedeAlgorithm::calibrate`]; extra constraint files
    /// go in [`AlgorithmParams::constraint_files`].
    pub fn steering_mut(&mut self) -> &mut PedeSteering {
        &mut self.steering
    }

    pub fn result(&self) -> &PedeResult {
        &self.result
    }

    pub fn pede(&self) -> &PedeApplication {
        &self.pede
    }

    pub fn status(&self) -> CalibrationResult {
        self.status
    }

    /// Usable records of the last calibration.
    pub fn n_entries(&self) -> usize {
        self.n_entries
    }

    /// Labels the last fit could not determine.
    pub fn undetermined(&self) -> &[Label] {
        &self.undetermined
    }

    /// Error that made the last calibration fail, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn work_dir(&self) -> Utf8PathBuf {
        self.params.work_dir.clone()
    }
}
