//! Parsed output of a Millepede fit.
//!
//! `millepede.res` has a header line followed by one line per parameter:
//!
//! ```text
//!  Parameter   ! first 3 elements per line are significant (if used as input)
//!  100000101  0.12340E-01  0.00000E+00  0.12340E-01  0.50000E-02   0.512   1423
//!  100000102  0.00000E+00 -1.00000E+00
//! ```
//!
//! i.e. `label value presigma [differ error [globcor [count]]]`.
//!
//! | columns / values              | status                        |
//! |-------------------------------|-------------------------------|
//! | `presigma < 0`                | [`ParamStatus::Fixed`]        |
//! | no error, or `error <= 0`     | [`ParamStatus::NotDetermined`]|
//! | otherwise                     | [`ParamStatus::Determined`]   |
//!
//! A [`PedeResult`] is invalid until [`PedeResult::read`] succeeds: every getter
//! returns [`AlignError::InvalidResultAccess`] before that.
use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufRead, BufReader},
};

use ahash::AHashMap;
use camino::Utf8Path;
use nom::{
    character::complete::{i32 as parse_label, space0, space1},
    combinator::all_consuming,
    multi::many1,
    number::complete::double,
    sequence::{preceded, terminated},
    IResult, Parser,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::{align_errors::AlignError, constants::Label};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParamStatus {
    Determined,
    NotDetermined,
    Fixed,
}

/// Fit outcome of one global parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamResult {
    pub label: Label,
    /// Fitted correction.
    pub value: f64,
    pub presigma: f64,
    pub error: Option<f64>,
    pub global_corr: Option<f64>,
    pub count: Option<u64>,
    pub status: ParamStatus,
}

impl ParamResult {
    /// `value / error` for determined parameters.
    pub fn pull(&self) -> Option<f64> {
        match (self.status, self.error) {
            (ParamStatus::Determined, Some(err)) => Some(self.value / err),
            _ => None,
        }
    }

    pub fn is_determined(&self) -> bool {
        self.status == ParamStatus::Determined
    }
}

fn parse_result_line(input: &str) -> IResult<&str, (Label, Vec<f64>)> {
    all_consuming(terminated(
        (preceded(space0, parse_label), many1(preceded(space1, double))),
        space0,
    ))
    .parse(input)
}

fn to_param_result(label: Label, columns: &[f64]) -> Result<ParamResult, String> {
    if columns.len() < 2 || columns.len() > 6 {
        return Err(format!("expected 3 to 7 columns, got {}", columns.len() + 1));
    }
    let value = columns[0];
    let presigma = columns[1];
    let error = columns.get(3).copied();
    let status = if presigma < 0.0 {
        ParamStatus::Fixed
    } else if error.is_some_and(|e| e > 0.0) {
        ParamStatus::Determined
    } else {
        ParamStatus::NotDetermined
    };
    Ok(ParamResult {
        label,
        value,
        presigma,
        error,
        global_corr: columns.get(4).copied(),
        count: columns.get(5).map(|c| *c as u64),
        status,
    })
}

fn is_data_line(line: &str) -> bool {
    line.trim_start()
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '-')
}

#[derive(Debug, Clone, Default)]
pub struct PedeResult {
    valid: bool,
    params: Vec<ParamResult>,
    index: AHashMap<Label, usize>,
    covariance: BTreeMap<(Label, Label), f64>,
}

impl PedeResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `millepede.res` file, replacing any previous content.
    ///
    /// Return
    /// ----------
    /// * [`AlignError::ResultParsing`] naming the offending line; the result stays
    ///   invalid in that case.
    pub fn read(&mut self, path: &Utf8Path) -> Result<(), AlignError> {
        self.valid = false;
        self.params.clear();
        self.index.clear();
        self.covariance.clear();

        let reader = BufReader::new(File::open(path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if !is_data_line(&line) {
                continue;
            }
            let parse_error =
                |msg: String| AlignError::ResultParsing(format!("{path}:{}: {msg}", line_no + 1));
            let (_, (label, columns)) =
                parse_result_line(&line).map_err(|e| parse_error(e.to_string()))?;
            let param = to_param_result(label, &columns).map_err(parse_error)?;
            self.index.insert(label, self.params.len());
            self.params.push(param);
        }

        self.valid = true;
        info!(
            path = %path,
            params = self.params.len(),
            not_determined = self
                .params
                .iter()
                .filter(|p| p.status == ParamStatus::NotDetermined)
                .count(),
            "pede result read"
        );
        Ok(())
    }

    /// Parse a covariance dump: a header line then `label_i label_j cov_ij` triples.
    /// Only available after [`PedeResult::read`].
    pub fn read_covariance(&mut self, path: &Utf8Path) -> Result<(), AlignError> {
        self.check()?;
        let reader = BufReader::new(File::open(path)?);
        let mut covariance = BTreeMap::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if !is_data_line(&line) {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let (Some(i), Some(j), Some(cov), None) =
                (tokens.next(), tokens.next(), tokens.next(), tokens.next())
            else {
                return Err(AlignError::ResultParsing(format!(
                    "{path}:{}: expected 'label label covariance'",
                    line_no + 1
                )));
            };
            let parsed = (i.parse::<Label>(), j.parse::<Label>(), cov.parse::<f64>());
            let (Ok(i), Ok(j), Ok(cov)) = parsed else {
                return Err(AlignError::ResultParsing(format!(
                    "{path}:{}: invalid number",
                    line_no + 1
                )));
            };
            covariance.insert((i.min(j), i.max(j)), cov);
        }
        debug!(path = %path, entries = covariance.len(), "covariance read");
        self.covariance = covariance;
        Ok(())
    }

    fn check(&self) -> Result<(), AlignError> {
        if self.valid {
            Ok(())
        } else {
            Err(AlignError::InvalidResultAccess)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn params(&self) -> Result<&[ParamResult], AlignError> {
        self.check()?;
        Ok(&self.params)
    }

    pub fn n_params(&self) -> Result<usize, AlignError> {
        self.check()?;
        Ok(self.params.len())
    }

    /// Result of one label.
    ///
    /// Return
    /// ----------
    /// * [`AlignError::InvalidResultAccess`] before a successful read,
    ///   [`AlignError::UnknownLabel`] if the solver did not report the label.
    pub fn param(&self, label: Label) -> Result<&ParamResult, AlignError> {
        self.check()?;
        self.index
            .get(&label)
            .map(|&i| &self.params[i])
            .ok_or(AlignError::UnknownLabel(label))
    }

    pub fn contains(&self, label: Label) -> Result<bool, AlignError> {
        self.check()?;
        Ok(self.index.contains_key(&label))
    }

    pub fn value(&self, label: Label) -> Result<f64, AlignError> {
        Ok(self.param(label)?.value)
    }

    pub fn error(&self, label: Label) -> Result<Option<f64>, AlignError> {
        Ok(self.param(label)?.error)
    }

    pub fn pull(&self, label: Label) -> Result<Option<f64>, AlignError> {
        Ok(self.param(label)?.pull())
    }

    pub fn global_corr(&self, label: Label) -> Result<Option<f64>, AlignError> {
        Ok(self.param(label)?.global_corr)
    }

    pub fn status(&self, label: Label) -> Result<ParamStatus, AlignError> {
        Ok(self.param(label)?.status)
    }

    /// Labels reported as not determined.
    pub fn not_determined(&self) -> Result<Vec<Label>, AlignError> {
        self.check()?;
        Ok(self
            .params
            .iter()
            .filter(|p| p.status == ParamStatus::NotDetermined)
            .map(|p| p.label)
            .collect())
    }

    /// Covariance of two labels, if it was read.
    pub fn covariance(&self, a: Label, b: Label) -> Result<Option<f64>, AlignError> {
        self.check()?;
        Ok(self.covariance.get(&(a.min(b), a.max(b))).copied())
    }

    /// Correlation coefficient of two labels, if their covariances were read.
    pub fn correlation(&self, a: Label, b: Label) -> Result<Option<f64>, AlignError> {
        let (Some(ab), Some(aa), Some(bb)) = (
            self.covariance(a, b)?,
            self.covariance(a, a)?,
            self.covariance(b, b)?,
        ) else {
            return Ok(None);
        };
        if aa <= 0.0 || bb <= 0.0 {
            return Ok(None);
        }
        Ok(Some(ab / (aa * bb).sqrt()))
    }

    /// Export the per-parameter table as CSV.
    pub fn write_csv(&self, path: &Utf8Path) -> Result<(), AlignError> {
        self.check()?;
        let mut writer = csv::Writer::from_path(path)?;
        for param in &self.params {
            writer.serialize(param)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Display for PedeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            return writeln!(f, "Pede result: not read");
        }
        writeln!(f, "Pede result: {} parameters", self.params.len())?;
        writeln!(
            f,
            "{:>11}  {:>13}  {:>11}  {:>8}  {:>8}  {}",
            "label", "value", "error", "pull", "globcor", "status"
        )?;
        for p in &self.params {
            let opt = |v: Option<f64>, prec: usize| {
                v.map_or_else(|| "-".to_string(), |v| format!("{v:.prec$e}"))
            };
            writeln!(
                f,
                "{:>11}  {:>13.5e}  {:>11}  {:>8}  {:>8}  {:?}",
                p.label,
                p.value,
                opt(p.error, 3),
                p.pull().map_or_else(|| "-".to_string(), |v| format!("{v:.2}")),
                p.global_corr
                    .map_or_else(|| "-".to_string(), |v| format!("{v:.3}")),
                p.status
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_pede_result {
    use super::*;
    use approx::assert_relative_eq;
    use camino::Utf8PathBuf;

    const RES: &str = " Parameter   ! first 3 elements per line are significant (if used as input)
 100000101  0.12000E-01  0.00000E+00  0.12000E-01  0.40000E-02   0.512   1423
 100000102  0.00000E+00 -1.00000E+00
 100000103  0.00000E+00  0.00000E+00  0.00000E+00
 1000000000  -0.25000E-02  0.00000E+00 -0.25000E-02  0.00000E+00
";

    fn write(dir: &tempfile::TempDir, name: &str, text: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap();
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_access_before_read() {
        let result = PedeResult::new();
        assert_eq!(result.value(1), Err(AlignError::InvalidResultAccess));
        assert_eq!(result.params().unwrap_err(), AlignError::InvalidResultAccess);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_read_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = PedeResult::new();
        result.read(&write(&dir, "millepede.res", RES)).unwrap();

        assert_eq!(result.n_params().unwrap(), 4);
        assert_eq!(result.status(100_000_101).unwrap(), ParamStatus::Determined);
        assert_eq!(result.status(100_000_102).unwrap(), ParamStatus::Fixed);
        assert_eq!(result.status(100_000_103).unwrap(), ParamStatus::NotDetermined);
        assert_eq!(
            result.status(1_000_000_000).unwrap(),
            ParamStatus::NotDetermined
        );
        assert_relative_eq!(result.pull(100_000_101).unwrap().unwrap(), 3.0);
        assert_eq!(result.param(100_000_101).unwrap().count, Some(1423));
        assert_eq!(result.not_determined().unwrap(), vec![100_000_103, 1_000_000_000]);
        assert_eq!(result.value(5), Err(AlignError::UnknownLabel(5)));
    }

    #[test]
    fn test_bad_line_keeps_result_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = PedeResult::new();
        let err = result
            .read(&write(&dir, "bad.res", "Parameter\n 12 0.1 zero\n"))
            .unwrap_err();
        assert!(matches!(err, AlignError::ResultParsing(ref m) if m.contains(":2:")));
        assert!(!result.is_valid());
    }

    #[test]
    fn test_covariance_and_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = PedeResult::new();
        assert_eq!(
            result.read_covariance(&write(&dir, "cov", "x\n")),
            Err(AlignError::InvalidResultAccess)
        );
        result.read(&write(&dir, "millepede.res", RES)).unwrap();
        result
            .read_covariance(&write(
                &dir,
                "millepede.cov",
                "Covariance\n100000101 100000101 4.0\n1000000000 100000101 1.0\n1000000000 1000000000 1.0\n",
            ))
            .unwrap();
        assert_eq!(result.covariance(100_000_101, 1_000_000_000).unwrap(), Some(1.0));
        assert_relative_eq!(
            result.correlation(1_000_000_000, 100_000_101).unwrap().unwrap(),
            0.5
        );

        let csv_path = Utf8PathBuf::from_path_buf(dir.path().join("result.csv")).unwrap();
        result.write_csv(&csv_path).unwrap();
        let text = std::fs::read_to_string(&csv_path).unwrap();
        assert!(text.starts_with("label,value,presigma,error,global_corr,count,status"));
        assert_eq!(text.lines().count(), 5);
        assert!(result.to_string().contains("NotDetermined"));
    }
}
