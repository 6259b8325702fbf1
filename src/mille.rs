//! # Millepede binary records
//!
//! One record holds the measurements of one local fit (typically one track). It is
//! written in the layout read by the Millepede solver:
//!
//! ```text
//! i32   nr                 number of words that follow (2 * n)
//! f32   floats[n]          values
//! i32   ints[n]            indices
//! ```
//!
//! all little endian. Word 0 is a `(0.0, 0)` pair, then every measurement adds
//!
//! ```text
//! (residual, 0) (local derivative, local index)* (sigma, 0) (global derivative, label)*
//! ```
//!
//! with 1-based local indices. Zero derivatives are never written.
//!
//! * [`MilleRecord`] builds one record.
//! * [`MilleBinary`] writes records into a rolling series of files.
//! * [`read_records`] / [`read_file`] parse them back.
//! * [`MilleData`] is what a collection job hands to the calibration.
use std::{
    fs::File,
    io::{BufWriter, Write},
};

use camino::{Utf8Path, Utf8PathBuf};
use nom::{
    multi::count,
    number::complete::{le_f32, le_i32},
    IResult, Parser,
};
use tracing::{debug, info};

use crate::{align_errors::AlignError, constants::Label};

/// One decoded measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub residual: f32,
    pub sigma: f32,
    /// `(1-based local index, derivative)`
    pub local: Vec<(u32, f32)>,
    /// `(label, derivative)`
    pub global: Vec<(Label, f32)>,
}

/// Records of one local fit in the solver's word layout.
#[derive(Debug, Clone, PartialEq)]
pub struct MilleRecord {
    floats: Vec<f32>,
    ints: Vec<i32>,
}

impl Default for MilleRecord {
    fn default() -> Self {
        MilleRecord {
            floats: vec![0.0],
            ints: vec![0],
        }
    }
}

impl MilleRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one measurement.
    ///
    /// Arguments
    /// -----------------
    /// * `residual`, `sigma`: measured residual and its uncertainty.
    /// * `local`: derivatives w.r.t. the local parameters, in local-index order.
    /// * `global`: `(label, derivative)` pairs.
    pub fn add_measurement(
        &mut self,
        residual: f64,
        sigma: f64,
        local: &[f64],
        global: &[(Label, f64)],
    ) {
        self.push(residual, 0);
        for (i, &d) in local.iter().enumerate() {
            if d != 0.0 {
                self.push(d, (i + 1) as i32);
            }
        }
        self.push(sigma, 0);
        for &(label, d) in global {
            if d != 0.0 {
                self.push(d, label);
            }
        }
    }

    fn push(&mut self, value: f64, index: i32) {
        self.floats.push(value as f32);
        self.ints.push(index);
    }

    /// Number of words, including the leading pair.
    pub fn len(&self) -> usize {
        self.floats.len()
    }

    /// `true` if no measurement was added.
    pub fn is_empty(&self) -> bool {
        self.floats.len() <= 1
    }

    /// Serialized size in bytes.
    pub fn byte_size(&self) -> usize {
        4 + 8 * self.len()
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<(), AlignError> {
        let nr = (2 * self.len()) as i32;
        out.write_all(&nr.to_le_bytes())?;
        for f in &self.floats {
            out.write_all(&f.to_le_bytes())?;
        }
        for i in &self.ints {
            out.write_all(&i.to_le_bytes())?;
        }
        Ok(())
    }

    /// Split the word stream back into measurements.
    pub fn measurements(&self) -> Vec<Measurement> {
        let mut out = Vec::new();
        let mut i = 1;
        let n = self.len();
        while i < n {
            let residual = self.floats[i];
            i += 1;
            let mut local = Vec::new();
            while i < n && self.ints[i] != 0 {
                local.push((self.ints[i] as u32, self.floats[i]));
                i += 1;
            }
            let sigma = self.floats.get(i).copied().unwrap_or_default();
            i += 1;
            let mut global = Vec::new();
            while i < n && self.ints[i] != 0 {
                global.push((self.ints[i], self.floats[i]));
                i += 1;
            }
            out.push(Measurement {
                residual,
                sigma,
                local,
                global,
            });
        }
        out
    }

    /// Every global label referenced by the record.
    pub fn labels(&self) -> impl Iterator<Item = Label> + '_ {
        self.measurements()
            .into_iter()
            .flat_map(|m| m.global.into_iter().map(|(label, _)| label))
    }
}

fn parse_record(input: &[u8]) -> IResult<&[u8], MilleRecord> {
    let (input, nr) = le_i32(input)?;
    if nr < 2 || nr % 2 != 0 {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    let n = (nr / 2) as usize;
    let (input, floats) = count(le_f32::<_, nom::error::Error<_>>, n).parse(input)?;
    let (input, ints) = count(le_i32::<_, nom::error::Error<_>>, n).parse(input)?;
    Ok((input, MilleRecord { floats, ints }))
}

/// Parse every record of a binary buffer.
///
/// Return
/// ----------
/// * The records, or [`AlignError::MilleFormat`] naming the byte offset of the
///   first record that could not be read.
pub fn read_records(bytes: &[u8]) -> Result<Vec<MilleRecord>, AlignError> {
    let mut records = Vec::new();
    let mut input = bytes;
    while !input.is_empty() {
        let offset = bytes.len() - input.len();
        let (rest, record) = parse_record(input).map_err(|_| {
            AlignError::MilleFormat(format!("truncated or invalid record at byte {offset}"))
        })?;
        records.push(record);
        input = rest;
    }
    Ok(records)
}

/// Read every record of a binary file.
pub fn read_file(path: &Utf8Path) -> Result<Vec<MilleRecord>, AlignError> {
    let bytes = std::fs::read(path)?;
    read_records(&bytes)
}

/// Writer splitting records over files `<prefix>_<index>.dat` in a directory.
#[derive(Debug)]
pub struct MilleBinary {
    dir: Utf8PathBuf,
    prefix: String,
    records_per_file: usize,
    current: Option<BufWriter<File>>,
    in_current: usize,
    files: Vec<Utf8PathBuf>,
    n_records: usize,
}

impl MilleBinary {
    /// Arguments
    /// -----------------
    /// * `dir`: output directory (must exist).
    /// * `prefix`: file name prefix.
    /// * `records_per_file`: records before rolling over to a new file (`> 0`).
    pub fn new(
        dir: &Utf8Path,
        prefix: &str,
        records_per_file: usize,
    ) -> Result<Self, AlignError> {
        if records_per_file == 0 {
            return Err(AlignError::InvalidAlgorithmParameter(
                "records per file must be positive".into(),
            ));
        }
        Ok(MilleBinary {
            dir: dir.to_owned(),
            prefix: prefix.to_string(),
            records_per_file,
            current: None,
            in_current: 0,
            files: Vec::new(),
            n_records: 0,
        })
    }

    /// Write one record; empty records are skipped.
    pub fn write_record(&mut self, record: &MilleRecord) -> Result<(), AlignError> {
        if record.is_empty() {
            return Ok(());
        }
        if self.current.is_none() || self.in_current >= self.records_per_file {
            self.roll()?;
        }
        if let Some(out) = self.current.as_mut() {
            record.write_to(out)?;
        }
        self.in_current += 1;
        self.n_records += 1;
        Ok(())
    }

    fn roll(&mut self) -> Result<(), AlignError> {
        if let Some(mut out) = self.current.take() {
            out.flush()?;
        }
        let path = self
            .dir
            .join(format!("{}_{:03}.dat", self.prefix, self.files.len()));
        debug!(path = %path, "opening mille binary");
        self.current = Some(BufWriter::new(File::create(&path)?));
        self.files.push(path);
        self.in_current = 0;
        Ok(())
    }

    pub fn n_records(&self) -> usize {
        self.n_records
    }

    pub fn files(&self) -> &[Utf8PathBuf] {
        &self.files
    }

    /// Flush the last file and return every file written, in order.
    pub fn close(mut self) -> Result<Vec<Utf8PathBuf>, AlignError> {
        if let Some(mut out) = self.current.take() {
            out.flush()?;
        }
        info!(
            records = self.n_records,
            files = self.files.len(),
            "mille binaries closed"
        );
        Ok(self.files)
    }
}

/// Collected calibration input: records still in memory plus binary files that a
/// collection job already wrote.
#[derive(Debug, Clone, Default)]
pub struct MilleData {
    records: Vec<MilleRecord>,
    files: Vec<Utf8PathBuf>,
}

impl MilleData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: MilleRecord) {
        self.records.push(record);
    }

    pub fn add_file(&mut self, path: impl Into<Utf8PathBuf>) {
        self.files.push(path.into());
    }

    pub fn records(&self) -> &[MilleRecord] {
        &self.records
    }

    pub fn files(&self) -> &[Utf8PathBuf] {
        &self.files
    }

    /// Non-empty in-memory records.
    pub fn n_usable_records(&self) -> usize {
        self.records.iter().filter(|r| !r.is_empty()).count()
    }
}

impl FromIterator<MilleRecord> for MilleData {
    fn from_iter<T: IntoIterator<Item = MilleRecord>>(iter: T) -> Self {
        MilleData {
            records: iter.into_iter().collect(),
            files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod test_mille {
    use super::*;

    fn track() -> MilleRecord {
        let mut record = MilleRecord::new();
        record.add_measurement(0.5, 0.01, &[1.0, 0.0, 2.0], &[(100_000_101, 1.0), (7, 0.0)]);
        record.add_measurement(-0.25, 0.02, &[], &[(1_000_000_000, -1.5)]);
        record
    }

    #[test]
    fn test_word_layout() {
        let record = track();
        let mut bytes = Vec::new();
        record.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), record.byte_size());

        // lead + (res, 2 locals, sigma, 1 global) + (res, sigma, 1 global)
        assert_eq!(record.len(), 1 + 5 + 3);
        assert_eq!(&bytes[0..4], &18i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0.0f32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0.5f32.to_le_bytes());
        let ints_start = 4 + 4 * record.len();
        assert_eq!(&bytes[ints_start..ints_start + 4], &0i32.to_le_bytes());
        assert_eq!(&bytes[ints_start + 8..ints_start + 12], &1i32.to_le_bytes());
        assert_eq!(&bytes[ints_start + 12..ints_start + 16], &3i32.to_le_bytes());
    }

    #[test]
    fn test_measurements_decode() {
        let m = track().measurements();
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].local, vec![(1, 1.0), (3, 2.0)]);
        assert_eq!(m[0].global, vec![(100_000_101, 1.0)]);
        assert_eq!(m[1].sigma, 0.02);
        assert_eq!(track().labels().collect::<Vec<_>>(), vec![100_000_101, 1_000_000_000]);
    }

    #[test]
    fn test_read_truncated() {
        let mut bytes = Vec::new();
        track().write_to(&mut bytes).unwrap();
        track().write_to(&mut bytes).unwrap();
        assert_eq!(read_records(&bytes).unwrap(), vec![track(), track()]);

        let cut = bytes.len() - 3;
        assert!(matches!(
            read_records(&bytes[..cut]),
            Err(AlignError::MilleFormat(_))
        ));
        assert!(read_records(&3i32.to_le_bytes()).is_err());
    }

    #[test]
    fn test_binary_rolls_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let mut writer = MilleBinary::new(&dir, "mille", 2).unwrap();
        for _ in 0..5 {
            writer.write_record(&track()).unwrap();
        }
        writer.write_record(&MilleRecord::new()).unwrap();
        assert_eq!(writer.n_records(), 5);
        let files = writer.close().unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[0].as_str().ends_with("mille_000.dat"));
        assert_eq!(read_file(&files[2]).unwrap().len(), 1);
        assert!(MilleBinary::new(&dir, "x", 0).is_err());
    }
}
