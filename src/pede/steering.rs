//! Steering file of the Millepede solver.
//!
//! ```text
//! Cfiles
//! /work/mille_000.dat
//! /work/mille_001.dat
//! /work/constraints.txt
//!
//! method inversion 3 0.1
//! skipemptyrecords
//! printcounts
//! ```
//!
//! Input files keep their insertion order: the solver sums records in file order.
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
};

use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use tracing::debug;

use crate::{align_errors::AlignError, constants::PEDE_STEERING_FILE};

/// Directives written when nothing else is configured.
pub const DEFAULT_COMMANDS: [&str; 3] = ["method inversion 3 0.1", "skipemptyrecords", "printcounts"];

#[derive(Debug, Clone, PartialEq)]
pub struct PedeSteering {
    path: Utf8PathBuf,
    files: Vec<Utf8PathBuf>,
    commands: Vec<String>,
}

impl Default for PedeSteering {
    fn default() -> Self {
        PedeSteering::new(PEDE_STEERING_FILE)
    }
}

impl PedeSteering {
    /// Steering written to `path`, with the default directives.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        PedeSteering {
            path: path.into(),
            files: Vec::new(),
            commands: DEFAULT_COMMANDS.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<Utf8PathBuf>) {
        self.path = path.into();
    }

    /// Append a solver directive.
    pub fn command(&mut self, command: impl Into<String>) -> &mut Self {
        self.commands.push(command.into());
        self
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Append an input file; a file already listed is not added twice.
    pub fn add_file(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        let path = path.into();
        if !self.files.contains(&path) {
            self.files.push(path);
        }
        self
    }

    pub fn clear_files(&mut self) {
        self.files.clear();
    }

    pub fn files(&self) -> &[Utf8PathBuf] {
        &self.files
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Replace files and directives with those of an existing steering file.
    ///
    /// Lines after `Cfiles` up to the first blank line are input files, any other
    /// non-comment line is a directive.
    pub fn import(&mut self, path: &Utf8Path) -> Result<(), AlignError> {
        let reader = BufReader::new(File::open(path)?);
        let mut files = Vec::new();
        let mut commands = Vec::new();
        let mut in_files = false;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                in_files = false;
                continue;
            }
            if line.starts_with('!') {
                continue;
            }
            if line.eq_ignore_ascii_case("cfiles") {
                in_files = true;
            } else if in_files {
                files.push(Utf8PathBuf::from(line));
            } else {
                commands.push(line.to_string());
            }
        }

        self.files = files;
        self.commands = commands;
        Ok(())
    }

    /// Write the steering file.
    ///
    /// Return
    /// ----------
    /// * The path of the written file.
    pub fn make(&self) -> Result<Utf8PathBuf, AlignError> {
        let mut out = BufWriter::new(File::create(&self.path)?);
        writeln!(out, "Cfiles")?;
        for file in &self.files {
            writeln!(out, "{file}")?;
        }
        writeln!(out)?;
        writeln!(out, "{}", self.commands.iter().join("\n"))?;
        out.flush()?;
        debug!(
            path = %self.path,
            files = self.files.len(),
            commands = self.commands.len(),
            "steering written"
        );
        Ok(self.path.clone())
    }
}
