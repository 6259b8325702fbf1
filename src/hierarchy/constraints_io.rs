//! Text persistence of constraint maps.
//!
//! Two formats are written:
//!
//! * the **dump** format, one constraint per line, read back by [`read_constraints`]
//!   so that the collection and the fitting jobs share the same constraints:
//!
//! ```text
//! <constraint label> <value> <label>:<coefficient> <label>:<coefficient> ...
//! ```
//!
//! * the **Millepede** format handed to the solver through the steering file:
//!
//! ```text
//! Constraint 0
//! 100000101 1
//! 100000201 1
//! ```
//!
//! Floating point values are written with the shortest representation that
//! parses back to the same `f64`.
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
};

use camino::Utf8Path;
use nom::{
    character::complete::{char, i32 as label_i32, space0, space1, u64 as label_u64},
    combinator::all_consuming,
    multi::many0,
    number::complete::double,
    sequence::{preceded, separated_pair, terminated},
    IResult, Parser,
};
use tracing::debug;

use crate::{align_errors::AlignError, constants::Label};

use super::{Constraint, Constraints};

/// Write `constraints` in the dump format.
pub fn write_constraints(constraints: &Constraints, path: &Utf8Path) -> Result<(), AlignError> {
    let mut out = BufWriter::new(File::create(path)?);
    for (clabel, constraint) in constraints {
        write!(out, "{clabel} {}", constraint.value)?;
        for (label, coefficient) in constraint.entries() {
            write!(out, " {label}:{coefficient}")?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    debug!(path = %path, n = constraints.len(), "constraints written");
    Ok(())
}

fn parse_term(input: &str) -> IResult<&str, (Label, f64)> {
    preceded(space1, separated_pair(label_i32, char(':'), double)).parse(input)
}

fn parse_constraint_line(input: &str) -> IResult<&str, (u64, f64, Vec<(Label, f64)>)> {
    all_consuming(terminated(
        (label_u64, preceded(space1, double), many0(parse_term)),
        space0,
    ))
    .parse(input)
}

/// Read a constraint map written by [`write_constraints`].
///
/// Blank lines are ignored; any other malformed line is an
/// [`AlignError::ConstraintParsing`] naming the line number.
pub fn read_constraints(path: &Utf8Path) -> Result<Constraints, AlignError> {
    let reader = BufReader::new(File::open(path)?);
    let mut constraints = Constraints::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (_, (clabel, value, terms)) = parse_constraint_line(trimmed).map_err(|e| {
            AlignError::ConstraintParsing(format!("{path}:{}: {e}", line_no + 1))
        })?;
        let mut constraint = Constraint::new(value);
        for (label, coefficient) in terms {
            constraint.add(label, coefficient);
        }
        constraints.insert(clabel, constraint);
    }
    Ok(constraints)
}

/// Write `constraints` in the Millepede constraint-file format.
pub fn write_pede_constraints(
    constraints: &Constraints,
    path: &Utf8Path,
) -> Result<(), AlignError> {
    let mut out = BufWriter::new(File::create(path)?);
    for (clabel, constraint) in constraints {
        writeln!(out, "! constraint {clabel}")?;
        writeln!(out, "Constraint {}", constraint.value)?;
        for (label, coefficient) in constraint.entries() {
            writeln!(out, "{label} {coefficient}")?;
        }
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod test_constraints_io {
    use super::*;
    use camino::Utf8PathBuf;

    fn sample() -> Constraints {
        let mut first = Constraint::new(0.0);
        first.add(100_000_101, 1.0);
        first.add(100_000_201, -0.1);
        first.add(1_000_000_002, 1.0 / 3.0);
        let mut second = Constraint::new(2.5e-7);
        second.add(10_000_001, 1.0);
        Constraints::from([(1, first), (7, second)])
    }

    #[test]
    fn test_dump_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("constraints.txt")).unwrap();
        write_constraints(&sample(), &path).unwrap();
        assert_eq!(read_constraints(&path).unwrap(), sample());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_constraint_line("3 0 100:1.0").is_ok());
        assert!(parse_constraint_line("3 0 100;1.0").is_err());
        assert!(parse_constraint_line("x 0").is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("bad.txt")).unwrap();
        std::fs::write(&path, "1 0 5:1\n\n2 zero\n").unwrap();
        let err = read_constraints(&path).unwrap_err();
        assert!(matches!(err, AlignError::ConstraintParsing(ref msg) if msg.contains(":3:")));
    }

    #[test]
    fn test_pede_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("pede.txt")).unwrap();
        write_pede_constraints(&sample(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "! constraint 1");
        assert_eq!(lines[1], "Constraint 0");
        assert_eq!(lines[2], "100000101 1");
        assert_eq!(text.matches("Constraint ").count(), 2);
    }
}
