#![allow(dead_code)]

use camino::{Utf8Path, Utf8PathBuf};
use millealign::{
    algorithm::{AlgorithmParams, AlgorithmParamsBuilder},
    mille::{MilleData, MilleRecord},
    payloads::{
        conditions::{InMemoryConditions, IntervalOfValidity},
        rigid_body, BeamSpot, CalibrationConstMap, Component, Payload,
    },
    timeline::EventKey,
};

/// Beam-spot x, y, z labels.
pub const BS_X: i32 = 10_000_001;
pub const BS_Y: i32 = 10_000_002;
pub const BS_Z: i32 = 10_000_003;

pub fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

/// Conditions with an open-ended beam spot at `(0.1, 0.2, 0.3)` and a
/// VXD alignment for sensors 1 and 2.
pub fn seeded_store() -> InMemoryConditions {
    let mut store = InMemoryConditions::new();
    let iov = IntervalOfValidity::new(EventKey::origin(), None);
    store.insert(Payload::BeamSpot(BeamSpot::new(0.1, 0.2, 0.3)), iov);
    let mut map = CalibrationConstMap::new();
    for element in [1, 2] {
        for param in rigid_body::PARAMS {
            map.insert(element, param, 0.0);
        }
    }
    store.insert(Payload::ConstMap(Component::VxdAlignment, map), iov);
    store
}

/// `n` records, each with one beam-spot measurement.
pub fn beam_spot_data(n: usize) -> MilleData {
    (0..n)
        .map(|i| {
            let mut record = MilleRecord::new();
            record.add_measurement(
                0.01 * i as f64,
                0.005,
                &[1.0, 0.5],
                &[(BS_X, 1.0), (BS_Y, -1.0), (BS_Z, 0.25)],
            );
            record
        })
        .collect()
}

/// Builder preset for solver tests: beam spot only, no statistics threshold.
pub fn params(work_dir: &Utf8Path, pede: &Utf8Path) -> AlgorithmParamsBuilder {
    AlgorithmParams::builder()
        .components(&["BeamSpot"])
        .min_entries(-1)
        .work_dir(work_dir)
        .pede_executable(pede)
}

/// Shell script standing in for `pede`: it checks that it got the steering file,
/// writes `res` as `millepede.res` and `end` as `millepede.end`, then exits with
/// `exit_code`.
#[cfg(unix)]
pub fn fake_pede(dir: &Utf8Path, res: &str, end: Option<&str>, exit_code: i32) -> Utf8PathBuf {
    let end = end
        .map(|e| format!("echo '{e}' > millepede.end\n"))
        .unwrap_or_default();
    let script = format!(
        "#!/bin/sh\ntest -f \"$1\" || exit 7\ncp \"$1\" steering.seen\ncat > millepede.res <<'EOF'\n{res}EOF\n{end}exit {exit_code}\n"
    );
    write_script(dir, "fake_pede.sh", &script)
}

/// Script that never finishes on its own.
#[cfg(unix)]
pub fn sleeping_pede(dir: &Utf8Path) -> Utf8PathBuf {
    write_script(dir, "sleeping_pede.sh", "#!/bin/sh\nsleep 30\n")
}

#[cfg(unix)]
fn write_script(dir: &Utf8Path, name: &str, text: &str) -> Utf8PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, text).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}
