//! End-to-end verification scenarios over the programs/ corpus.

use oox_engine::{Configuration, VerificationResult};
use std::path::PathBuf;

fn programs_dir() -> PathBuf {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    PathBuf::from(manifest_dir)
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("programs")
}

fn verify_program(
    relative: &str,
    entry: &str,
    depth: u64,
    configure: impl FnOnce(&mut Configuration),
) -> VerificationResult {
    let path = programs_dir().join(relative);
    let source = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("cannot read {}: {}", path.display(), e));
    let unit = oox_syntax::parse(&source).expect("program parses");
    let (cfg, symbols) = oox_cfg::build(&unit).expect("cfg builds");
    let mut config = Configuration {
        file_name: path,
        entry_point: entry.to_string(),
        maximum_depth: depth,
        ..Configuration::default()
    };
    configure(&mut config);
    oox_engine::verify(&cfg, &symbols, &config)
        .expect("engine runs")
        .result
}

fn is_invalid(result: &VerificationResult) -> bool {
    matches!(result, VerificationResult::Invalid { .. })
}

#[test]
fn simple1_m1_is_valid() {
    let result = verify_program("simple/simple1.oox", "SomeClass.m1", 30, |_| {});
    assert!(result.is_valid(), "got {}", result);
}

#[test]
fn simple1_m1_invalid_is_invalid() {
    let result = verify_program("simple/simple1.oox", "SomeClass.m1Invalid", 30, |_| {});
    assert!(is_invalid(&result), "got {}", result);
}

#[test]
fn simple1_m3_invalid_is_invalid() {
    let result = verify_program("simple/simple1.oox", "SomeClass.m3Invalid", 100, |config| {
        config.symbolic_array_size = 4;
    });
    assert!(is_invalid(&result), "got {}", result);
}

#[test]
fn concursimple1_m2_is_valid() {
    let result = verify_program("simple/concursimple1.oox", "Main.m2", 200, |config| {
        config.apply_por = true;
    });
    assert!(result.is_valid(), "got {}", result);
}

#[test]
fn concursimple1_m3_invalid1_is_invalid() {
    let result = verify_program(
        "simple/concursimple1.oox",
        "Main.m3_invalid1",
        300,
        |config| {
            config.apply_por = true;
        },
    );
    assert!(is_invalid(&result), "got {}", result);
}

#[test]
fn locks1_main_is_valid() {
    let result = verify_program("simple/locks1.oox", "Main.main", 50, |config| {
        config.apply_por = true;
    });
    assert!(result.is_valid(), "got {}", result);
}

#[test]
fn deadlock_main_deadlocks() {
    let result = verify_program("simple/deadlock.oox", "Main.main", 50, |config| {
        config.apply_por = true;
    });
    assert_eq!(result, VerificationResult::Deadlock);
}

#[test]
fn philosophers_main_deadlocks() {
    let result = verify_program("philosophers.oox", "Main.main", 200, |config| {
        config.apply_por = true;
    });
    assert_eq!(result, VerificationResult::Deadlock);
}

// Partial-order reduction must not change verdicts.
#[test]
fn por_is_verdict_preserving() {
    for (program, entry, depth) in [
        ("simple/deadlock.oox", "Main.main", 50u64),
        ("simple/concursimple1.oox", "Main.m2", 200),
        ("simple/concursimple1.oox", "Main.m3_invalid1", 300),
    ] {
        let with_por = verify_program(program, entry, depth, |c| c.apply_por = true);
        let without_por = verify_program(program, entry, depth, |c| c.apply_por = false);
        assert_eq!(
            std::mem::discriminant(&with_por),
            std::mem::discriminant(&without_por),
            "{} {} diverged: {} vs {}",
            program,
            entry,
            with_por,
            without_por
        );
    }
}

// Two runs without random interleaving produce the same verdict.
#[test]
fn verdicts_are_deterministic() {
    let first = verify_program("simple/concursimple1.oox", "Main.m2", 200, |_| {});
    let second = verify_program("simple/concursimple1.oox", "Main.m2", 200, |_| {});
    assert_eq!(first, second);
}

// Raising the depth bound cannot lose an Invalid verdict.
#[test]
fn invalid_is_depth_monotonic() {
    let shallow = verify_program("simple/simple1.oox", "SomeClass.m1Invalid", 30, |_| {});
    let deep = verify_program("simple/simple1.oox", "SomeClass.m1Invalid", 90, |_| {});
    assert!(is_invalid(&shallow));
    assert!(is_invalid(&deep));
}

// Depth 0 explores nothing and is vacuously valid.
#[test]
fn depth_zero_is_vacuously_valid() {
    let result = verify_program("simple/simple1.oox", "SomeClass.m1Invalid", 0, |_| {});
    assert!(result.is_valid());
}

// A zero-length symbolic array makes every element access infeasible.
#[test]
fn zero_size_symbolic_array_prunes_accesses() {
    let result = verify_program("simple/simple1.oox", "SomeClass.m3Invalid", 100, |config| {
        config.symbolic_array_size = 0;
    });
    assert!(result.is_valid(), "got {}", result);
}
