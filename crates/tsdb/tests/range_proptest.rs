//! Property-based tests for range reads.
//!
//! Rows are written with arbitrary flush points and a small fragment limit so
//! that ranges regularly span, start inside, and end inside fragments.

use alopex_chronofile::{DatabaseConfig, FormatVersion, SyncMode, TimeSeriesDatabase};
use proptest::prelude::*;
use std::time::Duration;
use tempfile::TempDir;

/// Non-decreasing timestamps (duplicates allowed) with a value and a flag
/// saying whether to flush after the row.
fn rows_strategy() -> impl Strategy<Value = Vec<(i64, i64, bool)>> {
    (
        -1_000_000i64..1_000_000,
        prop::collection::vec((0i64..500, -(1i64 << 40)..(1i64 << 40), any::<bool>()), 0..60),
    )
        .prop_map(|(start, deltas)| {
            let mut ts = start;
            deltas
                .into_iter()
                .map(|(delta, value, flush)| {
                    ts += delta;
                    (ts, value, flush)
                })
                .collect()
        })
}

fn version_strategy() -> impl Strategy<Value = FormatVersion> {
    prop_oneof![Just(FormatVersion::V1), Just(FormatVersion::V2)]
}

fn config(version: FormatVersion) -> DatabaseConfig {
    DatabaseConfig::new(SyncMode::None, Duration::from_millis(200))
        .with_format_version(version)
        .with_max_rows_per_fragment(4)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A range read returns exactly the written rows inside [from, to], in
    /// insertion order, whether or not they have been flushed.
    #[test]
    fn test_range_read_matches_model(
        rows in rows_strategy(),
        version in version_strategy(),
        a in -1_100_000i64..1_100_000,
        b in -1_100_000i64..1_100_000,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let db = TimeSeriesDatabase::open_with_config(temp_dir.path().join("p.tsdb"), b"", config(version)).unwrap();
        db.add_column_group("g", b"", 1, &["v", "neg"], &[]).unwrap();

        for &(ts, value, flush) in &rows {
            db.write(ts, "g", &[value, -value]).unwrap();
            if flush {
                db.flush().unwrap();
            }
        }

        let (from, to) = if a <= b { (a, b) } else { (b, a) };
        let expected: Vec<(i64, Vec<i64>)> = rows
            .iter()
            .filter(|(ts, _, _)| (from..=to).contains(ts))
            .map(|&(ts, value, _)| (ts, vec![value, -value]))
            .collect();

        let got = db.read("g", from, to).unwrap();
        let got: Vec<(i64, Vec<i64>)> = got.iter().map(|(ts, row)| (ts, row.to_vec())).collect();
        prop_assert_eq!(got, expected);

        // Inverted bounds never match.
        if from < to {
            prop_assert!(db.read("g", to, from).unwrap().is_empty());
        }
    }

    /// Everything written survives close and reopen unchanged.
    #[test]
    fn test_roundtrip_after_reopen(rows in rows_strategy(), version in version_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("r.tsdb");

        let before = {
            let db = TimeSeriesDatabase::open_with_config(&path, b"meta", config(version)).unwrap();
            db.add_column_group("g", b"", 1, &["v"], &[]).unwrap();
            for &(ts, value, flush) in &rows {
                db.write(ts, "g", &[value]).unwrap();
                if flush {
                    db.flush().unwrap();
                }
            }
            let before = db.read("g", i64::MIN, i64::MAX).unwrap();
            db.close().unwrap();
            before
        };

        let db = TimeSeriesDatabase::open_with_config(&path, b"", config(FormatVersion::V2)).unwrap();
        prop_assert_eq!(db.header().unwrap().version, version);
        let after = db.read("g", i64::MIN, i64::MAX).unwrap();
        prop_assert_eq!(after.len(), rows.len());
        prop_assert_eq!(after, before);
    }
}
