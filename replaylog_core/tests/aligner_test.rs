// Global ordering and cursor behavior of the stream aligner
use std::path::Path;

use replaylog_core::{
    LogConfig, LogWriter, Logfiles, NullProgress, Position, ReplayResult, StreamAligner, Time,
};
use tempfile::{tempdir, TempDir};

/// Records one stream per `(name, times in ms)` pair. Payloads read `name@ms`.
fn recording(dir: &Path, file: &str, streams: &[(&str, &[i64])]) -> Logfiles {
    let mut writer = LogWriter::create(dir.join(file)).unwrap();
    for (name, times) in streams {
        let handle = writer.create_stream(name, "/int").unwrap();
        for &ms in times.iter() {
            let t = Time::from_millis(ms);
            writer
                .write_sample(handle, t, t, format!("{}@{}", name, ms).as_bytes())
                .unwrap();
        }
    }
    let paths = writer.finish().unwrap();
    Logfiles::open_with(&paths, &LogConfig::default(), &NullProgress).unwrap()
}

/// `(stream name, time in ms)` for every global ordinal
fn global_order(aligner: &StreamAligner) -> Vec<(String, i64)> {
    let base = aligner.base_time().unwrap_or_default();
    aligner
        .entries()
        .iter()
        .map(|e| {
            let name = aligner.stream(e.stream).unwrap().name().to_string();
            (name, (base.as_micros() + e.time) / 1000)
        })
        .collect()
}

fn labels(order: &[(&str, i64)]) -> Vec<(String, i64)> {
    order.iter().map(|(n, t)| (n.to_string(), *t)).collect()
}

fn fixture() -> (TempDir, Logfiles) {
    let dir = tempdir().unwrap();
    let logs = recording(
        dir.path(),
        "fixture",
        &[("S0", &[0, 1000, 2000]), ("S1", &[500, 1500])],
    );
    (dir, logs)
}

#[test]
fn test_ties_follow_supply_order() {
    let dir = tempdir().unwrap();
    let logs = recording(dir.path(), "ties", &[("A", &[1000, 3000]), ("B", &[2000, 3000])]);
    let a = logs.stream("A").unwrap();
    let b = logs.stream("B").unwrap();

    let aligner = StreamAligner::new(vec![a.clone(), b.clone()]).unwrap();
    assert_eq!(
        global_order(&aligner),
        labels(&[("A", 1000), ("B", 2000), ("A", 3000), ("B", 3000)])
    );

    // Supplying B first flips the tie, not the rest
    let aligner = StreamAligner::new(vec![b, a]).unwrap();
    assert_eq!(
        global_order(&aligner),
        labels(&[("A", 1000), ("B", 2000), ("B", 3000), ("A", 3000)])
    );
}

#[test]
fn test_step_back_then_advance_is_identity() -> ReplayResult<()> {
    let (_dir, logs) = fixture();
    let mut aligner = StreamAligner::new(logs.streams().to_vec())?;

    for i in 1..aligner.size() - 1 {
        let at = aligner.seek_to_pos(i, false)?.unwrap();
        aligner.step_back()?;
        let back = aligner.advance()?.unwrap();
        assert_eq!(aligner.position(), Position::At(i));
        assert_eq!(back, at);
        assert_eq!(aligner.single_data(back.stream).unwrap().time, at.time);
    }
    Ok(())
}

#[test]
fn test_boundaries_are_idempotent() -> ReplayResult<()> {
    let (_dir, logs) = fixture();
    let mut aligner = StreamAligner::new(logs.streams().to_vec())?;

    aligner.seek_to_pos(0, false)?;
    for _ in 0..3 {
        assert!(aligner.step_back()?.is_none());
        assert!(aligner.is_before_start());
    }
    assert_eq!(aligner.advance()?.unwrap().global, 0);

    aligner.seek_to_pos(aligner.size() - 1, false)?;
    for _ in 0..3 {
        assert!(aligner.advance()?.is_none());
        assert!(aligner.is_eof());
    }
    assert_eq!(aligner.step_back()?.unwrap().global, aligner.size() - 1);
    Ok(())
}

#[test]
fn test_seek_to_time_scenario() -> ReplayResult<()> {
    let (_dir, logs) = fixture();
    let mut aligner = StreamAligner::new(logs.streams().to_vec())?;
    assert_eq!(aligner.size(), 5);

    // Exact hit on S0
    let step = aligner.seek_to_time(Time::from_secs(1), true)?;
    assert_eq!((step.global, step.stream, step.ordinal), (2, 0, 1));
    assert_eq!(step.time, Time::from_secs(1));
    assert_eq!(step.sample.unwrap().data, b"S0@1000");

    // Between samples: first entry at or after the query
    let step = aligner.seek_to_time(Time::from_millis(1200), true)?;
    assert_eq!((step.global, step.stream, step.ordinal), (3, 1, 1));
    assert_eq!(step.sample.unwrap().data, b"S1@1500");

    assert!(aligner
        .seek_to_time(Time::from_millis(2500), true)
        .unwrap_err()
        .is_out_of_range());
    Ok(())
}

#[test]
fn test_add_streams_keeps_current_sample() -> ReplayResult<()> {
    let (dir, logs) = fixture();
    let extra = recording(dir.path(), "extra", &[("S2", &[100, 200, 1800])]);
    let mut aligner = StreamAligner::new(logs.streams().to_vec())?;

    let before = aligner.seek_to_pos(3, true)?.unwrap();
    assert!(aligner.add_streams(extra.streams().to_vec())?.is_none());

    let Position::At(moved) = aligner.position() else {
        panic!("cursor lost its sample");
    };
    assert_eq!(moved, 5);
    let after = aligner.seek_to_pos(moved, true)?.unwrap();
    assert_eq!(
        (after.stream, after.time, after.sample),
        (before.stream, before.time, before.sample)
    );
    assert_eq!(aligner.stream_count(), 3);
    Ok(())
}

#[test]
fn test_add_streams_at_eof() -> ReplayResult<()> {
    let (dir, logs) = fixture();
    let later = recording(dir.path(), "later", &[("S2", &[1000, 2000, 2500, 3000])]);
    let mut aligner = StreamAligner::new(logs.streams().to_vec())?;

    aligner.seek_to_pos(aligner.size(), false)?;
    assert!(aligner.is_eof());

    // S2@2000 ties with the previous last sample and sorts after it
    let step = aligner.add_streams(later.streams().to_vec())?.unwrap();
    assert_eq!(step.stream, 2);
    assert_eq!(step.time, Time::from_millis(2000));
    assert_eq!(step.global, 6);
    assert_eq!(step.sample.unwrap().data, b"S2@2000");

    // Nothing after the previous end: stays at EOF
    let earlier = recording(dir.path(), "earlier", &[("S3", &[700])]);
    aligner.seek_to_pos(aligner.size(), false)?;
    assert!(aligner.add_streams(earlier.streams().to_vec())?.is_none());
    assert!(aligner.is_eof());
    Ok(())
}

#[test]
fn test_add_streams_keeps_base_time() -> ReplayResult<()> {
    let dir = tempdir().unwrap();
    let late = recording(dir.path(), "late", &[("L", &[5000, 6000])]);
    let early = recording(dir.path(), "early", &[("E", &[1000])]);
    let mut aligner = StreamAligner::new(late.streams().to_vec())?;
    assert_eq!(aligner.base_time(), Some(Time::from_secs(5)));

    aligner.add_streams(early.streams().to_vec())?;
    assert_eq!(aligner.base_time(), Some(Time::from_secs(5)));
    assert_eq!(aligner.entry(0).unwrap().time, -4_000_000);
    assert_eq!(
        aligner.interval(),
        Some((Time::from_secs(1), Time::from_secs(6)))
    );
    Ok(())
}

#[test]
fn test_remove_streams_keeps_base_time() -> ReplayResult<()> {
    let dir = tempdir().unwrap();
    let logs = recording(
        dir.path(),
        "three",
        &[("S0", &[1000, 2000, 3000]), ("S1", &[1500, 2500]), ("S2", &[500, 4000])],
    );
    let streams = logs.streams().to_vec();

    let subsets: &[&[usize]] = &[&[0], &[1], &[2], &[0, 1], &[0, 2], &[1, 2]];
    for subset in subsets {
        let mut aligner = StreamAligner::new(streams.clone())?;
        assert_eq!(aligner.base_time(), Some(Time::from_millis(500)));
        aligner.seek_to_pos(3, false)?;
        let victims: Vec<_> = subset.iter().map(|&i| streams[i].clone()).collect();
        aligner.remove_streams(&victims)?;

        assert_eq!(aligner.base_time(), Some(Time::from_millis(500)));
        assert_eq!(aligner.stream_count(), 3 - subset.len());
        let globals: Vec<usize> = aligner.entries().iter().map(|e| e.global).collect();
        assert_eq!(globals, (0..aligner.size()).collect::<Vec<_>>());
        assert!(aligner.entries().iter().all(|e| e.stream < aligner.stream_count()));
    }
    Ok(())
}

#[test]
fn test_remove_current_stream_moves_forward() -> ReplayResult<()> {
    let (_dir, logs) = fixture();
    let s0 = logs.stream("S0").unwrap();
    let s1 = logs.stream("S1").unwrap();

    // On S1@500, removing S1 lands on S0@1000
    let mut aligner = StreamAligner::new(vec![s0.clone(), s1.clone()])?;
    aligner.seek_to_pos(1, false)?;
    let step = aligner.remove_streams(&[s1.clone()])?.unwrap();
    assert_eq!((step.global, step.stream, step.time), (1, 0, Time::from_secs(1)));
    assert_eq!(aligner.position(), Position::At(1));

    // On S0@1000, removing S1 keeps the cursor on the same sample
    let mut aligner = StreamAligner::new(vec![s1.clone(), s0.clone()])?;
    aligner.seek_to_pos(2, false)?;
    assert!(aligner.remove_streams(&[s1.clone()])?.is_none());
    assert_eq!(aligner.position(), Position::At(1));
    assert_eq!(aligner.entry(1).unwrap().stream, 0);

    // On S0@2000 (the last sample), removing S0 leaves nothing after it
    let mut aligner = StreamAligner::new(vec![s0.clone(), s1])?;
    aligner.seek_to_pos(4, false)?;
    assert!(aligner.remove_streams(&[s0])?.is_none());
    assert!(aligner.is_eof());
    Ok(())
}

#[test]
fn test_remove_current_stream_lands_on_tie() -> ReplayResult<()> {
    let dir = tempdir().unwrap();
    let logs = recording(dir.path(), "tie", &[("A", &[1000, 2000]), ("B", &[1000])]);
    let a = logs.stream("A").unwrap();
    let b = logs.stream("B").unwrap();

    // A@1000 sorts before B@1000; removing B from under the cursor goes back to it
    let mut aligner = StreamAligner::new(vec![a, b.clone()])?;
    let on_b = aligner.seek_to_pos(1, false)?.unwrap();
    assert_eq!((on_b.stream, on_b.time), (1, Time::from_secs(1)));

    let step = aligner.remove_streams(&[b])?.unwrap();
    assert_eq!((step.global, step.stream, step.time), (0, 0, Time::from_secs(1)));
    assert_eq!(step.sample.unwrap().data, b"A@1000");
    assert_eq!(aligner.position(), Position::At(0));
    Ok(())
}

#[test]
fn test_export_range() -> ReplayResult<()> {
    let (dir, logs) = fixture();
    let aligner = StreamAligner::new(logs.streams().to_vec())?;

    let mut writer = LogWriter::create(dir.path().join("export"))?;
    assert_eq!(aligner.export(&mut writer, 1, 3)?, 3);
    let paths = writer.finish()?;

    let exported = Logfiles::open_with(&paths, &LogConfig::default(), &NullProgress)?;
    let s0: Vec<_> = exported.stream("S0")?.samples().collect::<ReplayResult<_>>()?;
    let s1: Vec<_> = exported.stream("S1")?.samples().collect::<ReplayResult<_>>()?;
    assert_eq!(s0.len(), 1);
    assert_eq!(s0[0].logical, Time::from_secs(1));
    assert_eq!(
        s1.iter().map(|s| s.logical).collect::<Vec<_>>(),
        vec![Time::from_millis(500), Time::from_millis(1500)]
    );
    assert_eq!(s1[1].data, b"S1@1500");

    let mut writer = LogWriter::create(dir.path().join("bad"))?;
    assert!(aligner.export(&mut writer, 2, 5).unwrap_err().is_out_of_range());
    Ok(())
}
