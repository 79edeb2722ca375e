//! The per-worker fuzz loop: pick a parent, mutate it, hand the child to the
//! runner, and feed any comparison telemetry back through the rewriter.
//!
//! A worker owns its generator, mutation engine, substring corpus and sonar
//! sample set exclusively; the only shared state it touches is the read-only
//! snapshot and the per-site statistics, both designed for that.

use crate::config::ScourConfig;
use crate::mutator::Mutator;
use crate::rodata::{MetaData, SnapshotCell};
use crate::runner::{Candidate, ExecKind, Runner, RunnerError};
use crate::sonar;
use rand_core::RngCore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Worker<R: Runner> {
    mutator: Mutator,
    snapshots: Arc<SnapshotCell>,
    runner: R,
    shutdown: Arc<AtomicBool>,
    sonar_enabled: bool,
    dump_cover: bool,
    workdir: PathBuf,
}

impl<R: Runner> Worker<R> {
    /// Builds one worker, drawing its generator seeds from `seed_source`.
    pub fn new(
        meta: &MetaData,
        seed_source: &mut impl RngCore,
        snapshots: Arc<SnapshotCell>,
        runner: R,
        shutdown: Arc<AtomicBool>,
        config: &ScourConfig,
    ) -> Self {
        Self {
            mutator: Mutator::new(meta, seed_source),
            snapshots,
            runner,
            shutdown,
            sonar_enabled: config.sonar,
            dump_cover: config.dumpcover,
            workdir: config.workdir.clone(),
        }
    }

    /// Runs generation cycles until the shutdown flag is raised or the
    /// runner reports it is tearing down.
    pub fn run(&mut self) -> Result<(), RunnerError> {
        tracing::info!("worker started");
        while !self.shutdown.load(Ordering::Relaxed) {
            // One snapshot per cycle: the corpus view stays stable for the
            // whole generate/mutate pass without blocking publishers.
            let ro = self.snapshots.load();
            if ro.corpus.last().map_or(0, |inp| inp.running_score_sum) == 0 {
                // Nothing triaged yet; let the coordinator catch up.
                std::thread::yield_now();
                continue;
            }
            let (data, mut whence, depth) = self.mutator.generate(&ro);
            whence.exec_kind = ExecKind::Fuzz;
            let result = match self.runner.run(Candidate {
                data: data.clone(),
                whence,
                depth,
                kind: ExecKind::Fuzz,
            }) {
                Ok(result) => result,
                Err(RunnerError::ShuttingDown) => break,
                Err(err) => return Err(err),
            };
            if !self.sonar_enabled {
                continue;
            }
            if let Some(sonar_bytes) = result.sonar {
                match self.process_sonar(&data, &sonar_bytes, depth, ExecKind::Fuzz) {
                    Ok(()) => {}
                    Err(RunnerError::ShuttingDown) => break,
                    Err(err) => return Err(err),
                }
            }
        }
        tracing::info!("worker stopped");
        Ok(())
    }

    /// Feeds one executed input's comparison telemetry through the site
    /// table and the rewriter, then refreshes the profile dump if a site
    /// direction was seen for the first time.
    ///
    /// `kind` distinguishes the regular fuzz loop from an external smash
    /// pass over the same input: smash observations count toward the
    /// per-site totals but not the fuzz-side counters, never narrow the
    /// skip policy, and skip equality-breaking for operands that already
    /// compare equal.
    pub fn process_sonar(
        &mut self,
        data: &[u8],
        sonar_bytes: &[u8],
        depth: usize,
        kind: ExecKind,
    ) -> Result<(), RunnerError> {
        let ro = self.snapshots.load();
        let updated = sonar::process_sonar_data(
            &mut self.mutator,
            &ro,
            data,
            sonar_bytes,
            depth,
            kind == ExecKind::Smash,
            &mut self.runner,
        )?;
        if updated && self.dump_cover {
            let path = self.workdir.join("sonarprofile");
            match sonar::dump_profile(&path, &ro.sonar_sites) {
                Ok(()) => tracing::info!(path = %path.display(), "sonar profile dumped"),
                Err(err) => tracing::warn!(error = %err, "sonar profile dump failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rodata::{InputRecord, RoData};
    use crate::runner::ExecResult;
    use crate::sonar::{SonarSite, FLAG_STRING, OP_EQL};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn record(id: u32, flags: u8, v1: &[u8], v2: &[u8]) -> Vec<u8> {
        let mut out = (id << 8 | u32::from(flags)).to_le_bytes().to_vec();
        out.push(v1.len() as u8);
        out.push(v2.len() as u8);
        out.extend_from_slice(v1);
        out.extend_from_slice(v2);
        out
    }

    /// Runner double that records every candidate it is handed.
    #[derive(Default)]
    struct CollectingRunner {
        candidates: Vec<Vec<u8>>,
    }

    impl Runner for CollectingRunner {
        fn run(&mut self, candidate: Candidate) -> Result<ExecResult, RunnerError> {
            self.candidates.push(candidate.data);
            Ok(ExecResult::default())
        }
    }

    /// Runner double that raises the shutdown flag after a fixed number of
    /// executions.
    struct CountingRunner {
        executed: usize,
        limit: usize,
        shutdown: Arc<AtomicBool>,
    }

    impl Runner for CountingRunner {
        fn run(&mut self, candidate: Candidate) -> Result<ExecResult, RunnerError> {
            assert!(!candidate.data.is_empty());
            self.executed += 1;
            if self.executed >= self.limit {
                self.shutdown.store(true, Ordering::Relaxed);
            }
            Ok(ExecResult::default())
        }
    }

    #[test]
    fn worker_runs_until_shutdown() {
        let snapshots = Arc::new(SnapshotCell::new(RoData {
            corpus: vec![InputRecord {
                data: b"seed input".to_vec(),
                depth: 0,
                running_score_sum: 1,
            }],
            ..Default::default()
        }));
        let shutdown = Arc::new(AtomicBool::new(false));
        let runner = CountingRunner {
            executed: 0,
            limit: 25,
            shutdown: shutdown.clone(),
        };
        let mut seeds = ChaCha8Rng::from_seed([40u8; 32]);
        let mut worker = Worker::new(
            &MetaData::default(),
            &mut seeds,
            snapshots,
            runner,
            shutdown.clone(),
            &ScourConfig::default(),
        );
        worker.run().expect("worker loop must exit cleanly");
        assert!(shutdown.load(Ordering::Relaxed));
        assert_eq!(worker.runner.executed, 25);
    }

    #[test]
    fn smash_telemetry_counts_totals_but_never_narrows_the_fuzz_policy() {
        let snapshots = Arc::new(SnapshotCell::new(RoData {
            corpus: vec![InputRecord {
                data: b"seed".to_vec(),
                depth: 0,
                running_score_sum: 1,
            }],
            sonar_sites: vec![SonarSite::new(0, "demo.rs:7")],
            ..Default::default()
        }));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut seeds = ChaCha8Rng::from_seed([42u8; 32]);
        let mut worker = Worker::new(
            &MetaData::default(),
            &mut seeds,
            snapshots,
            CollectingRunner::default(),
            shutdown,
            &ScourConfig::default(),
        );

        let data = b"ping foo pong";
        let differing = record(0, FLAG_STRING | OP_EQL, b"foo", b"bar");
        // Well past both skip thresholds: if smash observations counted
        // against the fuzz-side policy, rewriting would stall.
        for round in 1..=150 {
            worker
                .process_sonar(data, &differing, 0, ExecKind::Smash)
                .unwrap();
            assert_eq!(
                worker.runner.candidates.len(),
                round,
                "smash rounds must keep rewriting; the skip policy is fuzz-only"
            );
        }
        let ro = worker.snapshots.load();
        let summary = ro.sonar_sites[0].summary();
        assert_eq!(summary.taken_fuzz, [0, 0]);
        assert_eq!(summary.taken_total[0], 150);

        // Equal operands are not worth breaking while every byte is being
        // perturbed anyway; the observation still lands in the totals.
        let equal = record(0, FLAG_STRING | OP_EQL, b"foo", b"foo");
        worker
            .process_sonar(data, &equal, 0, ExecKind::Smash)
            .unwrap();
        assert_eq!(worker.runner.candidates.len(), 150);
        assert_eq!(ro.sonar_sites[0].summary().taken_total[1], 1);

        // The same telemetry from the fuzz loop does hit the fuzz counters.
        worker
            .process_sonar(data, &differing, 0, ExecKind::Fuzz)
            .unwrap();
        assert_eq!(ro.sonar_sites[0].summary().taken_fuzz[0], 1);
        assert_eq!(worker.runner.candidates.len(), 151);
    }

    #[test]
    fn worker_stops_when_the_runner_tears_down() {
        struct RefusingRunner;
        impl Runner for RefusingRunner {
            fn run(&mut self, _candidate: Candidate) -> Result<ExecResult, RunnerError> {
                Err(RunnerError::ShuttingDown)
            }
        }
        let snapshots = Arc::new(SnapshotCell::new(RoData {
            corpus: vec![InputRecord {
                data: b"seed".to_vec(),
                depth: 0,
                running_score_sum: 1,
            }],
            ..Default::default()
        }));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut seeds = ChaCha8Rng::from_seed([41u8; 32]);
        let mut worker = Worker::new(
            &MetaData::default(),
            &mut seeds,
            snapshots,
            RefusingRunner,
            shutdown,
            &ScourConfig::default(),
        );
        worker.run().expect("a tearing-down runner is not an error");
    }
}
