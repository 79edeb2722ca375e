use scour_core::config::ScourConfig;
use scour_core::rodata::{InputRecord, Literals, MetaData, RoData, SnapshotCell};
use scour_core::runner::{Candidate, ExecKind, ExecResult, Runner, RunnerError};
use scour_core::sonar::{SonarSite, FLAG_CONST2, FLAG_STRING, OP_EQL};
use scour_core::worker::Worker;
use scour_core::Whence;

use clap::Parser;
use rand::RngCore;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about = "scour: a coverage-guided fuzzer", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Directory with persistent work data.
    #[clap(long)]
    workdir: Option<PathBuf>,
    /// Parallelism level.
    #[clap(long)]
    procs: Option<usize>,
    /// Per-input execution ceiling, in seconds.
    #[clap(long)]
    timeout: Option<u64>,
    /// Total fuzz duration after startup, in seconds.
    #[clap(long)]
    ttl: Option<u64>,
    /// Process comparison telemetry (true/false).
    #[clap(long)]
    sonar: Option<bool>,
    /// Dump the sonar profile into the workdir as site coverage grows.
    #[clap(long)]
    dumpcover: bool,
    /// Keep duplicate crashers.
    #[clap(long)]
    dup: bool,
    /// Directory of initial seed inputs.
    #[clap(long)]
    seed_dir: Option<PathBuf>,
    /// Stop after this many fresh executions.
    #[clap(short, long)]
    iterations: Option<u64>,
}

/// The built-in demonstration target: panics once both the magic header and
/// the version tag are in place, which takes two cracked comparisons.
fn demo_harness(data: &[u8]) {
    if data.len() >= 8 && &data[..5] == b"SCOUR" && &data[5..8] == b"-66" {
        panic!("demo target accepted a complete header");
    }
}

/// Builds the packed comparison records the instrumented demo target would
/// emit for one execution.
fn demo_sonar(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut push = |id: u32, v1: &[u8], v2: &[u8]| {
        let flags = FLAG_STRING | FLAG_CONST2 | OP_EQL;
        out.extend_from_slice(&(id << 8 | u32::from(flags)).to_le_bytes());
        out.push(v1.len() as u8);
        out.push(v2.len() as u8);
        out.extend_from_slice(v1);
        out.extend_from_slice(v2);
    };
    if data.len() >= 5 {
        push(0, &data[..5], b"SCOUR");
    }
    if data.len() >= 8 && &data[..5] == b"SCOUR" {
        push(1, &data[5..8], b"-66");
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

struct Shared {
    shutdown: Arc<AtomicBool>,
    executions: AtomicU64,
    crashes: AtomicU64,
    seen: Mutex<HashSet<[u8; 16]>>,
    crash_seen: Mutex<HashSet<[u8; 16]>>,
    crasher_dir: PathBuf,
    dup: bool,
    max_executions: u64,
}

/// In-process runner for the demonstration target: deduplicates candidates,
/// catches panics as crashes, and synthesises the target's sonar stream.
struct DemoRunner {
    shared: Arc<Shared>,
}

impl Runner for DemoRunner {
    fn run(&mut self, candidate: Candidate) -> Result<ExecResult, RunnerError> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Relaxed) {
            return Err(RunnerError::ShuttingDown);
        }
        let digest = md5::compute(&candidate.data).0;
        if !shared.seen.lock().unwrap().insert(digest) {
            return Ok(ExecResult::default());
        }
        let executed = shared.executions.fetch_add(1, Ordering::Relaxed) + 1;
        if executed >= shared.max_executions {
            shared.shutdown.store(true, Ordering::Relaxed);
        }
        if executed % 100_000 == 0 {
            tracing::info!(
                executions = executed,
                crashes = shared.crashes.load(Ordering::Relaxed),
                "progress"
            );
        }

        let data = candidate.data;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            demo_harness(&data);
        }));
        if let Err(payload) = outcome {
            let description = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            self.report_crash(&data, &description, &candidate.whence)?;
        }
        Ok(ExecResult {
            sonar: demo_sonar(&data),
        })
    }
}

impl DemoRunner {
    fn report_crash(
        &self,
        data: &[u8],
        description: &str,
        whence: &Whence,
    ) -> Result<(), RunnerError> {
        let shared = &self.shared;
        shared.crashes.fetch_add(1, Ordering::Relaxed);
        let digest = md5::compute(data);
        if !shared.dup && !shared.crash_seen.lock().unwrap().insert(digest.0) {
            return Ok(());
        }
        let hash = format!("{digest:x}");
        tracing::error!(%hash, %description, %whence, "crasher found");
        let path = shared.crasher_dir.join(&hash);
        std::fs::write(&path, data)
            .map_err(|e| RunnerError::Execution(format!("failed to persist crasher: {e}")))?;
        Ok(())
    }
}

fn load_seed_corpus(dir: Option<&PathBuf>) -> Vec<Vec<u8>> {
    let mut seeds = Vec::new();
    if let Some(dir) = dir {
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_file() {
                        match std::fs::read(&path) {
                            Ok(data) if !data.is_empty() => seeds.push(data),
                            Ok(_) => {}
                            Err(err) => {
                                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable seed")
                            }
                        }
                    }
                }
            }
            Err(err) => tracing::warn!(dir = %dir.display(), error = %err, "seed directory not readable"),
        }
    }
    if seeds.is_empty() {
        seeds.push(b"SCOUR-00 placeholder body".to_vec());
        seeds.push(b"plain text without any header".to_vec());
    }
    seeds
}

fn build_snapshot(seeds: &[Vec<u8>]) -> RoData {
    let corpus = seeds
        .iter()
        .enumerate()
        .map(|(i, data)| InputRecord {
            data: data.clone(),
            depth: 0,
            running_score_sum: (i as u64 + 1) * 10,
        })
        .collect();
    RoData {
        corpus,
        str_lits: vec![b"SCOUR".to_vec(), b"-66".to_vec()],
        int_lits: vec![66u32.to_le_bytes().to_vec()],
        mut_weights: (1..=scour_core::mutator::N_MUTATIONS).collect(),
        can_exploit: false,
        sonar_sites: vec![
            SonarSite::new(0, "demo.rs:55 header magic"),
            SonarSite::new(1, "demo.rs:55 version tag"),
        ],
    }
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut config = match &cli.config_file {
        Some(path) => ScourConfig::load_from_file(path)?,
        None => {
            let default_path = PathBuf::from("scour.toml");
            if default_path.exists() {
                ScourConfig::load_from_file(&default_path)?
            } else {
                ScourConfig::default()
            }
        }
    };
    if let Some(workdir) = cli.workdir {
        config.workdir = workdir;
    }
    if let Some(procs) = cli.procs {
        config.procs = procs.max(1);
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(ttl) = cli.ttl {
        config.ttl_secs = Some(ttl);
    }
    if let Some(sonar) = cli.sonar {
        config.sonar = sonar;
    }
    if cli.dumpcover {
        config.dumpcover = true;
    }
    if cli.dup {
        config.dup = true;
    }
    tracing::info!(?config, "effective configuration");

    let crasher_dir = config.workdir.join("crashers");
    std::fs::create_dir_all(&crasher_dir)?;

    let meta = MetaData {
        literals: Literals {
            strings: vec!["SCOUR".to_string(), "-66".to_string()],
            ints: vec![66u32.to_le_bytes().to_vec()],
        },
    };
    let seeds = load_seed_corpus(cli.seed_dir.as_ref());
    let snapshots = Arc::new(SnapshotCell::new(build_snapshot(&seeds)));

    let shutdown = Arc::new(AtomicBool::new(false));
    let shared = Arc::new(Shared {
        shutdown: shutdown.clone(),
        executions: AtomicU64::new(0),
        crashes: AtomicU64::new(0),
        seen: Mutex::new(HashSet::new()),
        crash_seen: Mutex::new(HashSet::new()),
        crasher_dir,
        dup: config.dup,
        max_executions: cli.iterations.unwrap_or(1_000_000),
    });

    // Triage pass: run the initial corpus once so its telemetry lands in the
    // site table before mutation starts.
    {
        let mut runner = DemoRunner {
            shared: shared.clone(),
        };
        for seed in &seeds {
            let whence = Whence {
                initial_corpus: true,
                ..Default::default()
            };
            runner.run(Candidate {
                data: seed.clone(),
                whence,
                depth: 0,
                kind: ExecKind::Fuzz,
            })?;
        }
    }

    if let Some(ttl) = config.ttl_secs {
        let flag = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(ttl));
            tracing::info!("ttl reached, shutting down");
            flag.store(true, Ordering::Relaxed);
        });
    }

    let start = Instant::now();
    let mut entropy = rand::rng();
    let worker_seeds: Vec<[u8; 32]> = (0..config.procs)
        .map(|_| {
            let mut seed = [0u8; 32];
            entropy.fill_bytes(&mut seed);
            seed
        })
        .collect();

    std::thread::scope(|scope| {
        for (id, seed) in worker_seeds.into_iter().enumerate() {
            let snapshots = snapshots.clone();
            let shutdown = shutdown.clone();
            let shared = shared.clone();
            let meta = &meta;
            let config = &config;
            scope.spawn(move || {
                let mut seed_source = ChaCha8Rng::from_seed(seed);
                let runner = DemoRunner { shared };
                let mut worker = Worker::new(
                    meta,
                    &mut seed_source,
                    snapshots,
                    runner,
                    shutdown,
                    config,
                );
                if let Err(err) = worker.run() {
                    tracing::error!(worker = id, error = %err, "worker failed");
                }
            });
        }
    });

    let elapsed = start.elapsed();
    let executions = shared.executions.load(Ordering::Relaxed);
    let crashes = shared.crashes.load(Ordering::Relaxed);
    println!(
        "Fuzzing finished in {elapsed:.2?}: {executions} executions, {crashes} crashes, {:.0} execs/sec",
        executions as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}
