pub mod config;
pub mod defs;
pub mod mutator;
pub mod rng;
pub mod rodata;
pub mod runner;
pub mod sonar;
pub mod substr;
pub mod worker;

pub use config::ScourConfig;
pub use mutator::{Choice, Mutation, Mutator, Whence};
pub use rng::Pcg;
pub use rodata::{InputRecord, Literals, MetaData, RoData, SnapshotCell};
pub use runner::{Candidate, ExecKind, ExecResult, Runner, RunnerError};
pub use sonar::{SonarSample, SonarSite};
pub use substr::SubstrCorpus;
pub use worker::Worker;
