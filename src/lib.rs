//! Core of a continuous-profiling agent: turns raw on-CPU stack samples into
//! symbolized pprof profiles and keeps the profile backend supplied with the
//! debuginfo files it needs to symbolize native frames later.

pub mod debuginfo;
pub mod debuginfopb;
pub mod ksym;
pub mod metadata;
pub mod metrics;
pub mod objectfile;
pub mod perf;
pub mod pprof;
pub mod pprofpb;
pub mod process;
pub mod vdso;
