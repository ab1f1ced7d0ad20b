//! Parity tooling for span-bridge
//!
//! Generates deterministic, tolerance-annotated fixtures from the fused
//! reference model and benchmarks both runtimes under identical workloads.
//! The reference model is only ever driven through the [`ReferenceRuntime`]
//! capability trait; intermediate tensors are observable via the [`TapSink`]
//! instrumentation seam.

pub mod bench;
pub mod compare;
pub mod fixtures;
pub mod runtime;
pub mod samples;
pub mod spans;
pub mod testkit;

pub use bench::{percentile, run_benchmark, BenchTarget, BenchmarkSummary, HarnessConfig, RuntimeTarget};
pub use compare::{run_external, ComparisonReport, ComparisonRow};
pub use fixtures::{
    canonical_cases, CaseSpec, FixtureCase, FixtureFile, FixtureGenerator, FixtureMetadata,
    ToleranceSpec, GENERATOR_VERSION,
};
pub use runtime::{
    FusedModelRuntime, NoopTap, ReferenceRuntime, RuntimeVersion, TapPoint, TapRecorder, TapSink,
};
pub use samples::{load_samples, parse_samples, seed_samples, write_samples, Sample};
pub use spans::{find_valid_spans, resolve_entity, select_spans, PredictedEntity, SpanCandidate};
