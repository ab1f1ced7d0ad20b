//! End-to-end parity flow: fixtures from the fused reference model, the
//! rewritten export checked against it numerically, and a full benchmark
//! comparison round trip.

use span_bridge_export::ExportModel;
use span_bridge_parity::bench::{run_benchmark, HarnessConfig, RuntimeTarget};
use span_bridge_parity::compare::{run_external, ComparisonReport};
use span_bridge_parity::fixtures::{canonical_cases, FixtureFile, FixtureGenerator};
use span_bridge_parity::runtime::{FusedModelRuntime, NoopTap, ReferenceRuntime, RuntimeVersion};
use span_bridge_parity::samples::seed_samples;
use span_bridge_parity::testkit::tiny_loaded_model;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_fixtures_from_fused_reference_model() {
    let runtime = FusedModelRuntime::new(tiny_loaded_model(true), RuntimeVersion::V2).unwrap();
    let generator = FixtureGenerator::new(runtime).with_max_seq_len(64);
    let file = generator.generate(&canonical_cases());

    assert_eq!(file.metadata.model, "span-extractor-tiny");
    assert_eq!(file.cases.len(), 5);

    let simple = &file.cases[0];
    assert_eq!(simple.id, "simple_person");
    // Hidden states cover [CLS] + 6 words + [SEP]
    assert_eq!(simple.encoder.shape, vec![8, 8]);
    assert_eq!(simple.tokenizer.input_ids.len(), 8);
    // Every entity stays inside the text's token range
    for entity in &simple.entities {
        assert!(entity.token_end <= 6);
        assert!((0.0..=1.0).contains(&entity.score));
    }

    let dir = tempdir().unwrap();
    let path = dir.path().join("fixtures.json");
    file.save(&path).unwrap();
    let loaded = FixtureFile::load(&path).unwrap();
    assert_eq!(loaded.cases.len(), 5);
}

#[test]
fn test_rewritten_encoder_matches_fused_reference() {
    let reference =
        FusedModelRuntime::new(tiny_loaded_model(true), RuntimeVersion::V2).unwrap();
    let rewritten = ExportModel::from_loaded(&tiny_loaded_model(true)).unwrap();

    let encoding = reference.tokenizer().encode("John Smith works at Apple Inc.", 64);
    let fused_hidden = reference.encode_hidden(&encoding, &mut NoopTap).unwrap();
    let rewritten_hidden = rewritten.encoder.forward(&encoding.input_ids).unwrap();

    assert_eq!(fused_hidden.shape().dims(), rewritten_hidden.shape().dims());
    let tolerance = 1e-4; // the fixtures' hidden-state tolerance
    for (a, b) in fused_hidden.data().iter().zip(rewritten_hidden.data().iter()) {
        assert!((a - b).abs() <= tolerance, "{} vs {}", a, b);
    }
}

#[test]
fn test_benchmark_comparison_round_trip() {
    let runtime = FusedModelRuntime::new(tiny_loaded_model(true), RuntimeVersion::V2).unwrap();
    let mut target = RuntimeTarget::new(runtime, "reference");
    let config = HarnessConfig { iterations: 2, warmup: 1 };
    let candidate = run_benchmark(&mut target, &seed_samples(), &config).unwrap();

    // Stand in for the companion runtime: its summary already on disk, its
    // executable exiting cleanly.
    let dir = tempdir().unwrap();
    let baseline_path = dir.path().join("baseline.json");
    candidate.save(&baseline_path).unwrap();
    let baseline = run_external(&mut Command::new("true"), &baseline_path);
    assert!(baseline.is_some());

    let report = ComparisonReport::build(Some(&candidate), baseline.as_ref());
    let rendered = report.to_string();
    assert!(rendered.contains("averageLatencyMs"));
    assert!(rendered.contains("charactersPerSecond"));
    // Identical summaries compare at parity
    let throughput = report.rows.iter().find(|r| r.metric == "charactersPerSecond").unwrap();
    assert!((throughput.ratio.unwrap() - 1.0).abs() < 1e-9);
}
