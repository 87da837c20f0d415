/// Integration tests for JSONL trace ingestion and generation.
use servesim_core::config::{SimConfig, WorkloadSection};
use servesim_core::request::Request;
use servesim_core::trace::{self, TraceError, TraceRecord};
use servesim_core::workload;
use std::io::BufReader;

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("servesim_{}_{}", std::process::id(), name))
}

#[test]
fn test_generated_trace_round_trips_through_file() {
    let section = WorkloadSection {
        num_requests: 50,
        prefix_groups: 3,
        prefix_blocks: 2,
        slo_classes: vec!["critical".into(), "batch".into()],
        ..WorkloadSection::default()
    };
    let records = workload::generate_records(&section, 11);
    let path = temp_path("roundtrip.jsonl");
    trace::write_jsonl(&records, &path).unwrap();

    let loaded = trace::load_trace(&path, 16).unwrap();
    let generated = workload::generate(&section, 11, 16);
    assert_eq!(loaded, generated);

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_trace_drives_a_simulation() {
    let data = r#"# three requests, two sharing a prefix
{"id": 0, "arrival_us": 0, "input_tokens": 64, "output_tokens": 4, "prefix_group": 1, "prefix_blocks": 3}
{"id": 1, "arrival_us": 50000, "input_tokens": 64, "output_tokens": 4, "prefix_group": 1, "prefix_blocks": 3}
{"id": 2, "arrival_us": 100000, "input_tokens": 32, "output_tokens": 8, "slo_class": "batch"}
"#;
    let path = temp_path("drive.jsonl");
    std::fs::write(&path, data).unwrap();

    let config = SimConfig::from_str(&format!(
        r#"
[cluster]
num_instances = 1

[workload]
trace_path = "{}"
"#,
        path.display()
    ))
    .unwrap();
    let requests = workload::load_requests(&config, None).unwrap();
    assert_eq!(requests.len(), 3);

    let metrics = servesim_core::run_simulation(config, requests).unwrap();
    assert_eq!(metrics.completed, 3);
    // The second request reuses the first one's three prefix blocks.
    assert!(metrics.cache_hit_rate > 0.0);

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_cli_trace_overrides_configured_workload() {
    let path = temp_path("override.jsonl");
    std::fs::write(
        &path,
        "{\"arrival_us\": 5, \"input_tokens\": 16, \"output_tokens\": 1}\n",
    )
    .unwrap();
    let config = SimConfig::from_str("[cluster]\nnum_instances = 2\n").unwrap();

    let from_trace = workload::load_requests(&config, Some(&path)).unwrap();
    assert_eq!(from_trace.len(), 1);
    let synthetic = workload::load_requests(&config, None).unwrap();
    assert_eq!(synthetic.len(), config.workload.num_requests);

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_malformed_line_reports_line_number() {
    let data = "{\"arrival_us\": 1, \"input_tokens\": 1, \"output_tokens\": 1}\n\n{\"arrival_us\": \"soon\"}\n";
    let err = trace::parse_jsonl(BufReader::new(data.as_bytes()), 16).unwrap_err();
    match err {
        TraceError::JsonParse { line, .. } => assert_eq!(line, 3),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_file_is_io_error() {
    let err = trace::load_trace(&temp_path("missing.jsonl"), 16).unwrap_err();
    assert!(matches!(err, TraceError::Io(_)));
}

#[test]
fn test_optional_fields_are_omitted_when_written() {
    let record = TraceRecord {
        id: Some(4),
        arrival_us: 10,
        input_tokens: 8,
        output_tokens: 2,
        slo_class: None,
        prefix_group: None,
        prefix_blocks: None,
    };
    let line = serde_json::to_string(&record).unwrap();
    assert!(!line.contains("slo_class"));
    assert!(!line.contains("prefix_group"));
}

#[test]
fn test_trace_with_huge_token_count_is_rejected() {
    let path = temp_path("huge.jsonl");
    std::fs::write(
        &path,
        format!(
            "{{\"arrival_us\": 0, \"input_tokens\": 16, \"output_tokens\": 4}}\n\
             {{\"arrival_us\": 9, \"input_tokens\": {}, \"output_tokens\": 10}}\n",
            u32::MAX - 5
        ),
    )
    .unwrap();

    let err = trace::load_trace(&path, 16).unwrap_err();
    assert!(matches!(err, TraceError::TooManyTokens { line: 2, .. }));
    assert!(err.to_string().contains("line 2"));

    std::fs::remove_file(&path).ok();
}

#[test]
fn test_request_larger_than_u32_tokens_is_dropped_not_stuck() {
    let config = SimConfig::from_str("[cluster]\nnum_instances = 1\n").unwrap();
    let huge = Request {
        id: 0,
        arrival_us: 0,
        input_tokens: u32::MAX - 5,
        output_tokens: 10,
        slo_class: String::new(),
        prefix_hashes: Vec::new(),
    };
    let small = Request {
        id: 1,
        arrival_us: 10,
        input_tokens: 32,
        output_tokens: 4,
        slo_class: String::new(),
        prefix_hashes: Vec::new(),
    };

    let metrics = servesim_core::run_simulation(config, vec![huge, small]).unwrap();
    assert_eq!(metrics.dropped_unservable, 1);
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.still_queued + metrics.still_running, 0);
    assert!(metrics.conservation_holds);
}
