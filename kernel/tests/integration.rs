//! End-to-end kernel behavior: crash recovery, tiered query escalation,
//! and archive round-trips over a real data directory.

use autocap_kernel::{Kernel, KernelOptions, KernelPaths};
use serde_json::{json, Value};
use std::path::Path;

fn options(dir: &Path) -> KernelOptions {
    KernelOptions {
        safe_mode: false,
        start_conductor: false,
        paths: Some(KernelPaths {
            root: dir.to_path_buf(),
            config_dir: dir.join("config_user"),
            data_dir: dir.join("data"),
            bundle_dir: None,
        }),
    }
}

#[test]
fn recovery_archives_tmp_files_and_logs_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let spool = data_dir.join("spool");
    std::fs::create_dir_all(&spool).unwrap();
    std::fs::write(spool.join("segment_0.avi.tmp"), b"partial-container").unwrap();
    // A crash can also leave a partial journal line behind.
    std::fs::write(data_dir.join("journal.ndjson"), b"{\"event_id\": \"run/tru").unwrap();

    let kernel = Kernel::boot(options(dir.path())).unwrap();

    // The tmp file was archived, not deleted.
    assert!(!spool.join("segment_0.avi.tmp").exists());
    let recovery_root = data_dir.join("recovery").join("archived_tmp");
    let mut archived = Vec::new();
    let mut stack = vec![recovery_root.clone()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                archived.push(path);
            }
        }
    }
    assert_eq!(archived.len(), 1);
    assert!(archived[0].ends_with("segment_0.avi.tmp"));
    assert_eq!(
        std::fs::read(&archived[0]).unwrap(),
        b"partial-container"
    );

    // A storage.recovery ledger entry summarizes the pass.
    let entries =
        autocap_store::ledger::read_entries(&data_dir.join("ledger.ndjson")).unwrap();
    let recovery = entries
        .iter()
        .find(|entry| entry.stage == "storage.recovery")
        .expect("expected storage.recovery entry");
    assert!(
        recovery.payload["archived_tmp_count"].as_u64().unwrap() >= 1,
        "payload: {}",
        recovery.payload
    );
    autocap_spec::verify_chain(&entries).unwrap();
    kernel.shutdown().unwrap();
}

#[test]
fn query_escalates_fast_to_fusion_with_thin_corpus() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("config_user")).unwrap();
    std::fs::write(
        dir.path().join("config_user/user.json"),
        serde_json::to_vec(&json!({
            "indexing": {"fast_threshold": 2, "fusion_threshold": 1},
        }))
        .unwrap(),
    )
    .unwrap();
    let kernel = Kernel::boot(options(dir.path())).unwrap();

    // Seed both indexes with one document.
    let lexical = autocap_index::LexicalIndex::open(&kernel.data_dir().join("lexical.idx")).unwrap();
    lexical.index("doc1", "hello world").unwrap();
    let vector = autocap_index::VectorIndex::open(
        &kernel.data_dir().join("vector.idx"),
        std::sync::Arc::new(autocap_index::HashEmbedder::new(384)),
    )
    .unwrap();
    vector.index("doc1", "hello world").unwrap();

    let (answer, trace) = kernel.query("hello").unwrap();
    let tiers: Vec<&str> = trace
        .iter()
        .filter_map(|row| row.get("tier").and_then(Value::as_str))
        .collect();
    assert_eq!(tiers, vec!["FAST", "FUSION"]);
    assert_eq!(answer.state, autocap_index::AnswerState::Ok);
    assert_eq!(answer.claims[0].citations, vec!["doc1"]);
    kernel.shutdown().unwrap();
}

#[test]
fn empty_corpus_answers_no_evidence_instead_of_claiming() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::boot(options(dir.path())).unwrap();
    let (answer, _trace) = kernel.query("anything at all").unwrap();
    assert_eq!(answer.state, autocap_index::AnswerState::NoEvidence);
    assert!(answer.claims.is_empty());
    assert!(answer.notice.is_some());
    kernel.shutdown().unwrap();
}

#[test]
fn archive_roundtrip_over_the_data_dir_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::boot(options(dir.path())).unwrap();
    let data_dir = kernel.data_dir().to_path_buf();
    kernel.shutdown().unwrap();

    let archive = dir.path().join("export.zip");
    autocap_store::archive::create_archive(&data_dir, &archive).unwrap();
    assert!(autocap_store::archive::verify_archive(&archive).unwrap().is_empty());

    let restored = dir.path().join("restored");
    autocap_store::archive::import_archive(&archive, &restored).unwrap();
    assert!(autocap_store::archive::roundtrip_dirs_equal(&data_dir, &restored).unwrap());
}

#[test]
fn capture_through_the_kernel_seals_segments() {
    let dir = tempfile::tempdir().unwrap();
    // Neutralize disk-pressure thresholds so host free space cannot
    // degrade or stop the pipeline mid-test.
    std::fs::create_dir_all(dir.path().join("config_user")).unwrap();
    std::fs::write(
        dir.path().join("config_user/user.json"),
        serde_json::to_vec(&json!({
            "storage": {
                "disk_pressure": {"warn_free_gb": 0, "soft_free_gb": 0, "critical_free_gb": 0},
            },
        }))
        .unwrap(),
    )
    .unwrap();
    let kernel = Kernel::boot(options(dir.path())).unwrap();
    let handles = kernel.start_capture(Box::new(
        autocap_capture::SyntheticFrameSource::new(3, 1, 1),
    ));
    handles.join();
    let segments = kernel
        .metadata()
        .records_of_type("evidence.capture.segment")
        .unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].1["frame_count"], json!(3));
    let content_hash = segments[0].1["content_hash"].as_str().unwrap();
    let media_bytes = kernel.media().get(&segments[0].0).unwrap();
    assert_eq!(content_hash, autocap_spec::sha256_hex(&media_bytes));
    let entries = autocap_store::ledger::read_entries(
        &kernel.data_dir().join("ledger.ndjson"),
    )
    .unwrap();
    assert!(entries.iter().any(|entry| entry.stage == "segment.seal"));
    kernel.shutdown().unwrap();
}

#[test]
fn sanitizer_from_kernel_vault_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::boot(options(dir.path())).unwrap();
    let sanitizer = kernel.sanitizer().unwrap();
    let input = "Contact John Doe at john@example.com or 555-123-4567.";
    let sanitized = sanitizer.sanitize_text(input, "default").unwrap();
    assert!(sanitized.text.contains("⟦ENT:EMAIL:"));
    assert!(sanitized.text.contains("⟦ENT:PHONE:"));
    assert_eq!(sanitizer.detokenize_text(&sanitized.text), input);
    let payload = sanitizer
        .sanitize_payload(&json!({"query": input}), "default")
        .unwrap();
    assert!(sanitizer.leak_check(&payload));
    kernel.shutdown().unwrap();
}

#[test]
fn drain_writes_a_landscape_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::boot(options(dir.path())).unwrap();
    let outcome = kernel.run_batch(true, 10);
    assert!(outcome.done, "blocked: {:?}", outcome.blocked_reason);
    assert!(outcome.manifest["payload_hash"].is_string());
    assert_eq!(
        outcome.manifest["record_type"],
        json!("derived.landscape.manifest")
    );
    // Persisted into metadata keyed by the config hash prefix.
    let manifests = kernel
        .metadata()
        .records_of_type("derived.landscape.manifest")
        .unwrap();
    assert_eq!(manifests.len(), 1);
    kernel.shutdown().unwrap();
}

#[test]
fn key_rotation_is_recorded_in_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = Kernel::boot(options(dir.path())).unwrap();
    let first = kernel.rotate_key("entity_tokens").unwrap();
    let second = kernel.rotate_key("entity_tokens").unwrap();
    assert_eq!(second, first + 1);
    let entries = autocap_store::ledger::read_entries(
        &kernel.data_dir().join("ledger.ndjson"),
    )
    .unwrap();
    let rotations: Vec<_> = entries
        .iter()
        .filter(|entry| entry.payload.get("event").and_then(Value::as_str) == Some("key.rotated"))
        .collect();
    assert_eq!(rotations.len(), 2);
    kernel.shutdown().unwrap();
}
