//! Cross-component scenarios exercising the Change Detector & Applier, the
//! Layer Engine, and the Manifest Generator together, per spec.md §8
//! Scenarios A-F.

use camino::Utf8Path;
use chrono::{DateTime, Utc};

use ossb_core::change::{detect_changes, memory_file_change, ChangeType};
use ossb_core::layer::{Compression, LayerConfig, LayerEngine};
use ossb_core::manifest::{
    calculate_config_digest, validate_image_manifest, validate_manifest_list, ConfigOptions,
    Instruction, ManifestGenerator, Platform, PlatformManifest,
};

fn fixed_timestamp() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

// Scenario A — Simple add.
#[test]
fn scenario_a_simple_add_packs_a_single_regular_entry() {
    let mut engine = LayerEngine::new();
    let config = LayerConfig::default()
        .with_compression(Compression::None)
        .with_timestamp(fixed_timestamp());
    let change = memory_file_change(
        "/hello.txt",
        ChangeType::Add,
        0o644,
        0,
        0,
        1_234_567_890,
        b"world".to_vec(),
    );
    let layer = engine.create_layer(vec![change], &config).unwrap();

    assert_eq!(layer.media_type(), "application/vnd.oci.image.layer.v1.tar");
    assert!(layer.digest().starts_with("sha256:"));

    let mut archive = tar::Archive::new(layer.read_blob());
    let mut entries = archive.entries().unwrap();
    let mut entry = entries.next().unwrap().unwrap();
    assert_eq!(entry.path().unwrap().to_str().unwrap(), "hello.txt");
    assert_eq!(entry.header().entry_type(), tar::EntryType::Regular);
    assert_eq!(entry.header().size().unwrap(), 5);
    let mut content = String::new();
    std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
    assert_eq!(content, "world");
    assert!(entries.next().is_none());
}

// Scenario B — Delete.
#[test]
fn scenario_b_delete_emits_a_whiteout_marker() {
    let mut engine = LayerEngine::new();
    let config = LayerConfig::default()
        .with_compression(Compression::None)
        .with_timestamp(fixed_timestamp());
    let change = memory_file_change(
        "/etc/removed",
        ChangeType::Delete,
        0o644,
        0,
        0,
        1_234_567_890,
        Vec::new(),
    );
    let layer = engine.create_layer(vec![change], &config).unwrap();

    let mut archive = tar::Archive::new(layer.read_blob());
    let mut entries = archive.entries().unwrap();
    let entry = entries.next().unwrap().unwrap();
    assert_eq!(entry.path().unwrap().to_str().unwrap(), "etc/.wh.removed");
    assert_eq!(entry.header().entry_type(), tar::EntryType::Regular);
    assert_eq!(entry.header().size().unwrap(), 0);
    assert!(entries.next().is_none());
}

// Scenario C — Deduplication.
#[test]
fn scenario_c_identical_inputs_dedup_to_one_layer() {
    let mut engine = LayerEngine::new();
    let config = LayerConfig::default()
        .with_compression(Compression::None)
        .with_timestamp(fixed_timestamp());
    let make_change = || {
        memory_file_change(
            "/a.txt",
            ChangeType::Add,
            0o644,
            0,
            0,
            1_234_567_890,
            b"same bytes".to_vec(),
        )
    };
    let l1 = engine.create_layer(vec![make_change()], &config).unwrap();
    let l2 = engine.create_layer(vec![make_change()], &config).unwrap();
    assert_eq!(l1.digest(), l2.digest());

    let deduped = engine.dedup_layers(vec![l1.clone(), l2]);
    assert_eq!(deduped.len(), 1);
    assert_eq!(deduped[0].digest(), l1.digest());
}

// Scenario D — Multi-arch index.
#[test]
fn scenario_d_multi_arch_index_orders_amd64_before_arm64() {
    let generator = ManifestGenerator::new();
    let digest_a = format!("sha256:{}", "a".repeat(64));
    let digest_b = format!("sha256:{}", "b".repeat(64));
    let entries = vec![
        PlatformManifest {
            digest: digest_a,
            size: 512,
            platform: Platform::new("arm64", "linux"),
            annotations: None,
        },
        PlatformManifest {
            digest: digest_b,
            size: 512,
            platform: Platform::new("amd64", "linux"),
            annotations: None,
        },
    ];

    let index = generator.generate_image_index(&entries).unwrap();
    let architectures: Vec<String> = index
        .manifests()
        .iter()
        .map(|d| d.platform().as_ref().unwrap().architecture().to_string())
        .collect();
    assert_eq!(architectures, vec!["amd64".to_string(), "arm64".to_string()]);
    validate_manifest_list(&index).unwrap();
}

// Scenario E — Dockerfile to config.
#[test]
fn scenario_e_dockerfile_instructions_translate_into_a_valid_config() {
    let generator = ManifestGenerator::new();
    let platform = Platform::new("amd64", "linux");
    let instructions = vec![
        Instruction::new("FROM", "alpine", 1),
        Instruction::new("WORKDIR", "/app", 2),
        Instruction::new("ENV", "PATH=/bin", 3),
        Instruction::new("EXPOSE", "80", 4),
        Instruction::new("CMD", r#"["sh"]"#, 5),
    ];
    let options = ConfigOptions::default().with_timestamp(fixed_timestamp());

    let config = generator
        .generate_image_config(&instructions, &platform, &options)
        .unwrap();

    let runtime = config.configuration().config().as_ref().unwrap();
    assert_eq!(runtime.working_dir().as_deref(), Some("/app"));
    assert!(runtime
        .env()
        .as_ref()
        .unwrap()
        .contains(&"PATH=/bin".to_string()));
    assert!(config.exposed_ports().contains("80/tcp"));
    assert_eq!(runtime.cmd().as_ref().unwrap(), &vec!["sh".to_string()]);
    assert!(config.configuration().history().len() >= 1);
}

// Scenario F — Reproducibility.
#[test]
fn scenario_f_identical_inputs_with_fixed_timestamp_are_byte_reproducible() {
    let instructions = vec![
        Instruction::new("FROM", "alpine", 1),
        Instruction::new("RUN", "apk add curl", 2),
        Instruction::new("CMD", r#"["/bin/sh"]"#, 3),
    ];
    let platform = Platform::new("amd64", "linux");
    let options = ConfigOptions::default().with_timestamp(fixed_timestamp());

    let generator_a = ManifestGenerator::new();
    let generator_b = ManifestGenerator::new();
    let config_a = generator_a
        .generate_image_config(&instructions, &platform, &options)
        .unwrap();
    let config_b = generator_b
        .generate_image_config(&instructions, &platform, &options)
        .unwrap();

    assert_eq!(
        calculate_config_digest(&config_a).unwrap(),
        calculate_config_digest(&config_b).unwrap()
    );
}

// End-to-end: CDA -> LE -> MG for a full single-platform image.
#[test]
fn full_pipeline_detects_packs_and_manifests_an_image() {
    let old_root_dir = tempfile::tempdir().unwrap();
    let new_root_dir = tempfile::tempdir().unwrap();
    let old_root = Utf8Path::from_path(old_root_dir.path()).unwrap();
    let new_root = Utf8Path::from_path(new_root_dir.path()).unwrap();

    std::fs::create_dir_all(new_root_dir.path().join("bin")).unwrap();
    std::fs::write(new_root_dir.path().join("bin/app"), b"#!/bin/sh\necho hi\n").unwrap();

    let mut changes = detect_changes(old_root, new_root).unwrap();
    assert!(!changes.is_empty());

    let mut engine = LayerEngine::new();
    let layer_config = LayerConfig::default()
        .with_compression(Compression::Gzip)
        .with_timestamp(fixed_timestamp());
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    let layer = engine
        .create_layer(changes, &layer_config)
        .unwrap()
        .with_created_by("COPY bin/app /bin/app");
    engine.validate_layer(&layer).unwrap();

    let generator = ManifestGenerator::new();
    let platform = Platform::new("amd64", "linux");
    let instructions = vec![
        Instruction::new("FROM", "scratch", 1),
        Instruction::new("COPY", "bin/app /bin/app", 2),
        Instruction::new("ENTRYPOINT", r#"["/bin/app"]"#, 3),
    ];
    let options = ConfigOptions::default().with_timestamp(fixed_timestamp());
    let mut config = generator
        .generate_image_config(&instructions, &platform, &options)
        .unwrap();
    generator.add_layer_to_config(&mut config, &layer).unwrap();

    let manifest = generator
        .generate_image_manifest(&config, std::slice::from_ref(&layer))
        .unwrap();
    validate_image_manifest(&manifest).unwrap();
    assert_eq!(manifest.layers().len(), 1);
    assert_eq!(config.rootfs().diff_ids().len(), 1);

    let manifest_digest = ossb_core::manifest::calculate_manifest_digest(&manifest).unwrap();
    let index = generator
        .generate_image_index(&[PlatformManifest {
            digest: manifest_digest,
            size: ossb_core::manifest::serialize_manifest(&manifest).unwrap().len() as u64,
            platform,
            annotations: None,
        }])
        .unwrap();
    validate_manifest_list(&index).unwrap();

    // Materialize the layer back and confirm the applied tree matches.
    let extracted_dir = tempfile::tempdir().unwrap();
    let extracted_root = Utf8Path::from_path(extracted_dir.path()).unwrap();
    engine.extract_layer(&layer, extracted_root).unwrap();
    let applied = std::fs::read(extracted_dir.path().join("bin/app")).unwrap();
    assert_eq!(applied, b"#!/bin/sh\necho hi\n");
}
