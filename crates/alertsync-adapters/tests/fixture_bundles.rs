use std::path::{Path, PathBuf};

use alertsync_adapters::{adapter_for, read_document_file, DocumentSpec};

fn sample_dir(pipeline_id: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(pipeline_id)
        .join("sample")
}

#[test]
fn kml_fixture_bundles_are_complete_and_parse() {
    for (pipeline_id, document) in [
        ("mass-movements", "alertas.kml"),
        ("fire-susceptibility", "susceptibilidad.kml"),
    ] {
        let dir = sample_dir(pipeline_id);
        assert!(dir.join("snapshot.json").exists(), "{pipeline_id}: snapshot.json");
        assert!(dir.join("layer.json").exists(), "{pipeline_id}: layer.json");

        let bytes = read_document_file(dir.join(document)).expect("fixture document");
        let parsed = adapter_for(&DocumentSpec::Kml)
            .parse_document(&bytes)
            .expect("fixture parses");
        assert!(!parsed.features.is_empty(), "{pipeline_id}: no features");
        assert_eq!(parsed.epsg, 4326);
    }
}

#[test]
fn operational_fixture_bundle_has_layer_descriptor() {
    let dir = sample_dir("operational");
    assert!(dir.join("alertas.csv").exists());
    assert!(dir.join("layer.json").exists());
}
