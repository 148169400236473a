use serde::Serialize;
use serde_json::json;

use meridian_core::{ModelPolicies, PipelineConfig, PropertyValue, Snapshot, Timestamp};
use meridian_engine::{
    CANONICAL_VIEW, LINEAGE_VIEW, PolicyMismatch, PolicyRegistry, RecordResolution, ViewFilter,
};
use meridian_harness::{TestPipeline, device_config, snapshot};
use meridian_storage::{CanonicalEntity, MemoryStore, Page};

// ============================================================================
// Scenario: one device reported by two systems
// ============================================================================

#[test]
fn bms_and_oem_reports_of_sn004() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::memory(device_config()?)?;
    fixture.ingest(&[
        snapshot("Device", "bms", "d4", 100, &[("Serial", "SN004"), ("Model", "X")]),
        snapshot("Device", "oem", "d4", 200, &[("Serial", "SN004"), ("Model", "X-Pro")]),
    ])?;

    let entity = fixture.only_entity("Device")?;
    let models: Vec<&PropertyValue> = entity
        .property("Model")
        .ok_or("Model missing")?
        .iter()
        .map(|e| &e.value)
        .collect();
    assert_eq!(models, vec![&PropertyValue::from("X"), &PropertyValue::from("X-Pro")]);
    for source in ["bms", "oem"] {
        let external = entity
            .property(&format!("identifier.external.{source}"))
            .ok_or("external id missing")?;
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].value, PropertyValue::from("d4"));
    }

    assert_eq!(fixture.resolved(entity.canonical_id, "Model")?, PropertyValue::from("X-Pro"));
    let view = fixture.query().get_view(CANONICAL_VIEW, entity.canonical_id)?;
    let doc = view.payload_json()?;
    assert_eq!(doc["Model"], json!("X-Pro"));
    assert_eq!(doc["identifier"]["external"]["oem"], json!("d4"));
    Ok(())
}

// ============================================================================
// Determinism and precedence
// ============================================================================

#[test]
fn materialization_is_deterministic() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::memory(device_config()?)?;
    fixture.ingest(&[
        snapshot("Device", "bms", "1", 100, &[("Serial", "S1"), ("Model", "A"), ("Firmware.Build", "7")]),
        snapshot("Device", "oem", "1", 200, &[("Serial", "S1"), ("Model", "B"), ("Firmware.Build", "12")]),
    ])?;
    let entity = fixture.only_entity("Device")?;

    let first = fixture.materializer().materialize_entity(&entity, Timestamp::from_millis(1));
    let second = fixture.materializer().materialize_entity(&entity, Timestamp::from_millis(1));
    assert_eq!(first, second);
    assert_eq!(first.values["Firmware.Build"], PropertyValue::Integer(12));
    assert_eq!(first.policy_applied["Firmware.Build"], "max");
    assert_eq!(first.policy_applied["Serial"], "first");

    let before = fixture.query().get_view(CANONICAL_VIEW, entity.canonical_id)?;
    let rebuilt = fixture.admin().reproject(entity.canonical_id, None)?;
    let canonical = rebuilt
        .iter()
        .find(|p| p.view_name == CANONICAL_VIEW)
        .ok_or("canonical view missing")?;
    assert_eq!(canonical.payload, before.payload);
    assert_eq!(canonical.content_hash, before.content_hash);
    assert_eq!(canonical.version, before.version);
    Ok(())
}

#[test]
fn record_transformer_overrides_path_policies() -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::builder()
        .register_model(
            "Device",
            ["Serial"],
            ModelPolicies::new()
                .path("Model", "first")
                .record_transformer("vendor-wins"),
        )
        .build()?;
    let mut policies = PolicyRegistry::new();
    policies.register_record("vendor-wins", |entity: &CanonicalEntity| -> Result<RecordResolution, PolicyMismatch> {
        let mut resolution = RecordResolution::default();
        for (path, entries) in &entity.properties {
            let pick = entries
                .iter()
                .rev()
                .find(|e| e.source_system == "oem")
                .or_else(|| entries.last())
                .ok_or_else(|| PolicyMismatch(format!("{path} has no values")))?;
            resolution.values.insert(path.clone(), pick.value.clone());
            resolution.policies.insert(path.clone(), "vendor-wins".into());
        }
        Ok(resolution)
    });

    let fixture = TestPipeline::with_store(std::sync::Arc::new(MemoryStore::new()), config, policies)?;
    fixture.ingest(&[
        snapshot("Device", "oem", "9", 100, &[("Serial", "S1"), ("Model", "Vendor")]),
        snapshot("Device", "bms", "1", 200, &[("Serial", "S1"), ("Model", "Local")]),
    ])?;
    let entity = fixture.only_entity("Device")?;
    let view = fixture.query().materialized(entity.canonical_id)?;
    assert_eq!(view.values["Model"], PropertyValue::from("Vendor"));
    assert_eq!(view.policy_applied["Model"], "vendor-wins");
    Ok(())
}

// ============================================================================
// Robustness
// ============================================================================

#[test]
fn max_ignores_text_and_nulls() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::memory(device_config()?)?;
    let builds = [
        PropertyValue::from("abc"),
        PropertyValue::from("3"),
        PropertyValue::from("7"),
        PropertyValue::Null,
    ];
    let snapshots: Vec<Snapshot> = builds
        .iter()
        .enumerate()
        .map(|(i, build)| {
            snapshot(
                "Device",
                &format!("src{i}"),
                "n",
                100 + i as i64,
                &[("Serial", PropertyValue::from("S1")), ("Firmware.Build", build.clone())],
            )
        })
        .collect();
    fixture.ingest(&snapshots)?;

    let entity = fixture.only_entity("Device")?;
    assert_eq!(entity.property("Firmware.Build").map(<[_]>::len), Some(4));
    assert_eq!(fixture.resolved(entity.canonical_id, "Firmware.Build")?, PropertyValue::Integer(7));
    Ok(())
}

#[test]
fn later_null_or_blank_does_not_erase_a_value() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::memory(device_config()?)?;
    fixture.ingest(&[
        snapshot::<PropertyValue>("Device", "bms", "d4", 100, &[("Serial", "SN004".into()), ("Model", "X-Pro".into())]),
        snapshot("Device", "oem", "d4", 200, &[("Serial", "SN004".into()), ("Model", PropertyValue::Null)]),
        snapshot("Device", "cmdb", "d4", 300, &[("Serial", "SN004".into()), ("Model", PropertyValue::from("  "))]),
    ])?;

    let entity = fixture.only_entity("Device")?;
    assert_eq!(entity.property("Model").map(<[_]>::len), Some(3));
    assert_eq!(fixture.resolved(entity.canonical_id, "Model")?, PropertyValue::from("X-Pro"));
    let doc = fixture.query().get_view(CANONICAL_VIEW, entity.canonical_id)?.payload_json()?;
    assert_eq!(doc["Model"], json!("X-Pro"));
    Ok(())
}

#[test]
fn unknown_policies_fall_back_with_warnings() -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::builder()
        .register_model("Device", ["Serial"], ModelPolicies::new().path("Model", "median"))
        .build()?;
    let fixture = TestPipeline::memory(config)?;
    fixture.ingest(&[
        snapshot("Device", "bms", "1", 100, &[("Serial", "S1"), ("Model", "A")]),
        snapshot("Device", "oem", "1", 200, &[("Serial", "S1"), ("Model", "B")]),
    ])?;
    let entity = fixture.only_entity("Device")?;
    let view = fixture.query().materialized(entity.canonical_id)?;
    assert_eq!(view.values["Model"], PropertyValue::from("B"));
    assert_eq!(view.policy_applied["Model"], "last");
    assert!(view.warnings.iter().any(|w| w.contains("median")));

    let lineage = fixture.query().lineage(entity.canonical_id)?;
    assert!(!lineage["warnings"].as_array().ok_or("warnings missing")?.is_empty());
    Ok(())
}

// ============================================================================
// Typed and JSON ingestion
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceRecord {
    serial: String,
    model: String,
    firmware: Firmware,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Firmware {
    build: i64,
}

#[test]
fn typed_and_json_snapshots_share_one_shape() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::memory(device_config()?)?;
    let typed = Snapshot::from_typed(
        "Device",
        "erp",
        "e-1",
        Timestamp::from_millis(100),
        &DeviceRecord {
            serial: "S9".into(),
            model: "Typed".into(),
            firmware: Firmware { build: 4 },
        },
    )?;
    fixture.submit(&typed)?;
    fixture.submit_json(
        r#"{
            "modelType": "Device",
            "sourceSystem": "oem",
            "nativeId": "o-1",
            "receivedAt": "2024-01-01T00:00:00Z",
            "properties": {"Serial": "S9", "Model": "Json", "Firmware": {"Build": 9}}
        }"#,
    )?;
    fixture.run_until_idle()?;

    let entity = fixture.only_entity("Device")?;
    assert_eq!(entity.contributions.len(), 2);
    assert_eq!(fixture.resolved(entity.canonical_id, "Firmware.Build")?, PropertyValue::Integer(9));

    let matches = fixture.query().list_views(
        LINEAGE_VIEW,
        &ViewFilter::new().model_type("Device").equals("properties.Model.resolved", "Json"),
        Page::first(10),
    )?;
    assert_eq!(matches.len(), 1);
    Ok(())
}
