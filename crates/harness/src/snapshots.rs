use meridian_core::{CoreError, ModelPolicies, PipelineConfig, PropertyValue, Snapshot, Timestamp};

/// Build a snapshot received at `at_ms` with the given flat properties.
pub fn snapshot<V>(
    model_type: &str,
    source_system: &str,
    native_id: &str,
    at_ms: i64,
    properties: &[(&str, V)],
) -> Snapshot
where
    V: Into<PropertyValue> + Clone,
{
    properties.iter().fold(
        Snapshot::new(model_type, source_system, native_id, Timestamp::from_millis(at_ms)),
        |s, (path, value)| s.with_property(*path, value.clone()),
    )
}

/// `Device` correlated on serial number and MAC address, `last` on
/// `Model`, `max` on `Firmware.Build`.
pub fn device_config() -> Result<PipelineConfig, CoreError> {
    PipelineConfig::builder()
        .register_model(
            "Device",
            ["Serial", "Network.Mac"],
            ModelPolicies::new()
                .default_policy("first")
                .path("Model", "last")
                .path("Firmware.Build", "max"),
        )
        .register_model("Site", ["Code"], ModelPolicies::new())
        .build()
}
