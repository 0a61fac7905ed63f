//! Integration tests for vox_data crate
//!
//! Tests full update flows: containers, remote clients and notifications

use std::collections::HashMap;
use std::time::Duration;
use vox_data::*;

fn context() -> std::sync::Arc<DataContext> {
    let _ = env_logger::builder().is_test(true).try_init();
    DataContext::with_defaults().expect("Failed to start coordinator")
}

#[test]
fn test_import_into_container() {
    let context = context();
    let scene = ContainerData::create(&context, "scene").unwrap();
    let volume = VersionedObject::create(&context, DataKind::Volume).unwrap();
    let spacing = PropertyDefinition::new("spacing", PropertyType::Vec3);

    // Add the volume under the scene's own update
    let scene_update = scene.object().create_update(ContainerUpdates::new()).unwrap();
    scene.insert_element("ct", volume.clone(), &scene_update).unwrap();
    scene_update.finish(Metadata::new()).unwrap();

    // Writing the member now needs a running scene update
    assert!(matches!(
        volume.create_update(ContainerUpdates::new()),
        Err(DataError::KeyNotFound(_))
    ));

    let scene_update = scene.object().create_update(ContainerUpdates::new()).unwrap();
    let volume_update = scene.child_update(&volume, &scene_update).unwrap();
    volume_update
        .set_property(&spacing, [0.8, 0.8, 1.5], ReplaceMode::InsertOrReplace)
        .unwrap();

    let mut metadata = Metadata::new();
    metadata.insert("Importer".into(), serde_json::json!("dicom"));
    let snapshot = volume_update.finish(metadata).unwrap().unwrap();
    assert_eq!(snapshot.metadata()["Importer"], "dicom");

    let scene_snapshot = scene_update.finish(Metadata::new()).unwrap().unwrap();
    assert_eq!(scene_snapshot.version_string(), "4");
    assert_eq!(
        scene.get_element("ct").unwrap().get_property("spacing", false).unwrap(),
        Some(Value::Vec3([0.8, 0.8, 1.5]))
    );
}

#[test]
fn test_container_update_drop_waits_for_members() {
    let context = context();
    let scene = ContainerData::create(&context, "scene").unwrap();
    let surface = VersionedObject::create(&context, DataKind::Surface).unwrap();

    let scene_update = scene.object().create_update(ContainerUpdates::new()).unwrap();
    scene.insert_element("mesh", surface.clone(), &scene_update).unwrap();
    let member = scene.child_update(&surface, &scene_update).unwrap();

    // The member keeps the scene update alive and running
    drop(scene_update);
    assert!(scene.object().current_snapshot().update_is_running());

    member.finish(Metadata::new()).unwrap();
    // Releasing the member's guard dropped the last scene update reference
    let snapshot = scene.object().current_snapshot();
    assert!(!snapshot.update_is_running());
    assert_eq!(snapshot.metadata()["Status"]["Error"]["Name"], UPDATE_ABORTED);
}

#[test]
fn test_container_teardown_frees_members() {
    let context = context();
    let image = VersionedObject::create(&context, DataKind::Image).unwrap();
    {
        let scene = ContainerData::create(&context, "temporary").unwrap();
        let update = scene.object().create_update(ContainerUpdates::new()).unwrap();
        scene.insert_element("image", image.clone(), &update).unwrap();
        update.finish(Metadata::new()).unwrap();
        assert_eq!(image.containers().len(), 1);
    }
    assert!(image.containers().is_empty());
    assert!(image.create_update(ContainerUpdates::new()).is_ok());
}

#[test]
fn test_worker_flow_over_bus() {
    let context = context();
    let bus = ObjectBus::new();
    let scene = ContainerData::create(&context, "scene").unwrap();
    let raw = VersionedObject::create(&context, DataKind::TomographyRaw).unwrap();
    bus.export(scene.object());
    bus.export(&raw);
    bus.register_property(PropertyDefinition::new("projections", PropertyType::Int))
        .unwrap();

    let scene_update = scene.object().create_update(ContainerUpdates::new()).unwrap();
    scene.insert_element("raw", raw.clone(), &scene_update).unwrap();
    scene_update.finish(Metadata::new()).unwrap();

    let worker = bus.connect("importer");
    let (_id, events) = worker.subscribe(raw.id()).unwrap();

    let scene_update = worker.create_update(scene.id(), HashMap::new()).unwrap();
    let mut coverage = HashMap::new();
    coverage.insert(scene.id(), scene_update);
    let raw_update = worker.create_update(raw.id(), coverage).unwrap();

    worker
        .set_property(raw_update, "projections", Some(Value::Int(1200)), ReplaceMode::Insert)
        .unwrap();
    assert!(matches!(
        worker.finish(scene_update, Metadata::new()),
        Err(DataError::InvalidOperation(_))
    ));
    worker.finish(raw_update, Metadata::new()).unwrap();
    worker.finish(scene_update, Metadata::new()).unwrap();

    let first = events.recv_timeout(Duration::from_secs(1)).unwrap();
    let second = events.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(first.reason, ChangeReason::NewUpdate);
    assert_eq!(second.reason, ChangeReason::UpdateFinished);
    assert_eq!(second.object, raw.id());

    assert_eq!(
        worker.get_property(raw.id(), "projections", false).unwrap(),
        Some(Value::Int(1200))
    );
    worker.release_update(raw_update).unwrap();
    worker.release_update(scene_update).unwrap();
    assert_eq!(worker.held_updates(), 0);

    let stats = bus.stats();
    assert_eq!(stats.updates_created, 2);
    assert_eq!(stats.updates_finished, 2);
    assert_eq!(stats.updates_released, 2);
}

#[test]
fn test_crashed_worker_aborts_updates() {
    let context = context();
    let bus = ObjectBus::new();
    let series = VersionedObject::create(&context, DataKind::Series).unwrap();
    bus.export(&series);

    let observer = bus.connect("panel");
    let (_id, events) = observer.subscribe(series.id()).unwrap();

    let worker = bus.connect("exporter");
    worker.create_update(series.id(), HashMap::new()).unwrap();
    drop(worker);

    assert_eq!(series.subscriber_count(), 1);
    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(events.len(), 2);
    assert!(events[1].snapshot.metadata().contains_key("Status"));
    assert!(!observer
        .get_current_version(series.id())
        .unwrap()
        .update_is_running());
}

#[test]
fn test_version_token_round_trip_through_text() {
    let context = context();
    let object = VersionedObject::create(&context, DataKind::Custom("Mask".into())).unwrap();
    let update = object.create_update(ContainerUpdates::new()).unwrap();

    let token: VersionToken = object.current_snapshot().version_string().parse().unwrap();
    assert_eq!(token, object.current_snapshot().token());
    assert!(token.is_pending());
    update.finish(Metadata::new()).unwrap();
    assert_eq!(object.kind().to_string(), "Mask");
}

#[test]
fn test_property_values_serialize() {
    let context = context();
    let object = VersionedObject::create(&context, DataKind::Volume).unwrap();
    let lut = PropertyDefinition::new("lut", PropertyType::Bytes);
    let window = PropertyDefinition::new("window", PropertyType::List(Box::new(PropertyType::Float)));

    let update = object.create_update(ContainerUpdates::new()).unwrap();
    update.set_property(&lut, vec![0u8, 128, 255], ReplaceMode::Insert).unwrap();
    update
        .set_property(
            &window,
            Value::Array(vec![Value::Float(-200.0), Value::Float(400.0)]),
            ReplaceMode::Insert,
        )
        .unwrap();
    assert!(matches!(
        update.set_property(&window, "wide", ReplaceMode::InsertOrReplace),
        Err(DataError::TypeMismatch { .. })
    ));
    update.finish(Metadata::new()).unwrap();

    let bytes = object.get_property("lut", false).unwrap().unwrap();
    assert_eq!(bytes.as_bytes(), Some(&[0u8, 128, 255][..]));
    // Bytes travel as tagged base64 text and read back as bytes
    let json = serde_json::to_string(&bytes).unwrap();
    assert_eq!(json, r#"{"Bytes":"AID/"}"#);
    assert_eq!(serde_json::from_str::<Value>(&json).unwrap(), bytes);

    let window_value = object.get_property("window", false).unwrap().unwrap();
    let json = serde_json::to_string(&window_value).unwrap();
    assert_eq!(serde_json::from_str::<Value>(&json).unwrap(), window_value);

    let names: Vec<_> = object.list_properties().iter().map(|d| d.name().to_string()).collect();
    assert_eq!(names, vec!["lut".to_string(), "window".to_string()]);
}
