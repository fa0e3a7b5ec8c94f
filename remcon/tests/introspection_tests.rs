use std::sync::Arc;

use remcon::config::EngineConfig;
use remcon::error::EngineError;
use remcon::local::LocalEndpoint;
use remcon::locator::{OwnerId, ResourceLocator};
use remcon::schema::AttributeDescriptor;
use remcon::ServerConnection;
use serde_json::json;

fn runtime() -> OwnerId {
    OwnerId::new("app:type=Runtime").unwrap()
}

fn attribute(path: &str) -> ResourceLocator {
    ResourceLocator::attribute("app:type=Runtime", path).unwrap()
}

fn endpoint_with_runtime() -> Arc<LocalEndpoint> {
    let endpoint = Arc::new(LocalEndpoint::new());
    endpoint.register_owner(runtime());
    endpoint
        .add_attribute(
            &runtime(),
            AttributeDescriptor::scalar("Pid", "long").with_writable(true),
            json!(41),
        )
        .unwrap();
    endpoint
        .add_attribute(
            &runtime(),
            AttributeDescriptor::composite_dynamic("Heap"),
            json!({"used": 10, "limits": {"soft": 1, "hard": 2}}),
        )
        .unwrap();
    endpoint
}

#[test]
fn introspection_costs_one_schema_query_and_one_discovery_sample() {
    let endpoint = endpoint_with_runtime();
    let conn = ServerConnection::new(endpoint.clone(), EngineConfig::default());

    let set = conn.resource_set(&runtime()).unwrap();
    assert!(set.contains(&attribute("Pid")));
    assert!(set.contains(&attribute("Heap")));
    assert!(set.contains(&attribute("Heap#used")));
    assert!(set.contains(&attribute("Heap#limits#soft")));
    assert!(set.contains(&attribute("Heap#limits#hard")));

    // Repeat lookups are answered from the cache.
    conn.resource_set(&runtime()).unwrap();
    assert!(conn.is_available(&attribute("Heap#used")));
    let stats = endpoint.stats();
    assert_eq!(stats.schema_queries, 1);
    assert_eq!(stats.single_reads, 1);
}

#[test]
fn disabled_sampling_defers_composite_discovery_to_the_first_read() {
    let endpoint = endpoint_with_runtime();
    let config = EngineConfig::default().with_introspection_sampling(false);
    let conn = ServerConnection::new(endpoint.clone(), config);

    let set = conn.resource_set(&runtime()).unwrap();
    assert!(set.contains(&attribute("Heap")));
    assert!(!set.contains(&attribute("Heap#used")));
    assert!(!conn.is_available(&attribute("Heap#used")));
    assert_eq!(endpoint.stats().single_reads, 0);

    // The first base read feeds the sampled structure back into the cache.
    conn.read_one(&attribute("Heap")).unwrap();
    assert!(conn.is_available(&attribute("Heap#used")));
    assert!(conn
        .resource_set(&runtime())
        .unwrap()
        .contains(&attribute("Heap#limits#hard")));
    assert_eq!(endpoint.stats().schema_queries, 1);
}

#[test]
fn unresolved_locators_are_omitted_from_batch_results() {
    let endpoint = endpoint_with_runtime();
    let conn = ServerConnection::new(endpoint.clone(), EngineConfig::default());

    let requested = vec![
        attribute("Pid"),
        attribute("Heap#missing"),
        attribute("Nope"),
    ];
    let results = conn.read_many(&requested);

    assert_eq!(results.len(), 1);
    assert_eq!(results[&attribute("Pid")], Ok(json!(41)));
    assert_eq!(endpoint.stats().batch_reads, 1);
}

#[test]
fn transport_failures_mark_every_locator_of_the_owner() {
    let endpoint = endpoint_with_runtime();
    let conn = ServerConnection::new(endpoint.clone(), EngineConfig::default());
    conn.resource_set(&runtime()).unwrap();

    endpoint.set_offline(true);
    let requested = vec![attribute("Pid"), attribute("Heap#used")];
    let results = conn.read_many(&requested);

    assert_eq!(results.len(), 2);
    for locator in &requested {
        assert!(matches!(
            results[locator],
            Err(EngineError::TransientFailure(_))
        ));
    }
}

#[test]
fn nested_reads_follow_multi_level_paths() {
    let endpoint = endpoint_with_runtime();
    let conn = ServerConnection::new(endpoint, EngineConfig::default());

    assert_eq!(conn.read_one(&attribute("Heap#limits#hard")).unwrap(), json!(2));
    assert!(matches!(
        conn.read_one(&attribute("Heap#limits#missing")),
        Err(EngineError::ResourceNotFound { .. })
    ));
}

#[test]
fn writes_reach_base_attributes_only() {
    let endpoint = endpoint_with_runtime();
    let conn = ServerConnection::new(endpoint, EngineConfig::default());

    conn.write_one(&attribute("Pid"), json!(42)).unwrap();
    assert_eq!(conn.read_one(&attribute("Pid")).unwrap(), json!(42));

    assert!(matches!(
        conn.write_one(&attribute("Heap#used"), json!(0)),
        Err(EngineError::NotWritable { .. })
    ));
    assert!(matches!(
        conn.write_one(&attribute("Heap"), json!({})),
        Err(EngineError::NotWritable { .. })
    ));
}
