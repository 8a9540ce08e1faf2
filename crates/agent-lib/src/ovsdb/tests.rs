//! Tests for the switch database cache mirror
//!
//! These tests verify:
//! - Decoding and applying table-update notifications
//! - Endpoint add/update/delete events and their ordering
//! - Sync requests issued after every applied batch

use super::*;
use crate::sync::RateLimitingQueue;
use crate::testutil::{self, interface_row, row, BRIDGE_UUID, INTERFACE_UUID, PORT_UUID};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Handler recording every event it receives
#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<EndpointEvent>>,
}

impl RecordingHandler {
    fn events(&self) -> Vec<EndpointEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EndpointEventHandler for RecordingHandler {
    fn handle(&self, event: &EndpointEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn endpoint_interface(mac: &str, ofport: i64) -> Row {
    interface_row(
        "eth0",
        json!(ofport),
        json!(["set", []]),
        json!(["map", [["attached-mac", mac], ["attached-ipv4", "10.0.0.7"]]]),
    )
}

fn interface_update(row: Row) -> TableUpdates {
    let mut updates = TableUpdates::default();
    updates.upsert(INTERFACE_TABLE, INTERFACE_UUID, row);
    updates
}

mod notation_tests {
    use super::*;

    #[test]
    fn test_decode_table_updates() {
        let updates = testutil::topology_updates();

        assert!(updates.touches(BRIDGE_TABLE));
        assert!(updates.touches(INTERFACE_TABLE));
        assert!(!updates.touches("Controller"));

        let port = updates.tables[PORT_TABLE][PORT_UUID].new.as_ref().unwrap();
        assert_eq!(port.refs("interfaces"), vec![INTERFACE_UUID]);
        assert_eq!(port.integers("trunks"), vec![10, 20]);
        assert_eq!(port.optional_integer("tag"), None);
    }

    #[test]
    fn test_reference_column_shapes() {
        let single = Datum::from_json(&json!(["uuid", "a"])).unwrap();
        assert_eq!(single.refs(), Refs::Single("a"));

        let set = Datum::from_json(&json!(["set", [["uuid", "a"], ["uuid", "b"]]])).unwrap();
        assert_eq!(set.refs(), Refs::Set(vec!["a", "b"]));
        assert_eq!(set.refs().flatten(), vec!["a", "b"]);

        let empty = Datum::from_json(&json!(["set", []])).unwrap();
        assert_eq!(empty.refs(), Refs::Empty);
        assert!(empty.refs().flatten().is_empty());
    }

    #[test]
    fn test_malformed_updates_are_rejected() {
        assert!(TableUpdates::from_json(&json!([])).is_err());
        assert!(TableUpdates::from_json(&json!({"Bridge": 5})).is_err());
        assert!(TableUpdates::from_json(&json!({
            "Bridge": {"b": {"new": {"name": ["set", [{"bad": 1}]]}}}
        }))
        .is_err());
        assert!(TableUpdates::try_from(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_required_column_errors() {
        let bridge = row(json!({"name": ["set", []]}));
        assert!(matches!(
            bridge.string(BRIDGE_TABLE, "name"),
            Err(OvsdbError::InvalidColumn { .. })
        ));
        assert!(matches!(
            bridge.string(BRIDGE_TABLE, "datapath_type"),
            Err(OvsdbError::MissingColumn { .. })
        ));
        assert!(bridge.string_map(BRIDGE_TABLE, "external_ids").unwrap().is_empty());
    }

    #[test]
    fn test_join_trunks() {
        assert_eq!(join_trunks(&[]), "");
        assert_eq!(join_trunks(&[10]), "10");
        assert_eq!(join_trunks(&[10, 20, 30]), "10,20,30");
    }
}

mod cache_tests {
    use super::*;

    #[test]
    fn test_apply_insert_modify_delete() {
        let monitor = testutil::topology_monitor();
        assert_eq!(monitor.row_count(), 4);

        let mut updates = TableUpdates::default();
        updates.upsert(BRIDGE_TABLE, BRIDGE_UUID, row(json!({"name": "br-renamed"})));
        monitor.apply_table_updates(&updates);
        let name = monitor.locked_access(|cache| {
            cache
                .row(BRIDGE_TABLE, BRIDGE_UUID)
                .and_then(|r| r.optional_str("name"))
                .map(str::to_string)
        });
        assert_eq!(name.as_deref(), Some("br-renamed"));

        let mut updates = TableUpdates::default();
        updates.delete(BRIDGE_TABLE, BRIDGE_UUID);
        monitor.apply_table_updates(&updates);
        assert_eq!(monitor.row_count(), 3);
    }

    #[test]
    fn test_locked_access_propagates_errors() {
        let monitor = testutil::topology_monitor();

        let result: Result<(), OvsdbError> = monitor.locked_access(|cache| {
            cache.require_row(PORT_TABLE, "missing")?;
            Ok(())
        });
        assert!(matches!(result, Err(OvsdbError::RowNotFound { .. })));

        // The lock is released on the error path
        assert_eq!(monitor.row_count(), 4);
    }
}

mod endpoint_tests {
    use super::*;

    #[test]
    fn test_interface_without_attached_mac_is_not_an_endpoint() {
        let monitor = testutil::topology_monitor();
        let endpoints = monitor.locked_access(collect_endpoints);
        assert!(endpoints.is_empty());
    }

    #[test]
    fn test_endpoint_lifecycle_events() {
        let monitor = testutil::topology_monitor();
        let handler = Arc::new(RecordingHandler::default());
        monitor.register_event_handler(handler.clone());

        let added = monitor.apply_table_updates(&interface_update(endpoint_interface(
            "aa:bb:cc:dd:ee:01",
            5,
        )));
        assert_eq!(added.len(), 1);
        let EndpointEvent::Added(endpoint) = &added[0] else {
            panic!("expected added event, got {:?}", added[0]);
        };
        assert_eq!(endpoint.interface_uuid, INTERFACE_UUID);
        assert_eq!(endpoint.interface_name, "eth0");
        assert_eq!(endpoint.bridge_name, "br0");
        assert_eq!(endpoint.mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(endpoint.port_no, 5);
        assert_eq!(endpoint.trunk, "10,20");
        assert_eq!(endpoint.ipv4, Some("10.0.0.7".parse().unwrap()));

        let updated = monitor.apply_table_updates(&interface_update(endpoint_interface(
            "aa:bb:cc:dd:ee:02",
            5,
        )));
        assert!(matches!(
            &updated[0],
            EndpointEvent::Updated { old, new }
                if old.mac == "aa:bb:cc:dd:ee:01" && new.mac == "aa:bb:cc:dd:ee:02"
        ));

        // Unchanged row: no event
        assert!(monitor
            .apply_table_updates(&interface_update(endpoint_interface("aa:bb:cc:dd:ee:02", 5)))
            .is_empty());

        let mut updates = TableUpdates::default();
        updates.delete(INTERFACE_TABLE, INTERFACE_UUID);
        let deleted = monitor.apply_table_updates(&updates);
        assert!(matches!(&deleted[0], EndpointEvent::Deleted(ep) if ep.port_no == 5));

        let kinds: Vec<_> = handler.events().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["added", "updated", "deleted"]);
    }

    #[test]
    fn test_interface_error_removes_endpoint() {
        let monitor = testutil::topology_monitor();
        monitor.apply_table_updates(&interface_update(endpoint_interface("aa:bb:cc:dd:ee:01", 5)));

        let events = monitor.apply_table_updates(&interface_update(interface_row(
            "eth0",
            json!(5),
            json!("no such device"),
            json!(["map", [["attached-mac", "aa:bb:cc:dd:ee:01"]]]),
        )));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "deleted");
    }

    #[test]
    fn test_events_dispatched_in_interface_order() {
        let monitor = testutil::topology_monitor();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        monitor.register_event_handler(Arc::new(move |event: &EndpointEvent| {
            recorder.lock().unwrap().push(event.key().to_string());
        }));

        let mut updates = TableUpdates::default();
        updates.upsert(
            PORT_TABLE,
            PORT_UUID,
            row(json!({
                "name": "p0",
                "interfaces": ["set", [["uuid", "iface-c"], ["uuid", "iface-a"], ["uuid", "iface-b"]]]
            })),
        );
        for (uuid, ofport) in [("iface-c", 3), ("iface-a", 1), ("iface-b", 2)] {
            updates.upsert(
                INTERFACE_TABLE,
                uuid,
                interface_row(
                    uuid,
                    json!(ofport),
                    json!(["set", []]),
                    json!(["map", [["attached-mac", format!("aa:bb:cc:dd:ee:0{}", ofport)]]]),
                ),
            );
        }
        monitor.apply_table_updates(&updates);

        assert_eq!(*seen.lock().unwrap(), vec!["iface-a", "iface-b", "iface-c"]);
    }
}

mod monitor_tests {
    use super::*;
    use crate::health::{components, ComponentStatus, HealthRegistry};

    #[tokio::test]
    async fn test_every_batch_requests_sync() {
        let monitor = OvsdbMonitor::new();
        let queue = Arc::new(RateLimitingQueue::new());
        monitor.set_sync_queue(queue.clone(), "node-a");

        monitor.apply_table_updates(&testutil::topology_updates());
        monitor.apply_table_updates(&TableUpdates::default());

        // Collapsed into one pending item
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_run_applies_updates_until_shutdown() {
        let monitor = Arc::new(OvsdbMonitor::new());
        let (updates_tx, updates_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(Arc::clone(&monitor).run(updates_rx, shutdown_rx));
        updates_tx.send(testutil::topology_updates()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while monitor.row_count() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_when_source_closes() {
        let registry = HealthRegistry::new();
        registry.register(components::OVSDB_MONITOR).await;
        registry.set_ready(true).await;
        let monitor = Arc::new(OvsdbMonitor::new());
        monitor.set_health(registry.clone());
        let (updates_tx, updates_rx) = mpsc::channel::<TableUpdates>(1);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(monitor.run(updates_rx, shutdown_rx));
        drop(updates_tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            registry.status(components::OVSDB_MONITOR).await,
            Some(ComponentStatus::Unhealthy)
        );
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_mirror_healthy() {
        let registry = HealthRegistry::new();
        registry.register(components::OVSDB_MONITOR).await;
        let monitor = Arc::new(OvsdbMonitor::new());
        monitor.set_health(registry.clone());
        let (_updates_tx, updates_rx) = mpsc::channel::<TableUpdates>(1);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(monitor.run(updates_rx, shutdown_rx));
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            registry.status(components::OVSDB_MONITOR).await,
            Some(ComponentStatus::Healthy)
        );
    }
}
