//! The server's response bodies decode into the replica's provider types.

use shelf_engine::{
    Conflict, DomainEvent, EventPayload, ItemEvent, ItemSnapshot, VectorClock,
};
use shelf_replica::provider::{DeviceInfo, PullResult, PushResult};
use shelf_server::db::DeviceRecord;
use shelf_server::handlers::{LatestResponse, PullResponse, PushResponse, ResolveResponse};
use shelf_server::websocket::ServerMessage;
use uuid::Uuid;

fn created(device: &str, counter: u64, title: &str) -> DomainEvent {
    let mut clock = VectorClock::new();
    for _ in 0..counter {
        clock.increment(device);
    }
    DomainEvent::new(
        Uuid::new_v4(),
        device,
        1_706_745_600_000 + counter * 1000,
        1,
        clock,
        EventPayload::Item(ItemEvent::Created(ItemSnapshot::titled(title))),
    )
}

#[test]
fn push_response_matches_push_result() {
    let stored = created("device-1", 1, "Dune");
    let mut pushed = stored.clone();
    pushed.clock.increment("device-1");
    let conflict = Conflict::detect(&pushed, &stored).unwrap();

    let response = PushResponse {
        success_count: 1,
        failure_count: 1,
        accepted: vec![Uuid::new_v4()],
        conflicts: vec![conflict.clone()],
        server_timestamp: 9,
    };
    let json = serde_json::to_value(&response).unwrap();
    assert!(json.get("successCount").is_some());
    assert!(json.get("serverTimestamp").is_some());

    let decoded: PushResult = serde_json::from_value(json).unwrap();
    assert_eq!(decoded.success_count, 1);
    assert_eq!(decoded.failure_count, 1);
    assert_eq!(decoded.accepted, response.accepted);
    assert_eq!(decoded.conflicts, vec![conflict]);
    assert_eq!(decoded.server_timestamp, 9);
}

#[test]
fn pull_response_matches_pull_result() {
    let events = vec![created("device-1", 1, "Dune"), created("device-2", 1, "Emma")];
    let response = PullResponse {
        events: events.clone(),
        has_more: true,
        server_timestamp: 2,
    };

    let decoded: PullResult =
        serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
    assert_eq!(decoded.events, events);
    assert!(decoded.has_more);
    assert_eq!(decoded.server_timestamp, 2);
}

#[test]
fn latest_and_resolve_bodies() {
    let json = serde_json::to_value(LatestResponse { server_timestamp: 3 }).unwrap();
    assert_eq!(json, serde_json::json!({ "serverTimestamp": 3 }));

    let event = created("device-1", 2, "Dune");
    let json = serde_json::to_value(ResolveResponse {
        events: vec![event.clone()],
    })
    .unwrap();
    let events: Vec<DomainEvent> = serde_json::from_value(json["events"].clone()).unwrap();
    assert_eq!(events, vec![event]);
}

#[test]
fn device_records_match_device_info() {
    let info = DeviceInfo {
        device_id: "device-1".into(),
        name: "Kitchen tablet".into(),
        platform: "android".into(),
        last_seen: 1_706_745_600_000,
    };
    let record: DeviceRecord =
        serde_json::from_str(&serde_json::to_string(&info).unwrap()).unwrap();
    assert_eq!(record.device_id, "device-1");
    assert_eq!(record.last_seen, info.last_seen);

    let back: DeviceInfo = serde_json::from_value(serde_json::to_value(&record).unwrap()).unwrap();
    assert_eq!(back, info);
}

#[test]
fn events_available_carries_full_events() {
    let event = created("device-1", 1, "Dune");
    let msg = ServerMessage::events_available(vec![event.clone()], 4);
    let json = serde_json::to_value(&msg).unwrap();

    assert_eq!(json["type"], "events_available");
    assert_eq!(json["server_timestamp"], 4);
    let events: Vec<DomainEvent> = serde_json::from_value(json["events"].clone()).unwrap();
    assert_eq!(events, vec![event]);
}

#[test]
fn push_message_decodes() {
    use shelf_server::websocket::ClientMessage;

    let event = created("device-1", 1, "Dune");
    let json = serde_json::json!({
        "type": "push",
        "events": [event.clone()],
        "request_id": "req-7",
    });
    match serde_json::from_value::<ClientMessage>(json).unwrap() {
        ClientMessage::Push { events, request_id } => {
            assert_eq!(events, vec![event]);
            assert_eq!(request_id.as_deref(), Some("req-7"));
        }
        _ => panic!("Expected Push message"),
    }
}
