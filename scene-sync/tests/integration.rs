//! End-to-end tests over a real WebSocket connection.

use futures_util::StreamExt;
use scene_sync::{
    ErrorKind, Operation, OperationType, ProtocolError, Replica, SceneEngine, ServerConfig, ServerMessage,
    SyncClient, SyncEvent, SyncServer, Vec3,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("payload must be an object"),
    }
}

/// Start a server on an ephemeral port; returns its URL and engine.
async fn start_test_server(config: ServerConfig) -> (String, Arc<SceneEngine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = SyncServer::new(ServerConfig {
        bind_addr: addr.to_string(),
        ..config
    });
    let engine = server.engine().clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (format!("ws://{addr}"), engine)
}

async fn connected(url: &str, name: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(name, url);
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    (client, events)
}

/// Next live operation, skipping connection events.
async fn next_operation(events: &mut mpsc::Receiver<SyncEvent>) -> Operation {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("Timeout waiting for operation")
            .expect("Event channel closed");
        if let SyncEvent::Operation(op) = event {
            return op;
        }
    }
}

async fn create_session(client: &SyncClient) -> Uuid {
    let session = Uuid::new_v4();
    client
        .submit(OperationType::SessionCreate, data(json!({ "session_id": session })))
        .await
        .unwrap();
    session
}

#[tokio::test]
async fn test_connect_submit_and_full_sync() {
    let (url, engine) = start_test_server(ServerConfig::default()).await;
    let (client, mut events) = connected(&url, "alice").await;

    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Connected { current_sequence })) => assert_eq!(current_sequence, 0),
        other => panic!("Expected Connected event, got {other:?}"),
    }

    let session = create_session(&client).await;
    let seq = client
        .submit(
            OperationType::ObjectCreate,
            data(json!({ "session_id": session, "name": "beacon", "type": "sphere", "x": 0, "y": 2, "z": 0 })),
        )
        .await
        .unwrap();
    assert_eq!(seq, 2);

    let full = client.full_sync().await.unwrap();
    assert_eq!(full.current_sequence, 2);
    assert_eq!(full.operations.len(), 2);
    assert_eq!(full.operations[1].client_id, "alice");

    let mut replica = Replica::default();
    replica.bootstrap(&full).await.unwrap();
    let beacon = replica.store().get_object(session, "beacon").await.unwrap().unwrap();
    assert_eq!(beacon.position, Vec3::new(0.0, 2.0, 0.0));
    assert_eq!(replica.store().snapshot().await.unwrap(), engine.store().snapshot().await.unwrap());

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.total_operations, 2);
    assert_eq!(stats.current_sequence, 2);
    assert_eq!(stats.connected_clients, 1);
    assert_eq!(stats.by_type.get(&OperationType::ObjectCreate), Some(&1));
}

#[tokio::test]
async fn test_rejections_over_the_wire() {
    let mut config = ServerConfig::default();
    config.engine.max_missing_range = 3;
    let (url, engine) = start_test_server(config).await;
    let (client, _events) = connected(&url, "bob").await;
    let session = create_session(&client).await;

    let err = client
        .submit(
            OperationType::ObjectCreate,
            data(json!({ "session_id": session, "name": "far", "type": "cube", "x": 0, "y": 20, "z": 0 })),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::Rejected { kind: ErrorKind::CoordinateBounds, retryable: false, .. }
    ));

    let err = client.submit_raw("teleport", Map::new()).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Rejected { kind: ErrorKind::Validation, .. }));

    let err = client.subscribe(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Rejected { kind: ErrorKind::NotFound, .. }));

    for tick in 0..3 {
        client
            .submit(
                OperationType::SceneUpdate,
                data(json!({ "session_id": session, "properties": { "tick": tick } })),
            )
            .await
            .unwrap();
    }
    let err = client.missing(1, 10).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Rejected { kind: ErrorKind::Validation, .. }));

    // Correlation survives the rejections.
    client.ping().await.unwrap();
    assert_eq!(client.subscribe(session).await.unwrap(), 4);
    assert_eq!(client.missing(2, 4).await.unwrap().len(), 3);
    assert_eq!(engine.current_sequence(), 4);
}

#[tokio::test]
async fn test_live_events_follow_sequence_order() {
    let (url, _engine) = start_test_server(ServerConfig::default()).await;
    let (writer, _writer_events) = connected(&url, "writer").await;
    let (reader, mut reader_events) = connected(&url, "reader").await;

    let session = create_session(&writer).await;
    assert_eq!(next_operation(&mut reader_events).await.op_type, OperationType::SessionCreate);
    reader.subscribe(session).await.unwrap();

    let mut submitted = Vec::new();
    for i in 0..10 {
        let seq = writer
            .submit(
                OperationType::ObjectCreate,
                data(json!({ "session_id": session, "name": format!("o{i}"), "type": "cube", "x": i, "y": 0, "z": 0 })),
            )
            .await
            .unwrap();
        submitted.push(seq);
    }

    let mut delivered = Vec::new();
    for _ in 0..10 {
        let op = next_operation(&mut reader_events).await;
        assert_eq!(op.session_id(), Some(session));
        delivered.push(op.sequence);
    }
    assert_eq!(delivered, submitted);
}

#[tokio::test]
async fn test_session_events_do_not_leak() {
    let (url, _engine) = start_test_server(ServerConfig::default()).await;
    let (a, mut a_events) = connected(&url, "a").await;
    let (b, mut b_events) = connected(&url, "b").await;

    let s1 = create_session(&a).await;
    let s2 = create_session(&b).await;
    a.subscribe(s1).await.unwrap();
    b.subscribe(s2).await.unwrap();

    a.submit(
        OperationType::ObjectCreate,
        data(json!({ "session_id": s1, "name": "secret", "type": "cube", "x": 0, "y": 0, "z": 0 })),
    )
    .await
    .unwrap();
    let marker = b
        .submit(
            OperationType::ObjectCreate,
            data(json!({ "session_id": s2, "name": "marker", "type": "cube", "x": 0, "y": 0, "z": 0 })),
        )
        .await
        .unwrap();

    // Delivery is in sequence order, so anything leaked from s1 would
    // show up before b's own marker.
    loop {
        let op = next_operation(&mut b_events).await;
        if op.sequence == marker {
            break;
        }
        assert!(
            op.op_type.is_global(),
            "b received a session-scoped operation for another session: {op:?}"
        );
    }

    loop {
        let op = next_operation(&mut a_events).await;
        if !op.op_type.is_global() {
            assert_eq!(op.session_id(), Some(s1));
            break;
        }
    }
}

#[tokio::test]
async fn test_late_joiner_converges() {
    let (url, engine) = start_test_server(ServerConfig::default()).await;
    let (writer, _writer_events) = connected(&url, "writer").await;
    let session = create_session(&writer).await;
    for i in 0..5 {
        writer
            .submit(
                OperationType::ObjectCreate,
                data(json!({ "session_id": session, "name": format!("early{i}"), "type": "cube", "x": i, "y": 1, "z": -1 })),
            )
            .await
            .unwrap();
    }
    writer
        .submit(OperationType::AvatarRegister, data(json!({ "session_id": session, "participant": "writer" })))
        .await
        .unwrap();

    // The late joiner subscribes first, then bootstraps.
    let (late, mut late_events) = connected(&url, "late").await;
    late.subscribe(session).await.unwrap();
    let mut replica = Replica::default();
    replica.bootstrap(&late.full_sync().await.unwrap()).await.unwrap();

    for i in 0..5 {
        writer
            .submit(
                OperationType::AvatarMove,
                data(json!({ "session_id": session, "participant": "writer", "position": { "x": i, "y": 0, "z": 0.5 } })),
            )
            .await
            .unwrap();
        writer
            .submit(
                OperationType::ObjectUpdate,
                data(json!({ "session_id": session, "name": format!("early{i}"), "y": 3.25 })),
            )
            .await
            .unwrap();
    }
    let head = engine.current_sequence();

    while replica.last_applied() < head {
        let op = next_operation(&mut late_events).await;
        replica.ingest(op).await.unwrap();
    }
    assert_eq!(replica.store().snapshot().await.unwrap(), engine.store().snapshot().await.unwrap());

    // A replica with nothing at all catches up purely from missing ranges.
    let mut cold = Replica::default();
    let fetched = late.catch_up(&mut cold, head).await.unwrap();
    assert_eq!(fetched as u64, head);
    assert_eq!(cold.store().snapshot().await.unwrap(), engine.store().snapshot().await.unwrap());
}

#[tokio::test]
async fn test_catch_up_pages_by_server_range_cap() {
    let mut config = ServerConfig::default();
    config.engine.max_missing_range = 5;
    let (url, engine) = start_test_server(config).await;
    let (writer, _writer_events) = connected(&url, "writer").await;
    let session = create_session(&writer).await;
    for i in 0..7 {
        writer
            .submit(
                OperationType::ObjectCreate,
                data(json!({ "session_id": session, "name": format!("crate{i}"), "type": "cube", "x": i, "y": 0, "z": 0 })),
            )
            .await
            .unwrap();
    }

    let mut cold = SyncClient::new("cold", &url);
    let head = cold.connect().await.unwrap();
    assert_eq!(head, 8);
    assert_eq!(cold.max_missing_range(), 5);

    // One request for the whole history exceeds the cap...
    let err = cold.missing(1, head).await.unwrap_err();
    assert!(matches!(err, ProtocolError::Rejected { kind: ErrorKind::Validation, .. }));

    // ...but catch-up splits it into pages the server accepts.
    let mut replica = Replica::default();
    assert_eq!(cold.catch_up(&mut replica, head).await.unwrap(), 8);
    assert_eq!(replica.last_applied(), 8);
    assert_eq!(replica.store().snapshot().await.unwrap(), engine.store().snapshot().await.unwrap());
}

#[tokio::test]
async fn test_max_clients_refused() {
    let config = ServerConfig {
        max_clients: 1,
        ..ServerConfig::default()
    };
    let (url, _engine) = start_test_server(config).await;
    let (first, _events) = connected(&url, "first").await;

    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let frame = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Timeout waiting for refusal")
        .expect("Stream ended")
        .unwrap();
    let refusal = ServerMessage::decode(frame.to_text().unwrap()).unwrap();
    assert!(matches!(
        refusal,
        ServerMessage::Rejected { request_id: None, kind: ErrorKind::Transient, retryable: true, .. }
    ));

    let mut second = SyncClient::new("second", url.as_str()).with_request_timeout(Duration::from_millis(500));
    assert!(second.connect().await.is_err());

    // The admitted client is unaffected.
    first.ping().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_unregisters_client() {
    let (url, engine) = start_test_server(ServerConfig::default()).await;
    let (mut client, _events) = connected(&url, "leaver").await;
    assert_eq!(engine.hub().client_count(), 1);

    client.disconnect().await;
    assert!(matches!(client.ping().await, Err(ProtocolError::NotConnected)));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while engine.hub().client_count() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "client was never unregistered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
