//! Multi-device scenarios driven through the public client API.

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use studysync_engine::{
    ChannelEvent, ConflictChoice, ConnectionState, ManualClock, MockChannel, SyncClient,
    SyncConfig, SyncNotification, ABNORMAL_CLOSE, ANY, AUTH_REJECTED, CONFLICT, CONNECTED,
    DEFAULT_DEVICE_KEY,
};
use studysync_protocol::{Annotation, EventPayload, SyncEvent};
use studysync_storage::{FileStore, InMemoryStore, KeyValueStore};
use tempfile::tempdir;

struct Device {
    client: SyncClient<MockChannel>,
    channel: MockChannel,
    seen: Arc<Mutex<Vec<SyncNotification>>>,
}

impl Device {
    fn new(id: &str, start_hour: u32) -> Self {
        let store = Arc::new(InMemoryStore::with_entries([(DEFAULT_DEVICE_KEY, id)]));
        Self::with_store(store, start_hour)
    }

    fn with_store(store: Arc<dyn KeyValueStore>, start_hour: u32) -> Self {
        let channel = MockChannel::new();
        let clock = Arc::new(ManualClock::starting_at(
            Utc.with_ymd_and_hms(2024, 5, 1, start_hour, 0, 0).unwrap(),
        ));
        let config = SyncConfig::from_endpoint("wss://sync.example.com/ws").unwrap();
        let client = SyncClient::with_clock(config, channel.clone(), store, clock);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        client.on(ANY, move |n| s.lock().push(n.clone()));

        Self {
            client,
            channel,
            seen,
        }
    }

    fn online(mut self, token: &str) -> Self {
        self.client.connect(token);
        self.client.handle_channel_event(ChannelEvent::Opened);
        self
    }

    fn receive(&mut self, frame: String) {
        self.client.handle_channel_event(ChannelEvent::Message(frame));
    }

    fn names(&self) -> Vec<String> {
        self.seen.lock().iter().map(|n| n.name().to_string()).collect()
    }
}

/// Moves every frame `from` has sent into `to`.
fn relay(from: &Device, to: &mut Device) -> usize {
    let frames = from.channel.take_sent();
    let count = frames.len();
    for frame in frames {
        to.receive(frame);
    }
    count
}

#[test]
fn offline_annotation_reaches_second_device() {
    let mut a = Device::new("A", 8);
    let mut b = Device::new("B", 8).online("tok-b");

    let sent = a
        .client
        .sync_annotation("img7", vec![Annotation::new("x").with_field("x", 10)]);
    assert_eq!(a.client.pending_events(), 1);
    assert!(a.channel.sent_frames().is_empty());

    a.client.connect("tok1");
    assert_eq!(a.channel.open_targets()[0].param("token").as_deref(), Some("tok1"));
    a.client.handle_channel_event(ChannelEvent::Opened);

    let frames = a.channel.sent_frames();
    assert_eq!(frames.len(), 1);
    let wire: Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(
        wire,
        json!({
            "type": "sync:annotations",
            "payload": { "imageId": "img7", "annotations": [{ "id": "x", "x": 10 }] },
            "deviceId": "A",
            "timestamp": sent.timestamp.as_str(),
        })
    );

    assert_eq!(relay(&a, &mut b), 1);
    assert!(b.client.conflicts().is_empty());
    assert_eq!(
        b.client.annotations_for("img7").unwrap().annotations,
        vec![Annotation::new("x").with_field("x", 10)]
    );
    assert_eq!(b.names(), vec![CONNECTED, "sync:annotations"]);
}

#[test]
fn offline_events_flush_exactly_once_in_order() {
    let mut a = Device::new("A", 8);
    let first = a.client.sync_progress("c1", json!({ "step": 1 }));
    let second = a.client.sync_bookmark("c1", true);
    let third = a.client.sync_progress("c2", json!({ "step": 7 }));
    assert_eq!(a.client.pending_events(), 3);

    let a = a.online("tok1");
    assert_eq!(a.channel.sent_events(), vec![first, second, third]);
    assert_eq!(a.client.pending_events(), 0);
    assert_eq!(a.client.state(), ConnectionState::Connected);

    // A second open after a drop must not resend anything.
    let mut a = a;
    a.client.handle_channel_event(ChannelEvent::Closed {
        code: ABNORMAL_CLOSE,
        reason: "drop".into(),
    });
    a.client.fire_scheduled_retry();
    a.client.handle_channel_event(ChannelEvent::Opened);
    assert_eq!(a.channel.sent_frames().len(), 3);
}

#[test]
fn queue_survives_restart_on_disk() {
    let dir = tempdir().unwrap();
    let device_id;
    let queued;
    {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let mut a = Device::with_store(store, 8);
        device_id = a.client.device_id().clone();
        queued = vec![
            a.client.sync_progress("c1", json!(1)),
            a.client.sync_progress("c2", json!(2)),
            a.client.sync_bookmark("c3", false),
        ];
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let a = Device::with_store(Arc::clone(&store), 9);
    assert_eq!(a.client.device_id(), &device_id);
    assert_eq!(a.client.pending_events(), 3);

    let a = a.online("tok1");
    assert_eq!(a.channel.sent_events(), queued);

    let after = Device::with_store(store, 10);
    assert_eq!(after.client.pending_events(), 0);
}

#[test]
fn own_events_echoed_back_are_ignored() {
    let mut a = Device::new("A", 8).online("tok1");
    a.client.sync_progress("c1", json!(1));
    let echoed = a.channel.take_sent();

    a.seen.lock().clear();
    for frame in echoed {
        a.receive(frame);
    }
    assert!(a.seen.lock().is_empty());
}

#[test]
fn older_remote_annotation_still_conflicts() {
    // B's clock runs an hour behind A's.
    let mut a = Device::new("A", 9).online("tok-a");
    let mut b = Device::new("B", 8).online("tok-b");

    a.client
        .sync_annotation("img1", vec![Annotation::new("f1").with_field("label", "nodule")]);
    a.channel.take_sent();

    b.client
        .sync_annotation("img1", vec![Annotation::new("f1").with_field("label", "cyst")]);
    relay(&b, &mut a);

    let conflicts = a.client.conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].local_version.fields["label"], "nodule");
    assert_eq!(conflicts[0].remote_version.fields["label"], "cyst");
    assert_eq!(a.names().iter().filter(|n| *n == CONFLICT).count(), 1);
}

#[test]
fn resolving_local_sends_once_and_remote_sends_nothing() {
    let mut a = Device::new("A", 8).online("tok-a");
    let mut b = Device::new("B", 8).online("tok-b");

    a.client.sync_annotation(
        "img1",
        vec![
            Annotation::new("f1").with_field("v", "a1"),
            Annotation::new("f2").with_field("v", "a2"),
        ],
    );
    a.channel.take_sent();

    b.client.sync_annotation(
        "img1",
        vec![
            Annotation::new("f1").with_field("v", "b1"),
            Annotation::new("f2").with_field("v", "b2"),
        ],
    );
    relay(&b, &mut a);

    let conflicts = a.client.conflicts();
    assert_eq!(conflicts.len(), 2);
    let (keep_local, take_remote) = (&conflicts[0], &conflicts[1]);

    a.client
        .resolve_conflict(&keep_local.id, ConflictChoice::Local)
        .unwrap();
    let sent = a.channel.sent_events();
    assert_eq!(sent.len(), 1);
    match &sent[0].payload {
        EventPayload::Annotations(p) => {
            assert_eq!(p.image_id, "img1");
            assert_eq!(p.annotations, vec![Annotation::new("f1").with_field("v", "a1")]);
        }
        other => panic!("unexpected payload {other:?}"),
    }

    a.client
        .resolve_conflict(&take_remote.id, ConflictChoice::Remote)
        .unwrap();
    assert_eq!(a.channel.sent_frames().len(), 1);
    assert!(a.client.conflicts().is_empty());

    let state = a.client.annotations_for("img1").unwrap();
    assert_eq!(state.annotations[0].fields["v"], "a1");
    assert_eq!(state.annotations[1].fields["v"], "b2");

    // The re-sent local version reaches B as a fresh conflict on B's side.
    relay(&a, &mut b);
    assert_eq!(b.client.conflicts().len(), 1);
}

#[test]
fn unknown_conflict_reports_failure() {
    let mut a = Device::new("A", 8).online("tok-a");
    assert!(a
        .client
        .resolve_conflict("no-such-conflict", ConflictChoice::Local)
        .is_err());
    assert!(a.channel.sent_frames().is_empty());
}

#[test]
fn catchup_goes_through_the_same_path() {
    let mut a = Device::new("A", 9).online("tok-a");
    a.client
        .sync_annotation("img1", vec![Annotation::new("f1").with_field("v", 1)]);
    let own = a.channel.take_sent().remove(0);

    let remote_annotation = json!({
        "type": "sync:annotations",
        "payload": { "imageId": "img1", "annotations": [{ "id": "f1", "v": 2 }] },
        "deviceId": "B",
        "timestamp": "2024-05-01T07:00:00.000Z"
    });
    let old_progress = json!({
        "type": "sync:progress",
        "payload": { "caseId": "c1", "data": { "step": 1 } },
        "deviceId": "B",
        "timestamp": "2024-05-01T07:00:01.000Z"
    });
    let new_progress = json!({
        "type": "sync:progress",
        "payload": { "caseId": "c1", "data": { "step": 2 } },
        "deviceId": "C",
        "timestamp": "2024-05-01T07:00:02.000Z"
    });
    let catchup = json!({
        "type": "catchup",
        "payload": { "events": [
            remote_annotation,
            new_progress,
            old_progress,
            serde_json::from_str::<Value>(&own).unwrap(),
        ]}
    });

    a.seen.lock().clear();
    a.receive(catchup.to_string());

    assert_eq!(a.client.conflicts().len(), 1);
    assert_eq!(
        a.names(),
        vec![CONFLICT, "sync:annotations", "sync:progress", "catchup"]
    );
    let seen = a.seen.lock();
    let SyncNotification::Event(SyncEvent {
        payload: EventPayload::Progress(progress),
        ..
    }) = &seen[2]
    else {
        panic!("expected progress event");
    };
    assert_eq!(progress.data, json!({ "step": 2 }));
}

#[test]
fn auth_rejection_needs_fresh_connect() {
    let mut a = Device::new("A", 8).online("tok-a");
    a.client.handle_channel_event(ChannelEvent::Closed {
        code: 4001,
        reason: "expired".into(),
    });

    assert!(a.names().contains(&AUTH_REJECTED.to_string()));
    assert!(a.client.scheduled_retry().is_none());

    a.client.sync_bookmark("c1", true);
    assert_eq!(a.client.pending_events(), 1);

    a.client.connect("tok-b");
    a.client.handle_channel_event(ChannelEvent::Opened);
    assert_eq!(a.client.pending_events(), 0);
    assert_eq!(a.channel.open_count(), 2);
}

#[test]
fn malformed_frames_are_dropped_quietly() {
    let mut a = Device::new("A", 8).online("tok-a");
    a.seen.lock().clear();

    a.receive("garbage".into());
    a.receive(r#"{"type":"sync:bookmarks","payload":{"caseId":1},"deviceId":"B","timestamp":"2024-05-01T08:00:00.000Z"}"#.into());
    a.receive(r#"{"type":"sync:progress","payload":{"caseId":"c","data":1},"deviceId":"B","timestamp":"soon"}"#.into());

    assert!(a.seen.lock().is_empty());
    assert_eq!(a.client.stats().malformed_frames, 3);
    assert_eq!(a.client.state(), ConnectionState::Connected);
}
