#![allow(dead_code)]

use interactify_rtc::mock::{MockConnectionFactory, MockMediaDevices, MockRelay};
use interactify_rtc::{ConnectionStatus, RtcConfig, SessionEvent, SessionEvents, SessionHandle, SessionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Party {
    pub id: String,
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub factory: Arc<MockConnectionFactory>,
    pub devices: Arc<MockMediaDevices>,
    pub task: JoinHandle<()>,
}

pub fn party(relay: &MockRelay, id: &str, has_camera: bool) -> Party {
    party_with(relay, id, has_camera, RtcConfig::default())
}

pub fn party_with(relay: &MockRelay, id: &str, has_camera: bool, config: RtcConfig) -> Party {
    let (link, inbound) = relay.connect(id);
    let factory = Arc::new(MockConnectionFactory::new());
    let devices = Arc::new(MockMediaDevices::new(has_camera));
    let (events, rx) = SessionEvents::channel();
    let registry = SessionRegistry::new(config, Arc::new(link), factory.clone(), devices.clone(), events);
    let (handle, task) = registry.spawn(inbound);
    Party {
        id: id.to_string(),
        handle,
        events: rx,
        factory,
        devices,
        task,
    }
}

/// Collects events until `done` is satisfied by everything seen so far.
pub async fn collect_until(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut done: impl FnMut(&[SessionEvent]) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(WAIT, async {
        while !done(&seen) {
            match rx.recv().await {
                Some(event) => seen.push(event),
                None => break,
            }
        }
    })
    .await;
    assert!(result.is_ok(), "timed out, events so far: {seen:?}");
    seen
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

pub fn is_connected(events: &[SessionEvent]) -> bool {
    events
        .iter()
        .any(|e| matches!(e, SessionEvent::Status(ConnectionStatus::Connected)))
}

/// Streams reported for `remote` with the given number of tracks.
pub fn streams_from(events: &[SessionEvent], remote: &str, tracks: usize) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(e, SessionEvent::Stream { remote_id, stream }
                if remote_id == remote && stream.tracks.len() == tracks)
        })
        .count()
}

/// Joins both parties to `room` and waits until each side is connected and
/// has received the other's stream. `from_b` and `from_a` are the track
/// counts each side expects to receive.
pub async fn connect_pair(
    a: &mut Party,
    b: &mut Party,
    room: &str,
    from_b: usize,
    from_a: usize,
) -> (Vec<SessionEvent>, Vec<SessionEvent>) {
    a.handle.join(room).await.expect("a joins");
    b.handle.join(room).await.expect("b joins");

    let b_id = b.id.clone();
    let a_id = a.id.clone();
    let a_events = collect_until(&mut a.events, |seen| {
        is_connected(seen) && streams_from(seen, &b_id, from_b) > 0
    })
    .await;
    let b_events = collect_until(&mut b.events, |seen| {
        is_connected(seen) && streams_from(seen, &a_id, from_a) > 0
    })
    .await;
    (a_events, b_events)
}

/// Lets in-flight signaling settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
