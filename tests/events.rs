mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{wait_until, TestServer};
use tessera::device::{DeviceInfo, DeviceKind};
use tessera::ipc::protocol::{Event, QueuedEvent};
use tessera::shm::ActivePair;

fn state_changes(events: &[QueuedEvent]) -> Vec<(bool, bool)> {
    events
        .iter()
        .filter_map(|e| match e.event {
            Event::StateChange { visible, focused } => Some((visible, focused)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_switching_active_session_notifies_both() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();
    let (ida, idb) = (a.session_id(), b.session_id());

    a.begin_session().unwrap();
    assert_eq!(state_changes(&a.take_events()), vec![(true, true)]);
    assert_eq!(
        server.handle.active(),
        ActivePair {
            current: Some(ida),
            previous: None
        }
    );

    b.begin_session().unwrap();
    assert!(b.take_events().is_empty());

    b.set_active_client(idb).unwrap();
    assert_eq!(state_changes(&b.take_events()), vec![(true, true)]);
    assert_eq!(a.poll_events().unwrap(), 1);
    assert_eq!(state_changes(&a.take_events()), vec![(false, false)]);
    assert_eq!(
        server.handle.active(),
        ActivePair {
            current: Some(idb),
            previous: Some(ida)
        }
    );

    // The old session stays on screen until the new one publishes.
    assert_eq!(server.handle.composited_session(), Some(ida));
    let frame = b.predict_frame().unwrap().frame_id;
    b.submit_frame(frame, &[]).unwrap();
    assert_eq!(server.handle.composited_session(), Some(idb));
    assert_eq!(b.shm().composited_session(), Some(idb));

    // Activating the active session again changes nothing.
    b.set_active_client(idb).unwrap();
    assert!(b.take_events().is_empty());
    server.stop();
}

#[test]
fn test_disconnect_falls_back_to_previous_session() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();
    let (ida, idb) = (a.session_id(), b.session_id());
    a.begin_session().unwrap();
    b.begin_session().unwrap();
    b.set_active_client(idb).unwrap();
    a.poll_events().unwrap();
    a.take_events();

    drop(b);
    assert!(wait_until(|| server.handle.active().current == Some(ida)));
    assert_eq!(server.handle.active().previous, None);
    assert_eq!(a.poll_events().unwrap(), 1);
    assert_eq!(state_changes(&a.take_events()), vec![(true, true)]);

    a.end_session().unwrap();
    assert_eq!(server.handle.active(), ActivePair::NONE);
    server.stop();
}

#[test]
fn test_overflow_keeps_newest_events() {
    let server = TestServer::with_config(|c| c.event_queue_capacity = 4);
    let mut conn = server.connect();
    assert_eq!(conn.poll_events().unwrap(), 0);

    for serial in 0..5 {
        let index = server
            .handle
            .attach_device(DeviceInfo::new("pad", DeviceKind::Controller, serial))
            .unwrap();
        server.handle.detach_device(index).unwrap();
    }

    assert_eq!(conn.poll_events().unwrap(), 4);
    let events = conn.take_events();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![7, 8, 9, 10]);
    let connected: Vec<bool> = events
        .iter()
        .map(|e| match e.event {
            Event::DeviceChanged { connected, .. } => connected,
            other => panic!("unexpected event {:?}", other),
        })
        .collect();
    assert_eq!(connected, vec![true, false, true, false]);
    server.stop();
}

#[test]
fn test_refresh_rate_change_reaches_sessions() {
    let server = TestServer::start();
    let mut conn = server.connect();
    conn.begin_session().unwrap();
    conn.take_events();

    server.handle.set_refresh_rate(90.0).unwrap();
    assert_eq!(conn.poll_events().unwrap(), 1);
    assert_eq!(
        conn.take_events()[0].event,
        Event::RefreshRateChanged {
            from_mhz: 60_000,
            to_mhz: 90_000
        }
    );
    assert_eq!(conn.shm().timing().period_ns, 11_111_111);
    assert_eq!(conn.predict_frame().unwrap().period_ns, 11_111_111);
    server.stop();
}

#[test]
fn test_wait_for_event() {
    let server = TestServer::start();
    let mut conn = server.connect();
    assert_eq!(conn.poll_events().unwrap(), 0);

    let started = Instant::now();
    assert_eq!(conn.wait_for_event(Duration::from_millis(50)).unwrap(), 0);
    assert!(started.elapsed() >= Duration::from_millis(40));

    let handle = server.handle.clone();
    let waiter = thread::spawn(move || {
        let count = conn.wait_for_event(Duration::from_secs(5)).unwrap();
        (count, conn.take_events())
    });
    thread::sleep(Duration::from_millis(50));
    handle
        .attach_device(DeviceInfo::new("tracker", DeviceKind::Tracker, 1))
        .unwrap();

    let (count, events) = waiter.join().unwrap();
    assert_eq!(count, 1);
    assert!(matches!(
        events[0].event,
        Event::DeviceChanged {
            connected: true,
            ..
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(4));
    server.stop();
}

#[test]
fn test_shutdown_notifies_sessions() {
    let server = TestServer::start();
    let mut conn = server.connect();
    conn.begin_session().unwrap();
    conn.take_events();

    server.handle.request_shutdown();
    conn.wait_closed().unwrap();
    let events = conn.take_events();
    assert!(events
        .iter()
        .any(|e| e.event == Event::SessionLossPending));
    server.wait_exit();
}
