mod common;

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use common::{swapchain_args, wait_until, TestServer};
use tessera::error::ResultCode;
use tessera::ipc::protocol::{ClientFlags, Layer};
use tessera::ipc::{ClientError, Connection};

#[test]
fn test_frames_are_published_and_slots_are_reused() {
    let server = TestServer::start();
    let mut conn = server.connect();
    assert_eq!(conn.session_id(), 0);
    assert_eq!(conn.shm().header().magic, tessera::shm::layout::SHM_MAGIC);

    conn.set_client_info(4242, "lifecycle").unwrap();
    conn.begin_session().unwrap();
    let swapchain = conn.create_swapchain(&swapchain_args(64, 64, 2)).unwrap();
    assert_eq!(swapchain.index, 0);
    assert_eq!(swapchain.images.len(), 2);
    assert_eq!(swapchain.image_size, 64 * 64 * 4);

    for expected in 1..=10u64 {
        let prediction = conn.predict_frame().unwrap();
        assert!(prediction.display_ns > prediction.wake_up_ns);
        conn.wait_woke(prediction.frame_id).unwrap();
        conn.begin_frame(prediction.frame_id).unwrap();
        let image = conn.acquire_image(0).unwrap();
        conn.wait_image(0, image, Duration::from_millis(10)).unwrap();
        conn.release_image(0, image).unwrap();

        let sequence = conn
            .submit_frame(prediction.frame_id, &[Layer::quad(0, image)])
            .unwrap();
        assert_eq!(sequence, expected);

        let shm = conn.shm();
        assert_eq!(shm.published(0), expected);
        let slot = shm.latest_slot(0).unwrap();
        assert_eq!(slot.sequence, expected);
        assert_eq!(slot.frame_id, prediction.frame_id);
        assert_eq!(slot.session_id, 0);
        assert_eq!(slot.layers().len(), 1);
        assert_eq!(slot.layers()[0].image_index, image);
    }

    let debug = server.handle.debug_images(0).unwrap();
    assert_eq!(debug.swapchain_index, 0);
    assert_eq!(debug.sequence, 10);
    assert_eq!(debug.images().len(), 2);
    drop(debug);

    drop(conn);
    assert!(wait_until(|| server.handle.session_count() == 0));

    let mut conn = server.connect();
    assert_eq!(conn.session_id(), 0);
    assert_eq!(conn.shm().published(0), 0);
    assert_eq!(
        conn.acquire_image(0).unwrap_err().code(),
        Some(ResultCode::InvalidArgument)
    );
    assert!(server.handle.debug_images(0).is_none());
    server.stop();
}

#[test]
fn test_extra_connection_is_rejected_at_capacity() {
    let server = TestServer::with_config(|c| c.max_sessions = 2);
    let a = server.connect();
    let b = server.connect();
    let ids: HashSet<u32> = [a.session_id(), b.session_id()].into();
    assert_eq!(ids, HashSet::from([0, 1]));

    match Connection::connect(server.handle.socket_path()) {
        Err(ClientError::Rejected(code)) => assert_eq!(code, ResultCode::ResourceExhausted),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("third connection admitted"),
    }
    assert_eq!(server.handle.session_count(), 2);

    // Both sessions serve requests at the same time.
    let workers: Vec<_> = [a, b]
        .into_iter()
        .map(|mut conn| {
            thread::spawn(move || {
                for i in 0..50 {
                    conn.set_client_info(i, &format!("worker-{}", conn.session_id()))
                        .unwrap();
                    let mut clients = conn.get_clients().unwrap();
                    clients.sort_unstable();
                    assert_eq!(clients, vec![0, 1]);
                }
                conn
            })
        })
        .collect();
    let mut conns: Vec<Connection> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    let other = conns[1].session_id();
    let info = conns[0].get_client_info(other).unwrap();
    assert_eq!(info.pid, 49);
    assert_eq!(info.name, format!("worker-{}", other));

    let freed = conns.remove(0).session_id();
    assert!(wait_until(|| server.handle.session_count() == 1));
    let again = server.connect();
    assert_eq!(again.session_id(), freed);
    server.stop();
}

#[test]
fn test_destroy_swapchain_is_idempotent() {
    let server = TestServer::start();
    let mut conn = server.connect();
    let max = conn.max_swapchains();

    let first = conn.create_swapchain(&swapchain_args(16, 16, 1)).unwrap();
    let second = conn.create_swapchain(&swapchain_args(16, 16, 1)).unwrap();
    assert_eq!((first.index, second.index), (0, 1));

    conn.destroy_swapchain(0).unwrap();
    conn.destroy_swapchain(0).unwrap();
    assert_eq!(
        conn.destroy_swapchain(max).unwrap_err().code(),
        Some(ResultCode::InvalidArgument)
    );
    assert_eq!(
        conn.acquire_image(0).unwrap_err().code(),
        Some(ResultCode::InvalidArgument)
    );

    let reused = conn.create_swapchain(&swapchain_args(32, 8, 3)).unwrap();
    assert_eq!(reused.index, 0);
    assert_eq!(reused.images.len(), 3);
    server.stop();
}

#[test]
fn test_swapchain_table_exhaustion() {
    let server = TestServer::with_config(|c| c.max_swapchains = 2);
    let mut conn = server.connect();
    conn.create_swapchain(&swapchain_args(8, 8, 1)).unwrap();
    conn.create_swapchain(&swapchain_args(8, 8, 1)).unwrap();
    assert_eq!(
        conn.create_swapchain(&swapchain_args(8, 8, 1))
            .unwrap_err()
            .code(),
        Some(ResultCode::ResourceExhausted)
    );
    server.stop();
}

#[test]
fn test_client_info_reports_session_flags() {
    let server = TestServer::start();
    let mut conn = server.connect();
    conn.set_client_info(7, "flags").unwrap();

    let info = conn.get_client_info(conn.session_id()).unwrap();
    assert_eq!(info.name, "flags");
    assert!(info.flags.is_empty());

    conn.begin_session().unwrap();
    let info = conn.get_client_info(conn.session_id()).unwrap();
    assert!(info.flags.contains(
        ClientFlags::SESSION_ACTIVE | ClientFlags::VISIBLE | ClientFlags::FOCUSED | ClientFlags::PRIMARY
    ));

    conn.end_session().unwrap();
    let info = conn.get_client_info(conn.session_id()).unwrap();
    assert!(!info.flags.contains(ClientFlags::SESSION_ACTIVE));
    assert_eq!(server.handle.active().current, None);

    let client = server.handle.client_info(conn.session_id()).unwrap();
    assert_eq!((client.pid, client.name.as_str()), (7, "flags"));
    server.stop();
}

#[test]
fn test_exit_on_disconnect() {
    let server = TestServer::with_config(|c| c.exit_on_disconnect = true);
    let conn = server.connect();
    assert!(server.handle.is_running());
    drop(conn);
    server.wait_exit();
}
