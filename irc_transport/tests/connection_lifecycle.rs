mod utils;

use irc_transport::{config::*, *};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::{io::AsyncWriteExt, time::{sleep, timeout}};
use utils::*;

#[tokio::test]
async fn shutdown_sends_quit_and_releases_event_loop()
{
    let (server, addr) = fake_server().await;
    let registry = Registry::new();
    let mut test = test_client(&registry, test_config(addr));

    test.client.connect().unwrap();
    assert_eq!(registry.event_loop_generation(), Some(1));

    let (mut lines, _writer) = accept(&server).await;
    assert!(matches!(test.next_event().await, TransportEventDetail::Connected { tls_fingerprint: None, .. }));
    assert!(test.client.is_connected());

    test.client.shutdown(Some("bye"));

    assert_eq!(read_line(&mut lines).await, Some("QUIT :bye".to_string()));
    assert_eq!(read_line(&mut lines).await, None);
    assert_eq!(test.next_event().await, TransportEventDetail::ConnectionClosed { reconnecting: false });

    assert_eq!(registry.connection_count(), 0);
    assert_eq!(registry.event_loop_generation(), None);
    assert!(!test.client.is_connected());
    assert_eq!(test.client.send_message("PRIVMSG #a :hi", false), Err(TransportError::NotConnected));
}

#[tokio::test]
async fn shutdown_without_reason()
{
    let (server, addr) = fake_server().await;
    let registry = Registry::new();
    let mut test = test_client(&registry, test_config(addr));

    test.client.connect().unwrap();
    let (mut lines, _writer) = accept(&server).await;
    test.next_event().await;

    test.client.shutdown(None);
    assert_eq!(read_line(&mut lines).await, Some("QUIT".to_string()));
}

#[tokio::test]
async fn lines_are_dispatched_and_sent()
{
    let (server, addr) = fake_server().await;
    let registry = Registry::new();
    let mut test = test_client(&registry, test_config(addr));

    test.client.connect().unwrap();
    // Queued before the handshake, written once it completes
    test.client.send_message("NICK tester", true).unwrap();

    let (mut lines, mut writer) = accept(&server).await;
    assert_eq!(read_line(&mut lines).await, Some("NICK tester".to_string()));

    writer.write_all(b":server 001 tester :Welcome\r\nPING :abc\r\n").await.unwrap();
    assert_eq!(test.next_line().await, ":server 001 tester :Welcome");
    assert_eq!(test.next_line().await, "PING :abc");

    test.client.send_message("JOIN #one", false).unwrap();
    test.client.send_message_avoiding_duplicates("JOIN #one").unwrap();
    test.client.send_message("JOIN #two", false).unwrap();
    test.client.start_sending().unwrap();

    assert_eq!(read_line(&mut lines).await, Some("JOIN #one".to_string()));
    assert_eq!(read_line(&mut lines).await, Some("JOIN #two".to_string()));

    test.client.shutdown(None);
}

#[tokio::test]
async fn reconnects_after_server_closes()
{
    let (server, addr) = fake_server().await;
    let registry = Registry::new();
    let mut test = test_client(&registry, test_config(addr));

    let first = test.client.connect().unwrap();
    let (lines, writer) = accept(&server).await;
    test.next_event().await;

    drop(lines);
    drop(writer);
    assert_eq!(test.next_event().await, TransportEventDetail::ConnectionClosed { reconnecting: true });
    assert!(registry.has_pending_reconnect(test.client.id()));
    // The pending reconnect keeps the event loop alive
    assert_eq!(registry.event_loop_generation(), Some(1));

    let (_lines, _writer) = accept(&server).await;
    assert!(matches!(test.next_event().await, TransportEventDetail::Connected { .. }));

    let second = test.client.connection_id().unwrap();
    assert_ne!(first, second);
    assert_eq!(second.client(), test.client.id());
    assert_eq!(registry.event_loop_generation(), Some(1));
    assert_eq!(registry.connection_count(), 1);
    assert!(!registry.has_pending_reconnect(test.client.id()));

    // One close, one reconnect
    assert!(timeout(Duration::from_millis(300), server.accept()).await.is_err());

    test.client.shutdown(None);
    assert_eq!(test.next_event().await, TransportEventDetail::ConnectionClosed { reconnecting: false });
}

#[tokio::test]
async fn event_loop_is_recreated_after_release()
{
    let (server, addr) = fake_server().await;
    let registry = Registry::new();
    let mut test = test_client(&registry, test_config(addr));

    test.client.connect().unwrap();
    let (_lines, _writer) = accept(&server).await;
    test.next_event().await;
    test.client.shutdown(None);
    assert_eq!(test.next_event().await, TransportEventDetail::ConnectionClosed { reconnecting: false });
    assert_eq!(registry.event_loop_generation(), None);
    assert!(registry.is_idle());

    test.client.connect().unwrap();
    assert_eq!(registry.event_loop_generation(), Some(2));
    let (_lines, _writer) = accept(&server).await;
    assert!(matches!(test.next_event().await, TransportEventDetail::Connected { .. }));

    test.client.shutdown(None);
}

#[tokio::test]
async fn clients_share_an_event_loop()
{
    let (server, addr) = fake_server().await;
    let registry = Registry::new();
    let mut first = test_client(&registry, test_config(addr));
    let mut second = test_client(&registry, test_config(addr));
    assert_ne!(first.client.id(), second.client.id());

    first.client.connect().unwrap();
    let (_l1, _w1) = accept(&server).await;
    first.next_event().await;

    second.client.connect().unwrap();
    let (_l2, _w2) = accept(&server).await;
    second.next_event().await;

    assert_eq!(registry.connection_count(), 2);
    assert_eq!(registry.event_loop_generation(), Some(1));

    first.client.shutdown(None);
    first.next_event().await;
    // Still needed by the second client
    assert_eq!(registry.event_loop_generation(), Some(1));

    second.client.shutdown(None);
    second.next_event().await;
    assert_eq!(registry.event_loop_generation(), None);
}

#[tokio::test]
async fn overlong_line_forces_reconnect()
{
    let (server, addr) = fake_server().await;
    let registry = Registry::new();
    let mut test = test_client(&registry, test_config(addr));

    test.client.connect().unwrap();
    let (mut lines, mut writer) = accept(&server).await;
    test.next_event().await;

    let mut long_line = vec![b'a'; codec::MAX_LINE_LENGTH + 100];
    long_line.extend_from_slice(b"\r\n");
    writer.write_all(&long_line).await.unwrap();

    assert_eq!(test.next_error().await, TransportError::LineTooLong { max: codec::MAX_LINE_LENGTH });
    assert_eq!(read_line(&mut lines).await, Some("QUIT :IO Error. Reconnecting...".to_string()));
    assert_eq!(test.next_event().await, TransportEventDetail::ConnectionClosed { reconnecting: true });

    let (_lines, _writer) = accept(&server).await;
    assert!(matches!(test.next_event().await, TransportEventDetail::Connected { .. }));
    test.client.shutdown(None);
}

#[tokio::test]
async fn one_fault_is_reported_once()
{
    let (server, addr) = fake_server().await;
    let registry = Registry::new();
    let mut test = test_client(&registry, test_config(addr));

    test.client.connect().unwrap();
    let (lines, mut writer) = accept(&server).await;
    test.next_event().await;

    let mut long_line = vec![b'a'; codec::MAX_LINE_LENGTH + 100];
    long_line.extend_from_slice(b"\r\n");
    writer.write_all(&long_line).await.unwrap();
    // The QUIT that follows the fault has nowhere to go
    drop(lines);
    drop(writer);

    assert_eq!(test.next_error().await, TransportError::LineTooLong { max: codec::MAX_LINE_LENGTH });
    assert_eq!(test.next_event().await, TransportEventDetail::ConnectionClosed { reconnecting: true });

    let (_lines, _writer) = accept(&server).await;
    assert!(matches!(test.next_event().await, TransportEventDetail::Connected { .. }));
    assert!(test.errors.try_recv().is_err());

    test.client.shutdown(None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_wins_over_concurrent_fault()
{
    for _ in 0..25
    {
        let (server, addr) = fake_server().await;
        let registry = Registry::new();
        let config = test_config(addr);
        config.set(&RECONNECT_DELAY_MS, Some(50)).unwrap();
        let mut test = test_client(&registry, config);

        test.client.connect().unwrap();
        let (_lines, mut writer) = accept(&server).await;
        test.next_event().await;

        let mut long_line = vec![b'a'; codec::MAX_LINE_LENGTH + 100];
        long_line.extend_from_slice(b"\r\n");
        writer.write_all(&long_line).await.unwrap();
        test.client.shutdown(Some("bye"));

        loop
        {
            if let TransportEventDetail::ConnectionClosed { .. } = test.next_event().await
            {
                break;
            }
        }

        // Well past the reconnect delay
        sleep(Duration::from_millis(150)).await;
        assert!(!registry.has_pending_reconnect(test.client.id()));
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.event_loop_generation(), None);
        assert!(!test.client.is_connected());
        assert!(timeout(Duration::from_millis(50), server.accept()).await.is_err());
    }
}

#[tokio::test]
async fn idle_connection_is_recycled()
{
    let (server, addr) = fake_server().await;
    let registry = Registry::new();
    let config = test_config(addr);
    config.set(&IDLE_TIMEOUT_MS, Some(200)).unwrap();
    let mut test = test_client(&registry, config);

    test.client.connect().unwrap();
    let (mut lines, _writer) = accept(&server).await;
    test.next_event().await;

    assert_eq!(read_line(&mut lines).await, Some("QUIT :Reconnecting...".to_string()));
    assert_eq!(test.next_event().await, TransportEventDetail::ConnectionClosed { reconnecting: true });

    let (_lines, _writer) = accept(&server).await;
    test.next_event().await;
    test.client.shutdown(None);
}

#[tokio::test]
async fn failed_connect_is_retried_until_shutdown()
{
    // Nothing listening on this port once the listener is dropped
    let (server, addr) = fake_server().await;
    drop(server);

    let registry = Registry::new();
    let mut test = test_client(&registry, test_config(addr));

    test.client.connect().unwrap();
    assert!(matches!(test.next_event().await, TransportEventDetail::ConnectionFailed(TransportError::ConnectFailed(_))));
    assert!(matches!(test.next_error().await, TransportError::ConnectFailed(_)));
    assert!(registry.has_pending_reconnect(test.client.id()));

    test.client.shutdown(None);
    assert!(!registry.has_pending_reconnect(test.client.id()));
    assert_eq!(registry.event_loop_generation(), None);
}

#[tokio::test]
async fn tls_config_fault_is_not_retried()
{
    let (server, addr) = fake_server().await;
    let registry = Registry::new();
    let config = test_config(addr);
    config.set(&TLS, Some(true)).unwrap();
    config.set(&TLS_KEY_PASSWORD, Some("secret".to_string())).unwrap();
    let mut test = test_client(&registry, config);

    test.client.connect().unwrap();
    let _socket = accept(&server).await;

    match test.next_event().await
    {
        TransportEventDetail::ConnectionFailed(e) => assert!(e.is_fatal()),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(!registry.has_pending_reconnect(test.client.id()));
    assert_eq!(registry.event_loop_generation(), None);
}

#[test]
fn connect_needs_a_runtime()
{
    let registry = Registry::new();
    let (events, _) = tokio::sync::mpsc::unbounded_channel();

    struct Ignore;
    impl ClientHandler for Ignore
    {
        fn process_line(&self, _: &str) {}
    }

    let client = Client::new(&registry, Config::new(), Ignore, events);
    assert_eq!(client.connect(), Err(TransportError::NoRuntime));
}
