use bluemgmt::{
    ConnectionConfig, ErrorKind, Event, EventCode, EventFilter, Listener, Opcode, Status, INDEX_NONE,
};
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

mod common;
use common::{pair, short_timeout};

#[tokio::test]
async fn command_complete_resolves() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(0, Opcode::SetPowered, &[0x01]).await }
    });

    let cmd = kernel.recv().await;
    assert_eq!(cmd.opcode, 0x05);
    assert_eq!(cmd.index, 0);
    assert_eq!(cmd.params, vec![0x01]);

    kernel.complete(0, Opcode::SetPowered, 0x00, &[0x01, 0x00, 0x00, 0x00]).await;
    assert_eq!(task.await.unwrap().unwrap(), vec![0x01, 0x00, 0x00, 0x00]);
}

#[tokio::test]
async fn no_controller_index_is_sent_unchanged() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(INDEX_NONE, Opcode::ReadVersion, &[]).await }
    });

    let cmd = kernel.answer(&[0x01, 0x16, 0x00]).await;
    assert_eq!(cmd.index, 0xffff);
    assert_eq!(task.await.unwrap().unwrap(), vec![0x01, 0x16, 0x00]);
}

#[tokio::test]
async fn other_controller_does_not_resolve() {
    let (conn, kernel) = pair(short_timeout(300));
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(0, Opcode::SetPowered, &[0x01]).await }
    });

    kernel.recv().await;
    kernel.complete(1, Opcode::SetPowered, 0x00, &[0x01, 0x00, 0x00, 0x00]).await;
    kernel.complete(0, Opcode::SetConnectable, 0x00, &[0x01, 0x00, 0x00, 0x00]).await;

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn command_status_reports_error() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(0, Opcode::SetDiscoverable, &[0x01, 0x00, 0x00]).await }
    });

    kernel.recv().await;
    kernel.status(0, Opcode::SetDiscoverable, Status::NotPowered.code()).await;

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Status(Status::NotPowered));
}

#[tokio::test]
async fn command_status_success_has_empty_result() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(0, Opcode::StartDiscovery, &[0x07]).await }
    });

    kernel.recv().await;
    kernel.status(0, Opcode::StartDiscovery, 0x00).await;
    assert!(task.await.unwrap().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_status_is_reported() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(0, Opcode::SetBondable, &[0x01]).await }
    });

    kernel.recv().await;
    kernel.complete(0, Opcode::SetBondable, 0x99, &[]).await;

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownStatus(0x99));
}

#[tokio::test]
async fn unanswered_command_times_out_after_bound() {
    let (conn, kernel) = pair(short_timeout(200));

    let start = Instant::now();
    let err = conn.run_command(0, Opcode::SetPowered, &[0x01]).await.unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(elapsed >= Duration::from_millis(200), "timed out early after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "timed out late after {elapsed:?}");
    assert!(kernel.try_recv(Duration::from_millis(10)).await.is_some());
}

#[tokio::test]
async fn late_result_after_timeout_is_ignored() {
    let (conn, kernel) = pair(short_timeout(100));

    let err = conn.run_command(0, Opcode::SetPowered, &[0x01]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    kernel.recv().await;

    let mut results = conn.events(EventFilter::all().code(EventCode::CommandComplete)).await.unwrap();
    kernel.complete(0, Opcode::SetPowered, 0x00, &[0x00, 0x00, 0x00, 0x00]).await;
    tokio::time::timeout(Duration::from_secs(2), results.next()).await.unwrap().unwrap();

    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(0, Opcode::SetPowered, &[0x01]).await }
    });
    kernel.answer(&[0x01, 0x00, 0x00, 0x00]).await;
    assert_eq!(task.await.unwrap().unwrap(), vec![0x01, 0x00, 0x00, 0x00]);
}

#[tokio::test]
async fn close_fails_all_pending_commands_promptly() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let opcodes = [Opcode::SetPowered, Opcode::SetConnectable, Opcode::SetBondable, Opcode::SetLowEnergy];

    let tasks: Vec<_> = opcodes
        .iter()
        .map(|&opcode| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.run_command(0, opcode, &[0x01]).await })
        })
        .collect();
    for _ in 0..opcodes.len() {
        kernel.recv().await;
    }

    let start = Instant::now();
    conn.close().unwrap();
    for task in tasks {
        let res = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(res.unwrap_err().kind, ErrorKind::Closed);
    }
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(conn.is_closed());
}

#[tokio::test]
async fn closed_connection_fails_fast() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    conn.close().unwrap();
    conn.close().unwrap();

    let err = tokio::time::timeout(Duration::from_millis(500), conn.run_command(0, Opcode::SetPowered, &[1]))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Closed);
    assert!(conn.events(EventFilter::all()).await.is_err());
    assert!(kernel.try_recv(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn malformed_frame_does_not_stop_dispatch() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(0, Opcode::SetPowered, &[0x01]).await }
    });

    kernel.recv().await;
    kernel.complete(0, Opcode::SetPowered, 0x00, &[0x01, 0x00, 0x00, 0x00]).await;
    kernel.send_raw(&[0x01, 0x00, 0x00]).await;
    kernel.send_raw(&[0x01, 0x00, 0x00, 0x00, 0x20, 0x00, 0x05, 0x00]).await;
    assert_eq!(task.await.unwrap().unwrap(), vec![0x01, 0x00, 0x00, 0x00]);

    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(0, Opcode::SetConnectable, &[0x01]).await }
    });
    kernel.answer(&[0x03, 0x00, 0x00, 0x00]).await;
    assert_eq!(task.await.unwrap().unwrap(), vec![0x03, 0x00, 0x00, 0x00]);
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn peer_close_closes_connection() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    drop(kernel);

    tokio::time::timeout(Duration::from_secs(2), conn.closed()).await.unwrap();
    assert!(conn.is_closed());
    let err = conn.run_command(0, Opcode::SetPowered, &[0x01]).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Closed);
}

#[tokio::test]
async fn same_opcode_commands_are_serialized() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let tasks: Vec<_> = [0x01u8, 0x00]
        .into_iter()
        .map(|value| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.run_command(0, Opcode::SetPowered, &[value]).await })
        })
        .collect();

    let first = kernel.recv().await;
    assert!(kernel.try_recv(Duration::from_millis(150)).await.is_none());
    kernel.complete(0, Opcode::SetPowered, 0x00, &[first.params[0], 0x00, 0x00, 0x00]).await;

    let second = kernel.recv().await;
    assert_ne!(first.params, second.params);
    kernel.complete(0, Opcode::SetPowered, 0x00, &[second.params[0], 0x00, 0x00, 0x00]).await;

    for task in tasks {
        task.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn different_controllers_run_concurrently() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let powered = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(0, Opcode::SetPowered, &[0x01]).await }
    });
    let other_index = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(1, Opcode::SetPowered, &[0x01]).await }
    });

    let a = kernel.recv().await;
    let b = kernel.recv().await;
    assert_ne!(a.index, b.index);

    kernel.complete(1, Opcode::SetPowered, 0x00, &[0x00, 0x00, 0x00, 0x00]).await;
    kernel.complete(0, Opcode::SetPowered, 0x00, &[0x01, 0x00, 0x00, 0x00]).await;
    assert_eq!(powered.await.unwrap().unwrap(), vec![0x01, 0x00, 0x00, 0x00]);
    assert_eq!(other_index.await.unwrap().unwrap(), vec![0x00, 0x00, 0x00, 0x00]);
}

#[tokio::test]
async fn event_subscription() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let mut events = conn.events(EventFilter::all().code(EventCode::NewSettings).index(0)).await.unwrap();

    kernel.send(EventCode::IndexAdded, 0, &[]).await;
    kernel.send(EventCode::NewSettings, 1, &[0x01, 0x00, 0x00, 0x00]).await;
    kernel.send(EventCode::NewSettings, 0, &[0x03, 0x00, 0x00, 0x00]).await;

    let event = tokio::time::timeout(Duration::from_secs(2), events.next()).await.unwrap().unwrap();
    assert_eq!(event.index(), 0);
    let settings = event.new_settings().unwrap();
    assert!(settings.powered && settings.connectable);
    assert!(!settings.discoverable);

    conn.close().unwrap();
    assert!(tokio::time::timeout(Duration::from_secs(2), events.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn subscription_sees_command_results() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let mut events = conn.events(EventFilter::all()).await.unwrap();
    let task = tokio::spawn({
        let conn = conn.clone();
        async move { conn.run_command(0, Opcode::SetPowered, &[0x01]).await }
    });
    kernel.answer(&[0x01, 0x00, 0x00, 0x00]).await;
    task.await.unwrap().unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.next()).await.unwrap().unwrap();
    assert_eq!(event.event_code(), Some(EventCode::CommandComplete));
}

struct Forward {
    tx: mpsc::UnboundedSender<Event>,
}

impl Listener for Forward {
    fn filter(&mut self, event: &Event) -> bool {
        event.event_code() == Some(EventCode::DeviceFound)
    }

    fn handle(&mut self, event: &Event) -> bool {
        let _ = self.tx.send(event.clone());
        false
    }
}

#[tokio::test]
async fn custom_listener_add_and_remove() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = conn.add_listener(Forward { tx }).await.unwrap();

    kernel.send(EventCode::DeviceFound, 0, &[0xaa]).await;
    kernel.send(EventCode::Discovering, 0, &[0x07, 0x01]).await;
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.payload(), &[0xaa]);

    conn.remove_listener(id);
    let mut all = conn.events(EventFilter::all().code(EventCode::DeviceFound)).await.unwrap();
    kernel.send(EventCode::DeviceFound, 0, &[0xbb]).await;
    let event = tokio::time::timeout(Duration::from_secs(2), all.next()).await.unwrap().unwrap();
    assert_eq!(event.payload(), &[0xbb]);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn dropping_last_handle_closes_socket() {
    let (conn, kernel) = pair(ConnectionConfig::default());
    drop(conn);

    let mut buf = [0; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), kernel.socket.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn queued_commands_time_out_within_one_bound() {
    let (conn, kernel) = pair(short_timeout(300));
    let start = Instant::now();
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.run_command(0, Opcode::SetPowered, &[0x01]).await })
        })
        .collect();

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(550), "queued commands timed out after {elapsed:?}");
    assert!(kernel.try_recv(Duration::from_millis(10)).await.is_some());
}
