//! End-to-end exchanges between the client sessions and the server over
//! loopback UDP, plus wire-level checks with hand-rolled peers.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tempfile::tempdir;
use tftp::{
    CancelFlag, ClientConfig, Error, ErrorCode, Packet, RetryPolicy, ServerConfig, TftpClient,
    TftpServer, TransferMode, BLOCK_SIZE, MAX_PACKET_SIZE,
};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(base: &Path) -> (SocketAddr, tftp::StopHandle, JoinHandle<Result<(), Error>>) {
    let mut server = TftpServer::new(ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        base_dir: base.to_path_buf(),
        ..Default::default()
    });
    let addr = server.bind().await.unwrap();
    let stop = server.stop_handle();
    let task = tokio::spawn(async move { server.run().await });
    (addr, stop, task)
}

async fn recv_packet(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let (len, src) = timeout(RECV_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a packet")
        .unwrap();
    (Packet::decode(&buf[..len]).unwrap(), src)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn download_small_file() {
    let base = tempdir().unwrap();
    let content = b"Hello, TFTP!".to_vec();
    std::fs::write(base.path().join("hello.txt"), &content).unwrap();
    let (addr, stop, task) = start_server(base.path()).await;

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("hello.txt");
    let client = TftpClient::new(addr);
    let bytes = client
        .download("hello.txt", &dest, &CancelFlag::new(), None)
        .await
        .unwrap();

    assert_eq!(bytes, content.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn download_1200_byte_file_terminates_after_short_block() {
    let base = tempdir().unwrap();
    let content = patterned(1200); // 512 + 512 + 176
    std::fs::write(base.path().join("data.bin"), &content).unwrap();
    let (addr, stop, task) = start_server(base.path()).await;

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("data.bin");
    let bytes = TftpClient::new(addr)
        .download("data.bin", &dest, &CancelFlag::new(), None)
        .await
        .unwrap();

    assert_eq!(bytes, 1200);
    assert_eq!(std::fs::read(&dest).unwrap(), content);

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn download_exact_multiple_and_empty_files() {
    let base = tempdir().unwrap();
    let exact = patterned(1024);
    std::fs::write(base.path().join("exact.bin"), &exact).unwrap();
    std::fs::write(base.path().join("empty.bin"), b"").unwrap();
    let (addr, stop, task) = start_server(base.path()).await;

    let dest_dir = tempdir().unwrap();
    let client = TftpClient::new(addr);

    let dest = dest_dir.path().join("exact.bin");
    let bytes = client
        .download("exact.bin", &dest, &CancelFlag::new(), None)
        .await
        .unwrap();
    assert_eq!(bytes, 1024);
    assert_eq!(std::fs::read(&dest).unwrap(), exact);

    let dest = dest_dir.path().join("empty.bin");
    let bytes = client
        .download("empty.bin", &dest, &CancelFlag::new(), None)
        .await
        .unwrap();
    assert_eq!(bytes, 0);
    assert_eq!(std::fs::read(&dest).unwrap(), Vec::<u8>::new());

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn download_reports_progress_with_unknown_total() {
    let base = tempdir().unwrap();
    std::fs::write(base.path().join("data.bin"), patterned(700)).unwrap();
    let (addr, stop, task) = start_server(base.path()).await;

    let reports = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = reports.clone();
    let progress = move |transferred: u64, total: Option<u64>| {
        sink.lock().unwrap().push((transferred, total));
    };

    let dest_dir = tempdir().unwrap();
    TftpClient::new(addr)
        .download(
            "data.bin",
            &dest_dir.path().join("data.bin"),
            &CancelFlag::new(),
            Some(&progress),
        )
        .await
        .unwrap();

    let reports = reports.lock().unwrap();
    assert_eq!(reports.as_slice(), &[(512, None), (700, None)]);

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn download_missing_file_surfaces_file_not_found() {
    let base = tempdir().unwrap();
    let (addr, stop, task) = start_server(base.path()).await;

    let dest_dir = tempdir().unwrap();
    let result = TftpClient::new(addr)
        .download(
            "no-such-file.bin",
            &dest_dir.path().join("out.bin"),
            &CancelFlag::new(),
            None,
        )
        .await;

    match result {
        Err(Error::Protocol { code, .. }) => assert_eq!(code, ErrorCode::FileNotFound),
        other => panic!("expected FileNotFound, got {other:?}"),
    }

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn upload_round_trip() {
    let base = tempdir().unwrap();
    let (addr, stop, task) = start_server(base.path()).await;

    let src_dir = tempdir().unwrap();
    let content = patterned(1500);
    let source = src_dir.path().join("source.bin");
    std::fs::write(&source, &content).unwrap();

    let bytes = TftpClient::new(addr)
        .upload(&source, "uploaded.bin", &CancelFlag::new(), None)
        .await
        .unwrap();

    assert_eq!(bytes, 1500);
    assert_eq!(std::fs::read(base.path().join("uploaded.bin")).unwrap(), content);

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn upload_empty_file() {
    let base = tempdir().unwrap();
    let (addr, stop, task) = start_server(base.path()).await;

    let src_dir = tempdir().unwrap();
    let source = src_dir.path().join("empty.bin");
    std::fs::write(&source, b"").unwrap();

    let bytes = TftpClient::new(addr)
        .upload(&source, "empty.bin", &CancelFlag::new(), None)
        .await
        .unwrap();

    assert_eq!(bytes, 0);
    assert_eq!(std::fs::read(base.path().join("empty.bin")).unwrap(), Vec::<u8>::new());

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn upload_to_existing_file_is_refused() {
    let base = tempdir().unwrap();
    std::fs::write(base.path().join("taken.bin"), b"original").unwrap();
    let (addr, stop, task) = start_server(base.path()).await;

    let src_dir = tempdir().unwrap();
    let source = src_dir.path().join("source.bin");
    std::fs::write(&source, b"new content").unwrap();

    let result = TftpClient::new(addr)
        .upload(&source, "taken.bin", &CancelFlag::new(), None)
        .await;

    match result {
        Err(Error::Protocol { code, .. }) => assert_eq!(code, ErrorCode::FileExists),
        other => panic!("expected FileExists, got {other:?}"),
    }
    // The original file is untouched.
    assert_eq!(std::fs::read(base.path().join("taken.bin")).unwrap(), b"original");

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn upload_escaping_base_dir_is_refused() {
    let parent = tempdir().unwrap();
    let base = parent.path().join("root");
    std::fs::create_dir(&base).unwrap();
    let (addr, stop, task) = start_server(&base).await;

    let src_dir = tempdir().unwrap();
    let source = src_dir.path().join("source.bin");
    std::fs::write(&source, b"payload").unwrap();

    let result = TftpClient::new(addr)
        .upload(&source, "../../etc/passwd", &CancelFlag::new(), None)
        .await;

    match result {
        Err(Error::Protocol { code, .. }) => assert_eq!(code, ErrorCode::AccessViolation),
        other => panic!("expected AccessViolation, got {other:?}"),
    }
    // Nothing was created outside the base directory.
    assert!(!parent.path().join("etc").exists());

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn upload_exact_multiple_sends_terminal_empty_block() {
    // A 1024-byte source must produce DATA blocks of 512, 512 and 0 bytes,
    // acknowledged as blocks 1, 2 and 3 after the initial ACK(0).
    let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener_addr = listener.local_addr().unwrap();

    let src_dir = tempdir().unwrap();
    let source = src_dir.path().join("source.bin");
    std::fs::write(&source, patterned(1024)).unwrap();

    let upload = tokio::spawn(async move {
        TftpClient::new(listener_addr)
            .upload(&source, "exact.bin", &CancelFlag::new(), None)
            .await
    });

    let (request, client_addr) = recv_packet(&listener).await;
    assert_eq!(request, Packet::write_request("exact.bin", TransferMode::Octet));

    // Worker-side socket whose port becomes the transfer ID.
    let worker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    worker
        .send_to(&Packet::ack(0).encode(), client_addr)
        .await
        .unwrap();

    let mut sizes = Vec::new();
    for block in 1..=3u16 {
        let (packet, src) = recv_packet(&worker).await;
        assert_eq!(src, client_addr);
        match packet {
            Packet::Data { block: got, payload } => {
                assert_eq!(got, block);
                sizes.push(payload.len());
            }
            other => panic!("expected DATA, got {other:?}"),
        }
        worker
            .send_to(&Packet::ack(block).encode(), client_addr)
            .await
            .unwrap();
    }
    assert_eq!(sizes, vec![512, 512, 0]);

    assert_eq!(upload.await.unwrap().unwrap(), 1024);
}

#[tokio::test]
async fn client_ignores_foreign_sender_without_replying() {
    let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener_addr = listener.local_addr().unwrap();

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("out.bin");
    let dest_for_task = dest.clone();
    let download = tokio::spawn(async move {
        TftpClient::new(listener_addr)
            .download("file.bin", &dest_for_task, &CancelFlag::new(), None)
            .await
    });

    let (request, client_addr) = recv_packet(&listener).await;
    assert_eq!(request, Packet::read_request("file.bin", TransferMode::Octet));

    // First DATA locks the client onto this socket's port.
    let worker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let block1 = vec![1u8; BLOCK_SIZE];
    worker
        .send_to(&Packet::data(1, block1.clone()).encode(), client_addr)
        .await
        .unwrap();
    let (ack, _) = recv_packet(&worker).await;
    assert_eq!(ack, Packet::ack(1));

    // A foreign sender offers a competing block 2; the client must ignore
    // it and must not send any reply to the foreign port.
    let foreign = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    foreign
        .send_to(&Packet::data(2, vec![9u8; 50]).encode(), client_addr)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let block2 = vec![2u8; 80];
    worker
        .send_to(&Packet::data(2, block2.clone()).encode(), client_addr)
        .await
        .unwrap();
    let (ack, _) = recv_packet(&worker).await;
    assert_eq!(ack, Packet::ack(2));

    assert_eq!(download.await.unwrap().unwrap(), (BLOCK_SIZE + 80) as u64);

    // Only the legitimate blocks made it into the file.
    let mut expected = block1;
    expected.extend_from_slice(&block2);
    assert_eq!(std::fs::read(&dest).unwrap(), expected);

    // The client stays silent towards the foreign sender.
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let silence = timeout(Duration::from_millis(200), foreign.recv_from(&mut buf)).await;
    assert!(silence.is_err(), "client must not reply to a foreign sender");
}

#[tokio::test]
async fn server_replies_unknown_tid_to_foreign_sender() {
    let base = tempdir().unwrap();
    std::fs::write(base.path().join("small.bin"), patterned(64)).unwrap();
    let (addr, stop, task) = start_server(base.path()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(
            &Packet::read_request("small.bin", TransferMode::Octet).encode(),
            addr,
        )
        .await
        .unwrap();

    let (data, worker_addr) = recv_packet(&client).await;
    assert_eq!(data, Packet::data(1, patterned(64)));

    // A foreign socket pokes the worker and gets error 5 back; the worker
    // keeps serving the legitimate client.
    let foreign = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    foreign
        .send_to(&Packet::ack(1).encode(), worker_addr)
        .await
        .unwrap();
    let (reply, src) = recv_packet(&foreign).await;
    assert_eq!(src, worker_addr);
    match reply {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownTransferId),
        other => panic!("expected ERROR, got {other:?}"),
    }

    client
        .send_to(&Packet::ack(1).encode(), worker_addr)
        .await
        .unwrap();

    stop.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn silent_server_exhausts_retries_with_timeout() {
    // Bound but mute peer: the client must give up after its attempt budget.
    let mute = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mute_addr = mute.local_addr().unwrap();

    let mut config = ClientConfig::new(mute_addr);
    config.policy = RetryPolicy {
        timeout: Duration::from_millis(50),
        max_attempts: 3,
    };
    let client = TftpClient::with_config(config);

    let dest_dir = tempdir().unwrap();
    let result = client
        .download(
            "anything.bin",
            &dest_dir.path().join("out.bin"),
            &CancelFlag::new(),
            None,
        )
        .await;

    match result {
        Err(Error::Timeout { attempts: 3 }) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_download_stops_between_blocks() {
    let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let listener_addr = listener.local_addr().unwrap();

    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("out.bin");
    let dest_for_task = dest.clone();
    let download = tokio::spawn(async move {
        TftpClient::new(listener_addr)
            .download("big.bin", &dest_for_task, &flag, None)
            .await
    });

    let (_, client_addr) = recv_packet(&listener).await;
    let worker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    worker
        .send_to(&Packet::data(1, vec![0u8; BLOCK_SIZE]).encode(), client_addr)
        .await
        .unwrap();
    let (ack, _) = recv_packet(&worker).await;
    assert_eq!(ack, Packet::ack(1));

    // Cancel while the client waits for block 2.
    cancel.cancel();
    worker
        .send_to(&Packet::data(2, vec![0u8; BLOCK_SIZE]).encode(), client_addr)
        .await
        .unwrap();
    let (ack, _) = recv_packet(&worker).await;
    assert_eq!(ack, Packet::ack(2));

    match download.await.unwrap() {
        Err(Error::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
    // The partial file is left for the caller to discard.
    assert_eq!(std::fs::read(&dest).unwrap().len(), 2 * BLOCK_SIZE);
}

#[tokio::test]
async fn malformed_request_port_datagram_is_dropped() {
    let base = tempdir().unwrap();
    std::fs::write(base.path().join("file.bin"), b"payload").unwrap();
    let (addr, stop, task) = start_server(base.path()).await;

    // Garbage and a non-request opcode, both dropped without a reply.
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe.send_to(&[0xFF], addr).await.unwrap();
    probe.send_to(&Packet::ack(3).encode(), addr).await.unwrap();
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let silence = timeout(Duration::from_millis(200), probe.recv_from(&mut buf)).await;
    assert!(silence.is_err(), "listener must not reply on the request port");

    // The listener is still serving.
    let dest_dir = tempdir().unwrap();
    let bytes = TftpClient::new(addr)
        .download(
            "file.bin",
            &dest_dir.path().join("file.bin"),
            &CancelFlag::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(bytes, 7);

    stop.stop();
    task.await.unwrap().unwrap();
}
