//! End-to-end protocol tests: a raw-frame peer talking to a real
//! multiplexer over a socket pair.

use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

use gangwaybridge::packages::PackageDirs;
use gangwaybridge::{default_factory, ChannelFactory, Multiplexer, ResourceChannel};
use gangwaywire::error::Problem;
use gangwaywire::pipe::Pipe;
use gangwaywire::transport::Transport;

/// The frontend side of the wire: reads and writes raw frames.
struct Peer {
    stream: UnixStream,
}

impl Peer {
    async fn send_frame(&mut self, channel: &str, payload: &[u8]) {
        let mut frame = BytesMut::new();
        let length = channel.len() + 1 + payload.len();
        frame.extend_from_slice(&(length as u32).to_be_bytes());
        frame.extend_from_slice(channel.as_bytes());
        frame.extend_from_slice(b"\n");
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send_control(&mut self, message: Value) {
        let payload = serde_json::to_vec(&message).unwrap();
        self.send_frame("0", &payload).await;
    }

    async fn next_frame(&mut self) -> Option<(String, Bytes)> {
        let mut length = [0u8; 4];
        match self.stream.read_exact(&mut length).await {
            Ok(_) => {}
            Err(_) => return None, // EOF / reset
        }
        let length = u32::from_be_bytes(length) as usize;
        let mut body = vec![0u8; length];
        self.stream.read_exact(&mut body).await.unwrap();
        let newline = body.iter().position(|&b| b == b'\n').unwrap();
        let channel = String::from_utf8(body[..newline].to_vec()).unwrap();
        let payload = Bytes::from(body.split_off(newline + 1));
        Some((channel, payload))
    }

    async fn next_control(&mut self) -> Value {
        let (channel, payload) = self.next_frame().await.expect("expected a control frame");
        assert_eq!(channel, "0", "expected control, got data: {payload:?}");
        serde_json::from_slice(&payload).unwrap()
    }

    /// Receive the bridge's init, answer with ours.
    async fn handshake(&mut self) {
        let init = self.next_control().await;
        assert_eq!(init["command"], "init");
        assert_eq!(init["version"], 1);
        self.send_control(json!({"command": "init", "version": 1}))
            .await;
    }

    /// Collect data frames for `channel` until its close control arrives.
    /// Panics when `done` was expected (per `expect_done`) but missing.
    async fn collect_channel(&mut self, channel: &str, expect_done: bool) -> (Vec<u8>, Value) {
        let mut data = Vec::new();
        let mut saw_done = false;
        loop {
            let (from, payload) = self.next_frame().await.expect("channel should close first");
            if from == channel {
                data.extend_from_slice(&payload);
                continue;
            }
            assert_eq!(from, "0");
            let control: Value = serde_json::from_slice(&payload).unwrap();
            if control["channel"] != channel {
                continue; // unrelated channel
            }
            match control["command"].as_str().unwrap() {
                "ready" => continue,
                "done" => saw_done = true,
                "close" => {
                    assert_eq!(saw_done, expect_done, "done before close: {control}");
                    return (data, control);
                }
                other => panic!("unexpected control {other}: {control}"),
            }
        }
    }
}

fn start_bridge_with(factory: ChannelFactory) -> (JoinHandle<Option<Problem>>, Peer) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let transport = Transport::new(Pipe::from_unix_stream("bridge", ours));
    let mux = Multiplexer::new(transport, factory);
    (tokio::spawn(mux.run()), Peer { stream: theirs })
}

fn start_bridge() -> (JoinHandle<Option<Problem>>, Peer) {
    start_bridge_with(default_factory())
}

// ---------------------------------------------------------------------------
// Handshake and control validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn init_handshake() {
    let (bridge, mut peer) = start_bridge();
    peer.handshake().await;

    // A clean EOF afterwards is an orderly close.
    drop(peer);
    assert_eq!(bridge.await.unwrap(), None);
}

#[tokio::test]
async fn control_before_init_is_fatal() {
    let (bridge, mut peer) = start_bridge();
    let init = peer.next_control().await;
    assert_eq!(init["command"], "init");

    // Open without having sent init first.
    peer.send_control(json!({
        "command": "open", "channel": "4", "payload": "stream", "spawn": ["cat"],
    }))
    .await;

    assert_eq!(bridge.await.unwrap(), Some(Problem::ProtocolError));
}

#[tokio::test]
async fn wrong_version_is_fatal() {
    let (bridge, mut peer) = start_bridge();
    let _ = peer.next_control().await;
    peer.send_control(json!({"command": "init", "version": 2}))
        .await;
    assert_eq!(bridge.await.unwrap(), Some(Problem::ProtocolError));
}

#[tokio::test]
async fn garbage_frame_is_fatal() {
    let (bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.stream.write_all(b"X").await.unwrap();
    drop(peer);

    assert_eq!(bridge.await.unwrap(), Some(Problem::ProtocolError));
}

#[tokio::test]
async fn unknown_payload_closes_not_supported() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "9", "payload": "carrier-pigeon",
    }))
    .await;

    let close = peer.next_control().await;
    assert_eq!(close["command"], "close");
    assert_eq!(close["channel"], "9");
    assert_eq!(close["problem"], "not-supported");
}

#[tokio::test]
async fn missing_payload_closes_protocol_error() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({"command": "open", "channel": "9"}))
        .await;

    let close = peer.next_control().await;
    assert_eq!(close["command"], "close");
    assert_eq!(close["problem"], "protocol-error");
}

#[tokio::test]
async fn duplicate_channel_id_is_fatal() {
    let (bridge, mut peer) = start_bridge();
    peer.handshake().await;

    let open = json!({
        "command": "open", "channel": "4", "payload": "stream", "spawn": ["cat"],
    });
    peer.send_control(open.clone()).await;
    peer.send_control(open).await;

    assert_eq!(bridge.await.unwrap(), Some(Problem::ProtocolError));
}

#[tokio::test]
async fn data_for_unknown_channel_is_dropped() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_frame("77", b"into the void").await;

    // The bridge keeps running: a normal open still works.
    peer.send_control(json!({
        "command": "open", "channel": "5", "payload": "stream",
        "spawn": ["/bin/sh", "-c", "exit 0"],
    }))
    .await;
    let (_, close) = peer.collect_channel("5", true).await;
    assert_eq!(close["exit-status"], 0);
}

#[tokio::test]
async fn authorize_with_unknown_cookie_is_dropped() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "authorize", "cookie": "stale", "response": "whatever",
    }))
    .await;

    // Still alive afterwards.
    peer.send_control(json!({
        "command": "open", "channel": "3", "payload": "stream",
        "spawn": ["/bin/sh", "-c", "exit 0"],
    }))
    .await;
    let (_, close) = peer.collect_channel("3", true).await;
    assert_eq!(close["exit-status"], 0);
}

/// A scripted channel that challenges the peer and echoes the response.
struct AuthChannel;

impl gangwaybridge::Channel for AuthChannel {
    fn prepare(&mut self, core: &mut gangwaybridge::ChannelCore) {
        core.ready();
        core.authorize("plain");
    }

    fn recv(&mut self, _core: &mut gangwaybridge::ChannelCore, _data: Bytes) {}

    fn on_event(
        &mut self,
        core: &mut gangwaybridge::ChannelCore,
        event: gangwaybridge::ChannelEvent,
    ) {
        if let gangwaybridge::ChannelEvent::AuthorizeResponse { response, .. } = event {
            core.send(Bytes::from(response));
            core.close(None);
        }
    }
}

#[tokio::test]
async fn authorize_conversation_round_trip() {
    let factory: ChannelFactory = Box::new(|payload| match payload {
        "auth-test" => Some(Box::new(AuthChannel)),
        _ => None,
    });
    let (_bridge, mut peer) = start_bridge_with(factory);
    peer.handshake().await;

    peer.send_control(json!({"command": "open", "channel": "1", "payload": "auth-test"}))
        .await;

    let ready = peer.next_control().await;
    assert_eq!(ready["command"], "ready");

    let challenge = peer.next_control().await;
    assert_eq!(challenge["command"], "authorize");
    assert_eq!(challenge["challenge"], "plain");
    let cookie = challenge["cookie"].as_str().unwrap().to_string();

    peer.send_control(json!({
        "command": "authorize", "cookie": cookie, "response": "s3kr3t",
    }))
    .await;

    let (data, close) = peer.collect_channel("1", false).await;
    assert_eq!(&data[..], b"s3kr3t");
    assert!(close.get("problem").is_none());
}

// ---------------------------------------------------------------------------
// Stream channels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echo_stream_round_trip() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "4", "payload": "stream", "spawn": ["cat"],
    }))
    .await;

    // Ready comes before any data.
    let ready = peer.next_control().await;
    assert_eq!(ready["command"], "ready");
    assert_eq!(ready["channel"], "4");

    peer.send_frame("4", b"Marmalaade!").await;
    peer.send_control(json!({"command": "done", "channel": "4"}))
        .await;

    let (data, close) = peer.collect_channel("4", true).await;
    assert_eq!(&data[..], b"Marmalaade!");
    assert_eq!(close["exit-status"], 0);
    assert!(close.get("problem").is_none());
    assert!(close.get("exit-signal").is_none());
}

#[tokio::test]
async fn text_stream_scrubs_to_utf8() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "4", "payload": "text-stream", "spawn": ["cat"],
    }))
    .await;

    peer.send_frame("4", b"\x00Marmalaade!\x00").await;
    peer.send_control(json!({"command": "done", "channel": "4"}))
        .await;

    let (data, _close) = peer.collect_channel("4", true).await;
    assert_eq!(&data[..], b"\xef\xbf\xbdMarmalaade!\xef\xbf\xbd");
}

#[tokio::test]
async fn spawn_exit_status_is_reported() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "11", "payload": "stream",
        "spawn": ["/bin/sh", "-c", "exit 5"],
    }))
    .await;

    let (_, close) = peer.collect_channel("11", true).await;
    assert_eq!(close["exit-status"], 5);
    assert!(close.get("exit-signal").is_none());
}

#[tokio::test]
async fn spawn_signal_is_reported() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "11", "payload": "stream",
        "spawn": ["/bin/sh", "-c", "kill $$"],
    }))
    .await;

    let (_, close) = peer.collect_channel("11", true).await;
    assert_eq!(close["exit-signal"], "TERM");
    assert!(close.get("exit-status").is_none());
}

#[tokio::test]
async fn stderr_message_is_a_close_option() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "6", "payload": "stream",
        "spawn": ["/bin/sh", "-c", "echo oops >&2; exit 0"], "err": "message",
    }))
    .await;

    let (_, close) = peer.collect_channel("6", true).await;
    assert_eq!(close["message"], "oops\n");
}

#[tokio::test]
async fn spawn_missing_binary_closes_not_found() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "2", "payload": "stream",
        "spawn": ["/nonexistent/binary"],
    }))
    .await;

    let (_, close) = peer.collect_channel("2", false).await;
    assert_eq!(close["problem"], "not-found");
}

#[tokio::test]
async fn bad_spawn_option_closes_protocol_error() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "2", "payload": "stream", "spawn": "not-an-array",
    }))
    .await;

    let (_, close) = peer.collect_channel("2", false).await;
    assert_eq!(close["problem"], "protocol-error");
}

#[tokio::test]
async fn both_unix_and_spawn_close_protocol_error() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "2", "payload": "stream",
        "spawn": ["cat"], "unix": "/run/nowhere.sock",
    }))
    .await;

    let (_, close) = peer.collect_channel("2", false).await;
    assert_eq!(close["problem"], "protocol-error");
}

#[tokio::test]
async fn unix_connect_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.sock");
    let listener = tokio::net::UnixListener::bind(&path).unwrap();

    // A one-shot echo server.
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buffer = vec![0u8; 64];
        let n = stream.read(&mut buffer).await.unwrap();
        stream.write_all(&buffer[..n]).await.unwrap();
    });

    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;
    peer.send_control(json!({
        "command": "open", "channel": "8", "payload": "stream",
        "unix": path.to_str().unwrap(),
    }))
    .await;

    peer.send_frame("8", b"over the socket").await;
    let (data, close) = peer.collect_channel("8", true).await;
    assert_eq!(&data[..], b"over the socket");
    // Not a process: no exit status.
    assert!(close.get("exit-status").is_none());
}

#[tokio::test]
async fn pty_initial_window_size() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "7", "payload": "stream",
        "spawn": ["/bin/sh", "-c", "stty size"], "pty": true,
        "window": {"rows": 1234, "cols": 4567},
    }))
    .await;

    let (data, _close) = peer.collect_channel("7", true).await;
    let text = String::from_utf8_lossy(&data);
    assert!(text.contains("1234 4567"), "unexpected output: {text:?}");
}

#[tokio::test]
async fn pty_window_resize_via_options() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "7", "payload": "stream",
        "spawn": ["/bin/sh", "-c", "stty size; read line; stty size"], "pty": true,
        "window": {"rows": 10, "cols": 20},
    }))
    .await;

    // Wait for the first size report, then resize and nudge the shell on.
    let mut collected = Vec::new();
    while !String::from_utf8_lossy(&collected).contains("10 20") {
        let (channel, payload) = peer.next_frame().await.unwrap();
        if channel == "7" {
            collected.extend_from_slice(&payload);
        }
    }

    peer.send_control(json!({
        "command": "options", "channel": "7",
        "window": {"rows": 24, "cols": 42},
    }))
    .await;
    peer.send_frame("7", b"go\n").await;

    let (rest, _close) = peer.collect_channel("7", true).await;
    collected.extend_from_slice(&rest);
    let text = String::from_utf8_lossy(&collected);
    assert!(text.contains("24 42"), "unexpected output: {text:?}");
}

#[tokio::test]
async fn bulk_transfer_survives_backpressure() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    // 2 MiB, well past the backlog high-water mark.
    peer.send_control(json!({
        "command": "open", "channel": "9", "payload": "stream",
        "spawn": ["/bin/sh", "-c", "dd if=/dev/zero bs=1024 count=2048 2>/dev/null"],
    }))
    .await;

    let (data, close) = peer.collect_channel("9", true).await;
    assert_eq!(data.len(), 2048 * 1024);
    assert!(data.iter().all(|&b| b == 0));
    assert_eq!(close["exit-status"], 0);
}

#[tokio::test]
async fn peer_close_terminates_the_process() {
    let (_bridge, mut peer) = start_bridge();
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "4", "payload": "stream",
        "spawn": ["/bin/sh", "-c", "sleep 600"],
    }))
    .await;
    let ready = peer.next_control().await;
    assert_eq!(ready["command"], "ready");

    peer.send_control(json!({"command": "close", "channel": "4"}))
        .await;

    // The bridge acknowledges with its own close for the channel.
    let close = peer.next_control().await;
    assert_eq!(close["command"], "close");
    assert_eq!(close["channel"], "4");
}

// ---------------------------------------------------------------------------
// Resource channels
// ---------------------------------------------------------------------------

fn write_package(root: &std::path::Path, name: &str, manifest: &str, files: &[(&str, &[u8])]) {
    let dir = root.join("gangway").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("manifest.json"), manifest).unwrap();
    for (file, contents) in files {
        let path = dir.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }
}

fn resource_factory(root: std::path::PathBuf) -> ChannelFactory {
    Box::new(move |payload| match payload {
        "resource2" => Some(Box::new(ResourceChannel::with_dirs(
            "packages",
            PackageDirs::system_only(&[root.clone()]),
        ))),
        _ => None,
    })
}

#[tokio::test]
async fn resource_listing_close_options() {
    let dir = tempfile::tempdir().unwrap();
    write_package(
        dir.path(),
        "test",
        r#"{"description": "test package"}"#,
        &[("file.txt", b"hello")],
    );

    let (_bridge, mut peer) = start_bridge_with(resource_factory(dir.path().to_path_buf()));
    peer.handshake().await;

    peer.send_control(json!({"command": "open", "channel": "1", "payload": "resource2"}))
        .await;

    let ready = peer.next_control().await;
    assert_eq!(ready["command"], "ready");

    let close = peer.next_control().await;
    assert_eq!(close["command"], "close");
    assert!(close.get("problem").is_none());
    let packages = close["packages"].as_array().unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0]["id"][0], "test");
    assert_eq!(packages[0]["manifest"]["description"], "test package");
}

#[tokio::test]
async fn resource_streams_a_file() {
    let dir = tempfile::tempdir().unwrap();
    write_package(
        dir.path(),
        "test",
        "{}",
        &[("sub/file.txt", b"these are the contents of a file")],
    );

    let (_bridge, mut peer) = start_bridge_with(resource_factory(dir.path().to_path_buf()));
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "2", "payload": "resource2",
        "package": "test", "path": "sub/file.txt",
    }))
    .await;

    let (data, close) = peer.collect_channel("2", false).await;
    assert_eq!(&data[..], b"these are the contents of a file");
    assert!(close.get("problem").is_none());
}

#[tokio::test]
async fn resource_accept_negotiation() {
    let dir = tempfile::tempdir().unwrap();
    write_package(
        dir.path(),
        "test",
        "{}",
        &[
            ("app.js", b"plain source" as &[u8]),
            ("app.min.js", b"minified!"),
        ],
    );

    let (_bridge, mut peer) = start_bridge_with(resource_factory(dir.path().to_path_buf()));
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "2", "payload": "resource2",
        "package": "test", "path": "app.js", "accept": ["min"],
    }))
    .await;

    // First frame is the negotiation meta, then the variant's contents.
    let ready = peer.next_control().await;
    assert_eq!(ready["command"], "ready");
    let (channel, meta) = peer.next_frame().await.unwrap();
    assert_eq!(channel, "2");
    let meta: Value = serde_json::from_slice(&meta).unwrap();
    assert_eq!(meta["accept"], "min");

    let (data, close) = peer.collect_channel("2", false).await;
    assert_eq!(&data[..], b"minified!");
    assert!(close.get("problem").is_none());
}

#[tokio::test]
async fn resource_missing_file_closes_not_found() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path(), "test", "{}", &[]);

    let (_bridge, mut peer) = start_bridge_with(resource_factory(dir.path().to_path_buf()));
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "2", "payload": "resource2",
        "package": "test", "path": "no-such-file.txt",
    }))
    .await;

    let (_, close) = peer.collect_channel("2", false).await;
    assert_eq!(close["problem"], "not-found");
}

#[tokio::test]
async fn resource_rejects_path_traversal() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path(), "test", "{}", &[("file.txt", b"secret")]);

    let (_bridge, mut peer) = start_bridge_with(resource_factory(dir.path().to_path_buf()));
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "2", "payload": "resource2",
        "package": "test", "path": "../test/file.txt",
    }))
    .await;

    let (_, close) = peer.collect_channel("2", false).await;
    assert_eq!(close["problem"], "not-found");
}

#[tokio::test]
async fn resource_expands_templates() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path(), "base", "{}", &[("lib.js", b"library")]);
    write_package(
        dir.path(),
        "app",
        "{}",
        &[("index.html", b"<script src=\"/@@base@@/lib.js\"></script>" as &[u8])],
    );

    let (_bridge, mut peer) = start_bridge_with(resource_factory(dir.path().to_path_buf()));
    peer.handshake().await;

    peer.send_control(json!({
        "command": "open", "channel": "2", "payload": "resource2",
        "package": "app", "path": "index.html",
    }))
    .await;

    let (data, _close) = peer.collect_channel("2", false).await;
    let text = String::from_utf8(data).unwrap();
    // The marker became base's final checksum.
    assert!(text.contains("/$"), "no checksum substituted: {text:?}");
    assert!(!text.contains("@@"), "marker survived: {text:?}");
}
