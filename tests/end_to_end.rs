//! End-to-end integration tests: launch the real `gopherd` binary as a
//! subprocess against a scratch content root, and exercise it over real
//! TCP sockets. Grounded on the teacher repo's `tests/server_chunked.rs`
//! (spawn server, sleep for bind, connect, assert, clean up), adapted from
//! an in-process `thread::spawn` to a subprocess launch since `gopherd`
//! forks worker processes of its own and cannot run as a library call on
//! the test thread.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread::sleep;
use std::time::Duration;

/// Distinct ports per test so the whole suite can run with `cargo test`'s
/// default parallelism without two workers racing for the same bind.
static NEXT_PORT: AtomicU16 = AtomicU16::new(17_070);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

struct ServerHandle {
    child: Child,
    port: u16,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn scratch_root(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gopherd-test-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("create scratch content root");
    dir
}

fn spawn_server(root: &Path, port: u16, indexfile: &str, maxclients: u32, timeout: u64) -> ServerHandle {
    let child = Command::new(env!("CARGO_BIN_EXE_gopherd"))
        .arg("--directory")
        .arg(root)
        .arg("--hostname")
        .arg("localhost")
        .arg("--indexfile")
        .arg(indexfile)
        .arg("--port")
        .arg(port.to_string())
        .arg("--maxclients")
        .arg(maxclients.to_string())
        .arg("--timeout")
        .arg(timeout.to_string())
        .arg("--workers")
        .arg("1")
        .spawn()
        .expect("failed to launch gopherd");

    // The worker binds its listener very early in startup; this is generous
    // enough on a loaded CI box without making every test slow.
    sleep(Duration::from_millis(300));

    ServerHandle { child, port }
}

fn request(port: u16, line: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to gopherd");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream.write_all(line).unwrap();
    stream.flush().unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn serves_a_world_readable_static_file_verbatim() {
    let root = scratch_root("static-file");
    fs::write(root.join("hello.txt"), b"hello\n").unwrap();
    fs::set_permissions(root.join("hello.txt"), fs::Permissions::from_mode(0o644)).unwrap();

    let port = next_port();
    let _server = spawn_server(&root, port, ".gophermap", 1000, 10);

    let response = request(port, b"/hello.txt\r\n");
    assert_eq!(response, b"hello\n");
}

#[test]
fn empty_selector_serves_the_index_file_at_the_content_root() {
    let root = scratch_root("index-file");
    let body = "iWelcome\t\tlocalhost\t70\r\n.\r\n";
    fs::write(root.join("idx"), body).unwrap();
    fs::set_permissions(root.join("idx"), fs::Permissions::from_mode(0o644)).unwrap();

    let port = next_port();
    let _server = spawn_server(&root, port, "idx", 1000, 10);

    let response = request(port, b"\r\n");
    assert_eq!(response, body.as_bytes());
}

#[test]
fn rejects_parent_directory_traversal_with_403() {
    let root = scratch_root("traversal");
    fs::create_dir_all(root.join("sub")).unwrap();

    let port = next_port();
    let _server = spawn_server(&root, port, ".gophermap", 1000, 10);

    let response = request(port, b"/../etc/passwd\r\n");
    assert_eq!(response, b"3403 Forbidden\r\n.\r\n");
}

#[test]
fn rejects_hidden_segments_with_403() {
    let root = scratch_root("hidden");
    fs::write(root.join(".secret"), b"nope").unwrap();
    fs::set_permissions(root.join(".secret"), fs::Permissions::from_mode(0o644)).unwrap();

    let port = next_port();
    let _server = spawn_server(&root, port, ".gophermap", 1000, 10);

    let response = request(port, b"/.secret\r\n");
    assert_eq!(response, b"3403 Forbidden\r\n.\r\n");
}

#[test]
fn missing_file_yields_404() {
    let root = scratch_root("missing");

    let port = next_port();
    let _server = spawn_server(&root, port, ".gophermap", 1000, 10);

    let response = request(port, b"/nope\r\n");
    assert_eq!(response, b"3404 Not Found\r\n.\r\n");
}

#[test]
fn directory_without_an_index_file_yields_404() {
    let root = scratch_root("dir-no-index");
    fs::create_dir_all(root.join("empty")).unwrap();

    let port = next_port();
    let _server = spawn_server(&root, port, ".gophermap", 1000, 10);

    let response = request(port, b"/empty\r\n");
    assert_eq!(response, b"3404 Not Found\r\n.\r\n");
}

#[test]
fn overlong_request_without_crlf_yields_400() {
    let root = scratch_root("overlong");

    let port = next_port();
    let _server = spawn_server(&root, port, ".gophermap", 1000, 10);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    // 511 payload bytes, no CR-LF anywhere in the first 512: the buffer
    // fills and the server must answer 400 rather than wait forever.
    stream.write_all(&vec![b'a'; 511]).unwrap();
    stream.flush().unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"3400 Bad Request\r\n.\r\n");
}

#[test]
fn idle_connection_with_no_bytes_sent_times_out_as_408() {
    let root = scratch_root("idle-timeout");

    let port = next_port();
    // A 1-second idle timeout keeps this test fast while still exercising
    // the real interval-timer sweep rather than a mocked clock.
    let _server = spawn_server(&root, port, ".gophermap", 1000, 1);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"3408 Request Timeout\r\n.\r\n");
}

#[test]
fn rejects_the_client_beyond_maxclients_with_503() {
    let root = scratch_root("max-clients");

    let port = next_port();
    let _server = spawn_server(&root, port, ".gophermap", 2, 10);

    // Two clients sit in ReadingRequest without sending anything, holding
    // the slots; a third over capacity must be refused immediately.
    let _first = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let _second = TcpStream::connect(("127.0.0.1", port)).unwrap();
    sleep(Duration::from_millis(100));

    let mut third = TcpStream::connect(("127.0.0.1", port)).unwrap();
    third.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut out = Vec::new();
    third.read_to_end(&mut out).unwrap();
    assert_eq!(out, b"3503 Service Unavailable\r\n.\r\n");
}

#[test]
fn cgi_script_receives_the_environment_and_its_stdout_becomes_the_response() {
    let root = scratch_root("cgi");
    fs::create_dir_all(root.join("cgi")).unwrap();
    let script = root.join("cgi").join("run");
    fs::write(
        &script,
        "#!/bin/sh\nprintf 'iSCRIPT_NAME=%s QUERY_STRING=%s SERVER_NAME=%s SERVER_PORT=%s\\t\\t%s\\t%s\\r\\n.\\r\\n' \"$SCRIPT_NAME\" \"$QUERY_STRING\" \"$SERVER_NAME\" \"$SERVER_PORT\" \"$SERVER_NAME\" \"$SERVER_PORT\"\n",
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let port = next_port();
    let _server = spawn_server(&root, port, ".gophermap", 1000, 10);

    let response = request(port, b"/cgi/run\tfoo\r\n");
    let text = String::from_utf8_lossy(&response);
    assert!(text.contains("SCRIPT_NAME=/cgi/run"));
    assert!(text.contains("QUERY_STRING=foo"));
    assert!(text.contains(&format!("SERVER_PORT={port}")));
}

#[test]
fn repeating_the_same_request_yields_identical_bytes() {
    let root = scratch_root("repeatable");
    fs::write(root.join("data.bin"), b"0123456789abcdef").unwrap();
    fs::set_permissions(root.join("data.bin"), fs::Permissions::from_mode(0o644)).unwrap();

    let port = next_port();
    let _server = spawn_server(&root, port, ".gophermap", 1000, 10);

    let first = request(port, b"/data.bin\r\n");
    let second = request(port, b"/data.bin\r\n");
    assert_eq!(first, second);
    assert_eq!(first, b"0123456789abcdef");
}
