//! Unix-domain push server streaming samples to the UI.
//!
//! Wire protocol: UTF-8 JSON objects, one per line. On connect the client
//! receives one `initial_state` frame replaying the recent ring tail; after
//! that the daemon pushes `sample` frames via `broadcast()`. Small
//! client→server frames (`{"type":"log", …}`) are noted in the daemon log;
//! invalid JSON and unknown types are ignored.
//!
//! The daemon may run under a different principal than the UI, so the
//! socket is opened up to non-owner access.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use rh_common::{Result, SampleSet};

/// How many recent samples are replayed to a newly connected client.
const REPLAY_SAMPLES: usize = 30;

struct Client {
    id: u64,
    stream: UnixStream,
}

struct ServerState {
    running: AtomicBool,
    next_client_id: AtomicU64,
    clients: Mutex<Vec<Client>>,
    /// Recent sample payloads, refreshed on every broadcast so connect-time
    /// replay equals the ring tail.
    replay: Mutex<VecDeque<Value>>,
    /// (latest max_score, ring sample count) for the initial_state frame.
    latest: Mutex<(u8, usize)>,
}

impl ServerState {
    fn drop_client(&self, id: u64) {
        let mut clients = self.clients.lock().unwrap();
        clients.retain(|c| c.id != id);
        debug!(count = clients.len(), "socket client disconnected");
    }
}

/// Push server bound to a Unix socket under the data directory.
pub struct PushServer {
    socket_path: PathBuf,
    state: Arc<ServerState>,
    accept_handle: Option<JoinHandle<()>>,
}

impl PushServer {
    /// Bind the socket and start the accept loop.
    pub fn start(socket_path: PathBuf) -> Result<Self> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o777))?;

        let state = Arc::new(ServerState {
            running: AtomicBool::new(true),
            next_client_id: AtomicU64::new(1),
            clients: Mutex::new(Vec::new()),
            replay: Mutex::new(VecDeque::with_capacity(REPLAY_SAMPLES)),
            latest: Mutex::new((0, 0)),
        });

        let accept_state = Arc::clone(&state);
        let accept_handle = std::thread::Builder::new()
            .name("push-accept".into())
            .spawn(move || accept_loop(listener, accept_state))
            .expect("spawn accept loop");

        info!(path = %socket_path.display(), "socket server started");
        Ok(Self {
            socket_path,
            state,
            accept_handle: Some(accept_handle),
        })
    }

    /// Whether any client is connected (lets the loop skip serialization).
    pub fn has_clients(&self) -> bool {
        !self.state.clients.lock().unwrap().is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.state.clients.lock().unwrap().len()
    }

    /// Serialize once and push to every client; writers that fail are
    /// discarded. Also refreshes the replay cache.
    pub fn broadcast(&self, sample: &SampleSet, ring_len: usize) -> Result<()> {
        let payload = serde_json::to_value(sample)?;

        {
            let mut replay = self.state.replay.lock().unwrap();
            if replay.len() == REPLAY_SAMPLES {
                replay.pop_front();
            }
            replay.push_back(payload.clone());
            *self.state.latest.lock().unwrap() = (sample.max_score, ring_len);
        }

        let mut frame = payload;
        if let Some(obj) = frame.as_object_mut() {
            obj.insert("type".into(), json!("sample"));
            obj.insert("sample_count".into(), json!(ring_len));
        }
        let mut data = serde_json::to_vec(&frame)?;
        data.push(b'\n');

        let mut clients = self.state.clients.lock().unwrap();
        clients.retain_mut(|client| match client.stream.write_all(&data) {
            Ok(()) => true,
            Err(e) => {
                debug!(client = client.id, error = %e, "dropping client on write failure");
                false
            }
        });
        Ok(())
    }

    /// Close the listener and every client, then remove the socket file.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        let mut clients = self.state.clients.lock().unwrap();
        for client in clients.drain(..) {
            let _ = client.stream.shutdown(std::net::Shutdown::Both);
        }
        drop(clients);
        let _ = std::fs::remove_file(&self.socket_path);
        info!("socket server stopped");
    }
}

impl Drop for PushServer {
    fn drop(&mut self) {
        if self.state.running.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

fn accept_loop(listener: UnixListener, state: Arc<ServerState>) {
    while state.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = register_client(stream, &state) {
                    debug!(error = %e, "client setup failed");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn register_client(mut stream: UnixStream, state: &Arc<ServerState>) -> std::io::Result<()> {
    // Replay the ring tail before the client joins the broadcast set, so it
    // observes samples in monotonically advancing order.
    let initial = {
        let replay = state.replay.lock().unwrap();
        let (max_score, sample_count) = *state.latest.lock().unwrap();
        json!({
            "type": "initial_state",
            "samples": replay.iter().cloned().collect::<Vec<Value>>(),
            "max_score": max_score,
            "sample_count": sample_count,
        })
    };
    let mut data = serde_json::to_vec(&initial)?;
    data.push(b'\n');
    stream.write_all(&data)?;

    let id = state.next_client_id.fetch_add(1, Ordering::SeqCst);
    let reader_stream = stream.try_clone()?;
    reader_stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    {
        let mut clients = state.clients.lock().unwrap();
        clients.push(Client { id, stream });
        info!(count = clients.len(), "socket client connected");
    }

    let reader_state = Arc::clone(state);
    std::thread::Builder::new()
        .name(format!("push-client-{id}"))
        .spawn(move || client_reader(reader_stream, id, reader_state))
        .map(|_| ())
}

/// Consume client→server frames until EOF or shutdown.
fn client_reader(stream: UnixStream, id: u64, state: Arc<ServerState>) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while state.running.load(Ordering::SeqCst) {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => match serde_json::from_str::<Value>(line.trim()) {
                Ok(frame) => match frame.get("type").and_then(Value::as_str) {
                    Some("log") => {
                        let message = frame
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        info!(client = id, message, "client log");
                    }
                    other => debug!(client = id, frame_type = ?other, "ignoring client frame"),
                },
                Err(_) => debug!(client = id, "ignoring invalid client frame"),
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => break,
        }
    }
    state.drop_client(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::BufRead;

    fn sample(max_score: u8) -> SampleSet {
        SampleSet {
            timestamp: Utc::now(),
            elapsed_ms: 7,
            process_count: 200,
            max_score,
            rogues: Vec::new(),
        }
    }

    fn connect(path: &std::path::Path) -> BufReader<UnixStream> {
        // The accept loop polls at 100ms; retry briefly.
        for _ in 0..50 {
            if let Ok(stream) = UnixStream::connect(path) {
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                return BufReader::new(stream);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("could not connect to {}", path.display());
    }

    fn read_frame(reader: &mut BufReader<UnixStream>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    fn wait_for_clients(server: &PushServer, n: usize) {
        for _ in 0..100 {
            if server.client_count() >= n {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("client never registered");
    }

    #[test]
    fn initial_state_then_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let server = PushServer::start(path.clone()).unwrap();

        let mut client = connect(&path);
        let initial = read_frame(&mut client);
        assert_eq!(initial["type"], "initial_state");
        assert_eq!(initial["samples"].as_array().unwrap().len(), 0);
        assert_eq!(initial["max_score"], 0);

        wait_for_clients(&server, 1);
        server.broadcast(&sample(42), 10).unwrap();

        let frame = read_frame(&mut client);
        assert_eq!(frame["type"], "sample");
        assert_eq!(frame["max_score"], 42);
        assert_eq!(frame["process_count"], 200);
        assert_eq!(frame["sample_count"], 10);
        assert!(frame["timestamp"].is_string());

        server.stop();
    }

    #[test]
    fn second_client_gets_replayed_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let server = PushServer::start(path.clone()).unwrap();

        // Broadcast with no clients still feeds the replay cache.
        server.broadcast(&sample(10), 1).unwrap();
        server.broadcast(&sample(20), 2).unwrap();

        let mut client = connect(&path);
        let initial = read_frame(&mut client);
        let samples = initial["samples"].as_array().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0]["max_score"], 10);
        assert_eq!(samples[1]["max_score"], 20);
        assert_eq!(initial["max_score"], 20);
        assert_eq!(initial["sample_count"], 2);

        server.stop();
    }

    #[test]
    fn replay_cache_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let server = PushServer::start(path.clone()).unwrap();

        for i in 0..40u8 {
            server.broadcast(&sample(i), i as usize).unwrap();
        }

        let mut client = connect(&path);
        let initial = read_frame(&mut client);
        let samples = initial["samples"].as_array().unwrap();
        assert_eq!(samples.len(), REPLAY_SAMPLES);
        // Oldest retained sample is number 10 (40 - 30).
        assert_eq!(samples[0]["max_score"], 10);

        server.stop();
    }

    #[test]
    fn client_log_frames_and_garbage_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let server = PushServer::start(path.clone()).unwrap();

        let mut client = connect(&path);
        let _ = read_frame(&mut client);
        wait_for_clients(&server, 1);

        let stream = client.get_mut();
        stream
            .write_all(b"{\"type\":\"log\",\"message\":\"tui connected\"}\nnot json at all\n{\"type\":\"mystery\"}\n")
            .unwrap();

        // Server keeps running and still delivers samples.
        std::thread::sleep(Duration::from_millis(150));
        server.broadcast(&sample(5), 1).unwrap();
        let frame = read_frame(&mut client);
        assert_eq!(frame["type"], "sample");

        server.stop();
    }

    #[test]
    fn disconnected_client_is_dropped_on_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let server = PushServer::start(path.clone()).unwrap();

        {
            let mut client = connect(&path);
            let _ = read_frame(&mut client);
            wait_for_clients(&server, 1);
        } // client dropped

        // The write may succeed once into the socket buffer; a second
        // broadcast observes the broken pipe.
        for _ in 0..10 {
            server.broadcast(&sample(1), 1).unwrap();
            if !server.has_clients() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!server.has_clients());

        server.stop();
    }

    #[test]
    fn stop_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let server = PushServer::start(path.clone()).unwrap();
        assert!(path.exists());
        server.stop();
        assert!(!path.exists());
    }

    #[test]
    fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        std::fs::write(&path, b"stale").unwrap();
        let server = PushServer::start(path.clone()).unwrap();
        assert!(path.exists());
        server.stop();
    }
}
