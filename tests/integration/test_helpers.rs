//! Shared helpers for integration tests.
//!
//! Provides a coordinator bound on an ephemeral port, agent
//! configuration pointing at it, and scripted stand-ins for the capture
//! process and the upload transport.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use camfleet::api::handler::AppState;
use camfleet::api::server;
use camfleet::config::{AgentConfig, ServerConfig};
use camfleet::orchestrator::supervisor::{CaptureProcess, ProcessHandle, ProcessSupervisor};
use camfleet::orchestrator::uploader::UploadTransport;
use camfleet::persistence::db;
use camfleet::{AppError, Result};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Bearer token every test coordinator expects.
pub const TOKEN: &str = "test-fleet-token";

/// A coordinator serving on `127.0.0.1:<ephemeral>`.
pub struct TestServer {
    pub base_url: String,
    pub storage: TempDir,
    pub state: Arc<AppState>,
    ct: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

/// Start a coordinator with an in-memory database and temp storage.
pub async fn start_server() -> TestServer {
    let storage = tempfile::tempdir().expect("tempdir");
    let mut config =
        ServerConfig::from_toml_str("bind_address = \"127.0.0.1\"\nhttp_port = 0\n")
            .expect("valid config");
    config.storage_path = storage.path().to_path_buf();
    config.auth_token = TOKEN.into();

    let db = Arc::new(db::connect_memory().await.expect("db"));
    let state = Arc::new(AppState::new(Arc::new(config), db));
    let listener = server::bind(&state.config).await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let ct = CancellationToken::new();
    let serve_state = Arc::clone(&state);
    let serve_ct = ct.clone();
    tokio::spawn(async move {
        let _ = server::serve(serve_state, listener, serve_ct).await;
    });

    TestServer {
        base_url: format!("http://{addr}"),
        storage,
        state,
        ct,
    }
}

/// Agent configuration for `AGENT-1` with cameras `cam1` and `cam2`.
pub fn agent_config(central_server: &str, temp_dir: &Path) -> AgentConfig {
    let toml = format!(
        r#"
device_id = "AGENT-1"
central_server = "{central_server}"
temp_dir = '{temp}'
retention_seconds = 3600

[cameras]
cam1 = "rtsp://192.168.1.10/stream1"
cam2 = "rtsp://192.168.1.11/stream1"
"#,
        temp = temp_dir.display(),
    );
    let mut config = AgentConfig::from_toml_str(&toml).expect("valid agent config");
    config.auth_token = TOKEN.into();
    config
}

struct FakeProcess {
    pid: u32,
    live: Arc<AtomicBool>,
}

impl CaptureProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_live(&mut self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn terminate(&mut self) -> Result<()> {
        self.live.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Supervisor whose "captures" write a small file and run until told to exit.
#[derive(Default)]
pub struct FakeSupervisor {
    live: Mutex<HashMap<PathBuf, Arc<AtomicBool>>>,
    adopted_live: Mutex<Vec<u32>>,
    pub fail_spawn: AtomicBool,
}

impl FakeSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the capture writing `output` exit on its own.
    pub fn finish(&self, output: &Path) {
        if let Some(flag) = self.live.lock().unwrap().get(output) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Whether the capture writing `output` is still running.
    pub fn is_running(&self, output: &Path) -> bool {
        self.live
            .lock()
            .unwrap()
            .get(output)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Report `pid` as alive when adopted.
    pub fn keep_alive(&self, pid: u32) {
        self.adopted_live.lock().unwrap().push(pid);
    }
}

impl ProcessSupervisor for FakeSupervisor {
    fn spawn(
        &self,
        _camera_url: &str,
        output_path: &Path,
        _duration_seconds: u64,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessHandle>> + Send + '_>> {
        let output = output_path.to_path_buf();
        Box::pin(async move {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(AppError::SpawnFailure("simulated".into()));
            }
            std::fs::write(&output, b"fake video payload").map_err(AppError::from)?;
            let flag = Arc::new(AtomicBool::new(true));
            self.live
                .lock()
                .unwrap()
                .insert(output, Arc::clone(&flag));
            Ok(ProcessHandle::new(FakeProcess {
                pid: 40_000,
                live: flag,
            }))
        })
    }

    fn adopt(&self, pid: u32) -> ProcessHandle {
        let live = self.adopted_live.lock().unwrap().contains(&pid);
        ProcessHandle::new(FakeProcess {
            pid,
            live: Arc::new(AtomicBool::new(live)),
        })
    }
}

/// Upload transport replaying scripted HTTP statuses (200 once exhausted).
#[derive(Default)]
pub struct ScriptedTransport {
    statuses: Mutex<VecDeque<u16>>,
    pub sent: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn with_statuses(statuses: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.iter().copied().collect()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl UploadTransport for ScriptedTransport {
    fn send(
        &self,
        _path: &Path,
        session_id: &str,
        _camera_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.sent.lock().unwrap().push(session_id.to_owned());
        let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
        Box::pin(async move {
            if (200..300).contains(&status) {
                Ok(())
            } else {
                Err(AppError::Transport {
                    status: Some(status),
                    detail: "simulated".into(),
                })
            }
        })
    }
}
