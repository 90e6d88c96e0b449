//! Shared scaffolding for end-to-end kernel tests: a kernel served on
//! a temp socket, and a minimal protocol client.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;
use vivarium_core::protocol::{FrameCodec, Message, SyscallOp};
use vivarium_daemon::{server, Kernel, KernelConfig};

pub struct TestKernel {
    pub kernel: Arc<Kernel>,
    pub socket: PathBuf,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

impl TestKernel {
    /// Start a kernel on a fresh temp socket and wait for it to bind.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket = dir.path().join("vivarium.sock");

        let config = KernelConfig {
            socket_path: socket.clone(),
            enable_sandboxing: false,
            ..KernelConfig::default()
        };
        let kernel = Kernel::new(config);

        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(server::serve(Arc::clone(&kernel), rx));

        for _ in 0..200 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(socket.exists(), "kernel did not bind its socket");

        Self {
            kernel,
            socket,
            shutdown,
            _dir: dir,
        }
    }

    pub async fn client(&self) -> Client {
        Client::connect(&self.socket).await
    }

    /// Write a shell script into the kernel's temp dir and return its
    /// path.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self._dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create script");
        writeln!(file, "{body}").expect("write script");
        path
    }
}

impl Drop for TestKernel {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.kernel.agents.stop_all();
    }
}

/// A protocol client speaking the framed syscall protocol.
pub struct Client {
    framed: Framed<UnixStream, FrameCodec>,
    pub agent_id: u32,
}

impl Client {
    pub async fn connect(socket: &Path) -> Self {
        let stream = UnixStream::connect(socket).await.expect("connect");
        Self {
            framed: Framed::new(stream, FrameCodec::new()),
            agent_id: 0,
        }
    }

    /// One raw request/response round trip.
    pub async fn call_raw(&mut self, opcode: u8, payload: Vec<u8>) -> Message {
        self.framed
            .send(Message::raw(self.agent_id, opcode, payload))
            .await
            .expect("send");
        let response = self
            .framed
            .next()
            .await
            .expect("connection closed")
            .expect("decode");
        self.agent_id = response.agent_id;
        response
    }

    /// JSON request/response round trip.
    pub async fn call(&mut self, op: SyscallOp, payload: Value) -> Value {
        let response = self.call_raw(op as u8, payload.to_string().into_bytes()).await;
        assert_eq!(response.opcode, op as u8, "response opcode mismatch");
        serde_json::from_slice(&response.payload).expect("response is JSON")
    }

    /// Like [`Self::call`] but asserting `success: true`.
    pub async fn call_ok(&mut self, op: SyscallOp, payload: Value) -> Value {
        let response = self.call(op, payload).await;
        assert_eq!(
            response["success"], true,
            "expected success, got: {response}"
        );
        response
    }

    /// Next frame without sending anything; `None` when the kernel
    /// closed the connection.
    pub async fn recv(&mut self) -> Option<Message> {
        match self.framed.next().await {
            Some(Ok(msg)) => Some(msg),
            _ => None,
        }
    }

    /// Access the raw stream for malformed-bytes tests.
    pub fn stream_mut(&mut self) -> &mut UnixStream {
        self.framed.get_mut()
    }
}

