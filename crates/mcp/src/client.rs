//! JSON-RPC over the stdio of a tool-server subprocess.
//!
//! One writer task drains an outgoing queue into stdin. One reader task
//! routes stdout lines: responses complete the pending request with the
//! same id, server-to-client requests (`sampling/createMessage`, `ping`,
//! `roots/list`) are answered on their own task, notifications are logged.
//!
//! A server request is owned by the newest outstanding call. When that call
//! is dropped before its reply arrives (its job was cancelled), the server
//! is sent `notifications/cancelled` and the work done on the call's behalf
//! is cancelled with it.

use async_trait::async_trait;
use cadenza_config::McpServerConfig;
use cadenza_core::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sampling::SamplingHandler;
use crate::server::ToolServer;
use crate::types::{McpResource, McpResourceTemplate, McpTool};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const STDERR_CAPTURE_LIMIT: usize = 2000;

const METHOD_NOT_FOUND: i64 = -32601;
const INTERNAL_ERROR: i64 = -32603;
const REQUEST_CANCELLED: i64 = -32800;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A message read from the server.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, ProtocolError>,
    },
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
    },
}

fn rpc_error(error: &Value) -> ProtocolError {
    ProtocolError::Rpc {
        code: error.get("code").and_then(Value::as_i64).unwrap_or(INTERNAL_ERROR),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string),
    }
}

pub(crate) fn classify(line: &str) -> Option<Incoming> {
    let message: Value = serde_json::from_str(line).ok()?;
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").filter(|id| !id.is_null());
    match (method, id) {
        (Some(method), Some(id)) => Some(Incoming::Request {
            id: id.clone(),
            method: method.to_string(),
            params: message.get("params").cloned().unwrap_or(Value::Null),
        }),
        (Some(method), None) => Some(Incoming::Notification {
            method: method.to_string(),
        }),
        (None, Some(id)) => {
            let outcome = match message.get("error") {
                Some(error) => Err(rpc_error(error)),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            Some(Incoming::Response {
                id: id.as_u64()?,
                outcome,
            })
        }
        (None, None) => None,
    }
}

pub(crate) async fn answer(
    sampler: Option<&dyn SamplingHandler>,
    method: &str,
    params: Value,
) -> Result<Value, ProtocolError> {
    match method {
        "sampling/createMessage" => match sampler {
            Some(sampler) => sampler.create_message(params).await,
            None => Err(ProtocolError::Rpc {
                code: METHOD_NOT_FOUND,
                message: "sampling is not supported by this client".into(),
            }),
        },
        "ping" => Ok(json!({})),
        "roots/list" => Ok(json!({ "roots": [] })),
        other => Err(ProtocolError::Rpc {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {other}"),
        }),
    }
}

pub(crate) fn reply_message(id: Value, outcome: Result<Value, ProtocolError>) -> String {
    match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(ProtocolError::Rpc { code, message }) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        }),
        Err(other) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": INTERNAL_ERROR, "message": other.to_string() },
        }),
    }
    .to_string()
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(500) {
        Some((at, _)) => &line[..at],
        None => line,
    }
}

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, ProtocolError>>>>>;

/// Cancellation tokens of outstanding calls, by request id.
type InFlight = Arc<StdMutex<BTreeMap<u64, CancellationToken>>>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The token a server request runs under: the newest outstanding call, or
/// the client itself when nothing is outstanding.
fn owner_token(in_flight: &InFlight, shutdown: &CancellationToken) -> CancellationToken {
    lock(in_flight)
        .values()
        .next_back()
        .cloned()
        .unwrap_or_else(|| shutdown.clone())
}

/// Bookkeeping for one outstanding request, released on drop.
struct CallGuard {
    id: u64,
    pending: Pending,
    in_flight: InFlight,
    token: CancellationToken,
    tx_req: mpsc::Sender<String>,
    /// Set once the request got a reply or never reached the server.
    settled: bool,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
        lock(&self.in_flight).remove(&self.id);
        self.token.cancel();
        if !self.settled {
            let notice = json!({
                "jsonrpc": "2.0",
                "method": "notifications/cancelled",
                "params": { "requestId": self.id, "reason": "request abandoned" },
            });
            // Dropped inside a destructor, so the queue is not awaited.
            let _ = self.tx_req.try_send(notice.to_string());
        }
    }
}

pub struct StdioClient {
    server: String,
    child: Mutex<Option<Child>>,
    next_id: AtomicU64,
    pending: Pending,
    in_flight: InFlight,
    shutdown: CancellationToken,
    tx_req: mpsc::Sender<String>,
    stderr: Arc<Mutex<String>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl StdioClient {
    /// Spawn the server, complete the handshake, and return the live client.
    ///
    /// Any failure before the handshake completes is
    /// [`ProtocolError::HandshakeFailed`], carrying whatever the server
    /// wrote to stderr.
    pub async fn connect(
        config: &McpServerConfig,
        sampler: Option<Arc<dyn SamplingHandler>>,
    ) -> Result<Arc<Self>, ProtocolError> {
        info!(server = %config.id, command = %config.command, "Starting MCP server");
        let handshake = |reason: String| ProtocolError::HandshakeFailed {
            server: config.id.clone(),
            reason,
        };

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        let mut child = command.spawn().map_err(|e| handshake(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| handshake("failed to open stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| handshake("failed to open stdout".into()))?;
        let stderr_pipe = child.stderr.take();

        let client = Self::over_streams(&config.id, stdout, stdin, sampler);
        *client.child.lock().await = Some(child);

        if let Some(stderr_pipe) = stderr_pipe {
            let stderr_log = client.stderr.clone();
            let task = tokio::spawn(async move {
                let mut reader = BufReader::new(stderr_pipe).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let mut log = stderr_log.lock().await;
                    if log.len() < STDERR_CAPTURE_LIMIT {
                        log.push_str(&line);
                        log.push('\n');
                    }
                    debug!("MCP STDERR: {}", line);
                }
            });
            lock(&client.tasks).push(task);
        }

        let outcome = tokio::time::timeout(INITIALIZE_TIMEOUT, client.initialize()).await;
        let reason = match outcome {
            Ok(Ok(())) => {
                info!(server = %config.id, "MCP server initialized");
                return Ok(client);
            }
            Err(_elapsed) => "initialization timed out".to_string(),
            Ok(Err(e)) => e.to_string(),
        };
        let stderr = client.stderr.lock().await.clone();
        error!(server = %config.id, reason = %reason, stderr = %stderr, "MCP server failed to initialize");
        let _ = client.close().await;
        Err(handshake(format!("{reason}. Stderr: {stderr}")))
    }

    /// Run the protocol over an already open byte stream pair. No handshake
    /// is performed.
    pub fn over_streams<R, W>(
        server: &str,
        reader: R,
        writer: W,
        sampler: Option<Arc<dyn SamplingHandler>>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx_req, mut rx_req) = mpsc::channel::<String>(100);
        let pending: Pending = Arc::default();
        let in_flight: InFlight = Arc::default();
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let name = server.to_string();
        let mut writer = tokio::io::BufWriter::new(writer);
        tasks.push(tokio::spawn(async move {
            while let Some(message) = rx_req.recv().await {
                debug!(server = %name, "MCP TX: {}", preview(&message));
                if let Err(e) = writer.write_all(format!("{message}\n").as_bytes()).await {
                    error!(server = %name, error = %e, "Failed to write to MCP stdin");
                    break;
                }
                let _ = writer.flush().await;
            }
        }));

        let name = server.to_string();
        let routes = pending.clone();
        let owners = in_flight.clone();
        let client_shutdown = shutdown.clone();
        let replies = tx_req.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %name, "MCP RX: {}", preview(&line));
                match classify(&line) {
                    Some(Incoming::Response { id, outcome }) => {
                        let route = lock(&routes).remove(&id);
                        if let Some(tx) = route {
                            let _ = tx.send(outcome);
                        }
                    }
                    Some(Incoming::Request { id, method, params }) => {
                        let owner = owner_token(&owners, &client_shutdown);
                        let sampler = sampler.clone();
                        let replies = replies.clone();
                        let name = name.clone();
                        tokio::spawn(async move {
                            let outcome = tokio::select! {
                                biased;
                                _ = owner.cancelled() => {
                                    debug!(server = %name, method = %method, "Server request cancelled with its call");
                                    Err(ProtocolError::Rpc {
                                        code: REQUEST_CANCELLED,
                                        message: "request cancelled".into(),
                                    })
                                }
                                outcome = answer(sampler.as_deref(), &method, params) => outcome,
                            };
                            let _ = replies.send(reply_message(id, outcome)).await;
                        });
                    }
                    Some(Incoming::Notification { method }) => {
                        debug!(server = %name, method = %method, "MCP notification");
                    }
                    None => warn!(server = %name, "Unparsed MCP RX: {}", preview(&line)),
                }
            }
            warn!(server = %name, "MCP stdout closed");
            lock(&routes).clear();
        }));

        Arc::new(Self {
            server: server.to_string(),
            child: Mutex::new(None),
            next_id: AtomicU64::new(1),
            pending,
            in_flight,
            shutdown,
            tx_req,
            stderr: Arc::default(),
            tasks: StdMutex::new(tasks),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        })
        .map_err(|e| ProtocolError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let token = self.shutdown.child_token();
        lock(&self.pending).insert(id, tx);
        lock(&self.in_flight).insert(id, token.clone());
        let mut guard = CallGuard {
            id,
            pending: self.pending.clone(),
            in_flight: self.in_flight.clone(),
            token,
            tx_req: self.tx_req.clone(),
            // initialize may not be cancelled
            settled: method == "initialize",
        };

        if self.tx_req.send(request).await.is_err() {
            guard.settled = true;
            return Err(ProtocolError::Transport(format!(
                "MCP server {} is not running",
                self.server
            )));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => {
                guard.settled = true;
                outcome
            }
            Ok(Err(_)) => {
                guard.settled = true;
                Err(ProtocolError::Transport(format!(
                    "connection to MCP server {} closed",
                    self.server
                )))
            }
            Err(_elapsed) => Err(ProtocolError::Transport(format!(
                "{method} timed out after {}s",
                REQUEST_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn notify(&self, method: &str) -> Result<(), ProtocolError> {
        let notification = json!({ "jsonrpc": "2.0", "method": method }).to_string();
        self.tx_req
            .send(notification)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))
    }

    async fn initialize(&self) -> Result<(), ProtocolError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "roots": { "listChanged": true },
                "sampling": {}
            },
            "clientInfo": {
                "name": "cadenza",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let response = self.call("initialize", Some(params)).await?;
        debug!(server = %self.server, "MCP initialized: {}", response);
        self.notify("notifications/initialized").await
    }

    /// Collect every page of a list method.
    async fn list_all<T: DeserializeOwned>(
        &self,
        method: &str,
        key: &str,
    ) -> Result<Vec<T>, ProtocolError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|cursor| json!({ "cursor": cursor }));
            let result = self.call(method, params).await?;
            if let Some(page) = result.get(key).and_then(Value::as_array) {
                items.extend(
                    page.iter()
                        .filter_map(|item| serde_json::from_value(item.clone()).ok()),
                );
            }
            match result.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next) => {
                    cursor = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl ToolServer for StdioClient {
    async fn list_tools(&self) -> Result<Vec<McpTool>, ProtocolError> {
        self.list_all("tools/list", "tools").await
    }

    async fn list_resources(&self) -> Result<Vec<McpResource>, ProtocolError> {
        self.list_all("resources/list", "resources").await
    }

    async fn list_resource_templates(&self) -> Result<Vec<McpResourceTemplate>, ProtocolError> {
        self.list_all("resources/templates/list", "resourceTemplates")
            .await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ProtocolError> {
        let params = json!({ "name": name, "arguments": arguments });
        self.call("tools/call", Some(params)).await
    }

    async fn read_resource(&self, uri: &str) -> Result<Value, ProtocolError> {
        self.call("resources/read", Some(json!({ "uri": uri }))).await
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        self.shutdown.cancel();
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        lock(&self.pending).clear();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            child
                .kill()
                .await
                .map_err(|e| ProtocolError::Transport(e.to_string()))?;
            info!(server = %self.server, "MCP server stopped");
        }
        Ok(())
    }
}
