//! Sprite handle and remote command execution
//!
//! A `Sprite` is one remote sandbox. Plain command execution runs over a
//! lazily created pool of multiplexed control connections (one pool per
//! sprite, torn down explicitly); interactive and detachable sessions get a
//! dedicated per-command WebSocket instead.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::client::{check, SpritesClient};
use crate::command::{SessionEvent, WsCommand};
use crate::error::Result;
use crate::mux::{ControlEndpoint, OpConn};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::protocol::SessionOptions;

/// A point-in-time snapshot of a sprite's filesystem and memory
#[derive(Debug, Clone, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint ID
    pub id: String,

    /// User-provided comment
    #[serde(default)]
    pub comment: Option<String>,

    /// Creation timestamp (RFC 3339)
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Outbound network policy for a sprite
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkPolicy {
    /// Ordered rules, first match wins
    pub rules: Vec<NetworkPolicyRule>,

    /// Named policy sets to include
    #[serde(default)]
    pub include: Vec<String>,
}

/// One domain rule in a network policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkPolicyRule {
    /// Domain pattern, `*` wildcards allowed
    pub domain: String,

    /// What to do with matching traffic
    pub action: PolicyAction,
}

/// Verdict for a matching network policy rule
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Deny,
}

#[derive(Serialize)]
struct CheckpointRequest<'a> {
    comment: &'a str,
}

/// Handle to one remote sandbox
pub struct Sprite {
    client: SpritesClient,
    name: String,
    pool: OnceCell<Arc<ConnectionPool>>,
}

impl fmt::Debug for Sprite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sprite").field("name", &self.name).finish()
    }
}

impl Sprite {
    pub(crate) fn new(client: SpritesClient, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
            pool: OnceCell::new(),
        }
    }

    /// Sprite name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build a command to run on the sprite
    pub fn command(&self, program: impl Into<String>) -> Command<'_> {
        Command {
            sprite: self,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            dir: None,
            tty: false,
            rows: 24,
            cols: 80,
        }
    }

    /// Open an interactive streaming session on a dedicated connection
    pub async fn exec(&self, opts: SessionOptions) -> Result<WsCommand> {
        let mut url = self
            .client
            .ws_url(&format!("v1/sprites/{}/exec", self.name))?;
        {
            let mut query = url.query_pairs_mut();
            for part in &opts.cmd {
                query.append_pair("cmd", part);
            }
            for pair in &opts.env {
                query.append_pair("env", pair);
            }
            if let Some(dir) = &opts.dir {
                query.append_pair("dir", dir);
            }
            query.append_pair("tty", if opts.tty { "true" } else { "false" });
            query.append_pair("rows", &opts.rows.to_string());
            query.append_pair("cols", &opts.cols.to_string());
            query.append_pair("stdin", if opts.stdin { "true" } else { "false" });
            if opts.detachable {
                query.append_pair("detachable", "true");
            }
        }
        WsCommand::connect(url, Some(self.client.token()), opts).await
    }

    /// Attach to an already-running session
    ///
    /// The session's TTY mode is negotiated from the server, not assumed.
    pub async fn attach(&self, session_id: &str) -> Result<WsCommand> {
        let url = self.client.ws_url(&format!(
            "v1/sprites/{}/sessions/{session_id}/attach",
            self.name
        ))?;
        let opts = SessionOptions {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        };
        WsCommand::connect(url, Some(self.client.token()), opts).await
    }

    /// Create a checkpoint of the sprite
    pub async fn checkpoint(&self, comment: &str) -> Result<Checkpoint> {
        let url = self
            .client
            .api_url(&format!("v1/sprites/{}/checkpoints", self.name))?;
        let response = self
            .client
            .http()
            .post(url)
            .bearer_auth(self.client.token())
            .json(&CheckpointRequest { comment })
            .send()
            .await?;
        let checkpoint: Checkpoint = check(response).await?.json().await?;
        debug!(sprite = %self.name, id = %checkpoint.id, "checkpoint created");
        Ok(checkpoint)
    }

    /// List the sprite's checkpoints
    pub async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>> {
        let url = self
            .client
            .api_url(&format!("v1/sprites/{}/checkpoints", self.name))?;
        let response = self
            .client
            .http()
            .get(url)
            .bearer_auth(self.client.token())
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Restore the sprite to a checkpoint
    pub async fn restore(&self, checkpoint_id: &str) -> Result<()> {
        let url = self.client.api_url(&format!(
            "v1/sprites/{}/checkpoints/{checkpoint_id}/restore",
            self.name
        ))?;
        let response = self
            .client
            .http()
            .post(url)
            .bearer_auth(self.client.token())
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Replace the sprite's outbound network policy
    pub async fn set_policy(&self, policy: NetworkPolicy) -> Result<()> {
        let url = self
            .client
            .api_url(&format!("v1/sprites/{}/policy", self.name))?;
        let response = self
            .client
            .http()
            .put(url)
            .bearer_auth(self.client.token())
            .json(&policy)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Fetch the sprite's current network policy
    pub async fn get_policy(&self) -> Result<NetworkPolicy> {
        let url = self
            .client
            .api_url(&format!("v1/sprites/{}/policy", self.name))?;
        let response = self
            .client
            .http()
            .get(url)
            .bearer_auth(self.client.token())
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Destroy the sprite and tear down its connection pool
    pub async fn destroy(&self) -> Result<()> {
        self.close().await;
        self.client.delete(&self.name).await
    }

    /// Tear down the sprite's connection pool without destroying the sprite
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }

    /// The sprite's control-connection pool, created lazily on first use
    async fn pool(&self) -> Result<&Arc<ConnectionPool>> {
        self.pool
            .get_or_try_init(|| async {
                let url = self
                    .client
                    .ws_url(&format!("v1/sprites/{}/control", self.name))?;
                let endpoint = ControlEndpoint {
                    url,
                    token: Some(self.client.token().to_string()),
                };
                Ok(Arc::new(ConnectionPool::new(endpoint, PoolConfig::default())))
            })
            .await
    }
}

/// Builder for a command executed on a sprite, std::process::Command style
pub struct Command<'a> {
    sprite: &'a Sprite,
    program: String,
    args: Vec<String>,
    env: Vec<String>,
    dir: Option<String>,
    tty: bool,
    rows: u16,
    cols: u16,
}

impl Command<'_> {
    /// Add an argument
    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the remote process
    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Set the working directory on the sprite
    pub fn current_dir(&mut self, dir: impl Into<String>) -> &mut Self {
        self.dir = Some(dir.into());
        self
    }

    /// Allocate a TTY with the given dimensions
    pub fn tty(&mut self, rows: u16, cols: u16) -> &mut Self {
        self.tty = true;
        self.rows = rows;
        self.cols = cols;
        self
    }

    fn to_options(&self, stdin: bool) -> SessionOptions {
        let mut cmd = Vec::with_capacity(1 + self.args.len());
        cmd.push(self.program.clone());
        cmd.extend(self.args.iter().cloned());
        SessionOptions {
            cmd,
            env: self.env.clone(),
            dir: self.dir.clone(),
            tty: self.tty,
            rows: self.rows,
            cols: self.cols,
            stdin,
            ..Default::default()
        }
    }

    /// Run the command to completion, capturing stdout and stderr
    pub async fn output(&mut self) -> Result<Output> {
        let opts = self.to_options(false);
        let pool = self.sprite.pool().await?.clone();
        let conn = pool.acquire().await?;
        let result = run_capture(&conn, &opts).await;
        pool.release(&conn).await;
        result
    }

    /// Start the command and return a handle to the running process
    pub async fn spawn(&mut self) -> Result<Child> {
        let opts = self.to_options(true);
        let pool = self.sprite.pool().await?.clone();
        let conn = pool.acquire().await?;
        match conn.start_op("exec", &opts).await {
            Ok(op) => Ok(Child {
                op,
                conn: Some(conn),
                pool,
            }),
            Err(e) => {
                pool.release(&conn).await;
                Err(e)
            }
        }
    }
}

async fn run_capture(conn: &crate::mux::ControlConnection, opts: &SessionOptions) -> Result<Output> {
    let mut op = conn.start_op("exec", opts).await?;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        match op.next_event().await {
            Some(Ok(SessionEvent::Stdout(data))) => stdout.extend_from_slice(&data),
            Some(Ok(SessionEvent::Stderr(data))) => stderr.extend_from_slice(&data),
            Some(Ok(SessionEvent::Message(_))) => {}
            Some(Ok(SessionEvent::Exit(status))) => {
                return Ok(Output {
                    status,
                    stdout,
                    stderr,
                })
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(crate::error::SpriteError::Protocol(
                    "operation ended before completion".to_string(),
                ))
            }
        }
    }
}

/// Captured result of a completed remote command
#[derive(Debug, Clone)]
pub struct Output {
    /// Exit code of the remote process
    pub status: i32,

    /// Captured stdout bytes
    pub stdout: Vec<u8>,

    /// Captured stderr bytes
    pub stderr: Vec<u8>,
}

impl Output {
    /// Whether the command exited with code 0
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout as a (lossy) string
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as a (lossy) string
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Handle to a spawned remote process
pub struct Child {
    op: OpConn,
    conn: Option<Arc<crate::mux::ControlConnection>>,
    pool: Arc<ConnectionPool>,
}

impl Child {
    /// Send data to the remote process's stdin
    pub async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        self.op.write(data).await
    }

    /// Close the remote process's stdin
    pub async fn close_stdin(&self) -> Result<()> {
        self.op.send_eof().await
    }

    /// Receive the next output event
    pub async fn next_event(&mut self) -> Option<Result<SessionEvent>> {
        self.op.next_event().await
    }

    /// Ask the server to signal the remote process (best-effort)
    pub async fn kill(&self) -> Result<()> {
        self.op.signal("SIGKILL").await
    }

    /// Wait for the process to exit and return the pooled connection
    pub async fn wait(&mut self) -> Result<i32> {
        let result = self.op.wait().await;
        self.release().await;
        result
    }

    async fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(&conn).await;
        }
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Detach the operation so the connection can be reused, then
            // return it to the pool from a task since Drop cannot await.
            self.op.close();
            let pool = self.pool.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        pool.release(&conn).await;
                    });
                }
                Err(_) => conn.close(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self, StreamTag};
    use crate::protocol::ControlEnvelope;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;
    use url::Url;

    /// Minimal control-channel server: every op echoes "hello\n" and exits 0
    async fn control_server() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve_control(stream));
            }
        });
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    async fn serve_control(stream: TcpStream) {
        let Ok(mut ws) = accept_async(stream).await else {
            return;
        };
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                if let Some(Ok(envelope)) = ControlEnvelope::parse(&text) {
                    assert_eq!(envelope.kind, "op.start");
                    let out = frame::encode(StreamTag::Stdout, b"hello\n");
                    ws.send(Message::Binary(out.into())).await.unwrap();
                    ws.send(Message::Text(
                        r#"control:{"type":"op.complete","args":{"exitCode":"0"}}"#.into(),
                    ))
                    .await
                    .unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_command_output_over_pooled_connection() {
        let base = control_server().await;
        let client = SpritesClient::with_base_url("test-token", base);
        let sprite = client.sprite("dev");

        let output = sprite
            .command("echo")
            .arg("hello")
            .current_dir("/workspace")
            .output()
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout_str(), "hello\n");
        assert_eq!(output.status, 0);
        sprite.close().await;
    }

    #[tokio::test]
    async fn test_sequential_commands_reuse_one_connection() {
        let base = control_server().await;
        let client = SpritesClient::with_base_url("test-token", base);
        let sprite = client.sprite("dev");

        for _ in 0..3 {
            let output = sprite.command("true").output().await.unwrap();
            assert!(output.success());
        }
        // One pooled connection served all three commands
        assert_eq!(sprite.pool().await.unwrap().size().await, 1);
        sprite.close().await;
    }

    #[tokio::test]
    async fn test_spawned_child_wait_releases_connection() {
        let base = control_server().await;
        let client = SpritesClient::with_base_url("test-token", base);
        let sprite = client.sprite("dev");

        let mut child = sprite.command("cat").spawn().await.unwrap();
        assert_eq!(child.wait().await.unwrap(), 0);

        // The released connection is idle again, so a follow-up command
        // does not grow the pool.
        let output = sprite.command("true").output().await.unwrap();
        assert!(output.success());
        assert_eq!(sprite.pool().await.unwrap().size().await, 1);
        sprite.close().await;
    }

    #[test]
    fn test_command_builder_maps_to_session_options() {
        let client =
            SpritesClient::with_base_url("tok", Url::parse("https://api.sprites.dev").unwrap());
        let sprite = client.sprite("dev");

        let mut command = sprite.command("bash");
        command
            .arg("-c")
            .arg("echo hi")
            .env("FOO", "bar")
            .current_dir("/workspace");
        let opts = command.to_options(true);

        assert_eq!(opts.cmd, vec!["bash", "-c", "echo hi"]);
        assert_eq!(opts.env, vec!["FOO=bar"]);
        assert_eq!(opts.dir.as_deref(), Some("/workspace"));
        assert!(opts.stdin);
        assert!(!opts.tty);
    }

    #[test]
    fn test_network_policy_serde() {
        let policy = NetworkPolicy {
            rules: vec![
                NetworkPolicyRule {
                    domain: "api.github.com".to_string(),
                    action: PolicyAction::Allow,
                },
                NetworkPolicyRule {
                    domain: "*".to_string(),
                    action: PolicyAction::Deny,
                },
            ],
            include: vec![],
        };
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains(r#""action":"allow""#));
        assert!(json.contains(r#""action":"deny""#));

        let parsed: NetworkPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, policy);
    }

    #[test]
    fn test_output_helpers() {
        let output = Output {
            status: 1,
            stdout: b"out".to_vec(),
            stderr: b"err".to_vec(),
        };
        assert!(!output.success());
        assert_eq!(output.stdout_str(), "out");
        assert_eq!(output.stderr_str(), "err");
    }
}
