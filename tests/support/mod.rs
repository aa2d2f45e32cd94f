//! In-process mock backend speaking enough of the v3 protocol to drive the
//! connector, pool and multiplexer end to end.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

const SSL_REQUEST_CODE: i32 = 80877103;
const CANCEL_REQUEST_CODE: i32 = 80877102;

/// How sessions authenticate.
#[derive(Clone)]
pub enum AuthMode {
    Trust,
    /// MD5 challenge with this salt; the session must present the digest for
    /// (user, password).
    Md5 {
        salt: [u8; 4],
        user: String,
        password: String,
    },
    /// Always reject with 28P01.
    RejectPassword,
}

/// Knobs shared by every session of one mock server.
pub struct MockConfig {
    pub auth: AuthMode,
    /// Value served for `SHOW transaction_read_only`.
    pub read_only: bool,
}

impl Default for MockConfig {
    fn default() -> MockConfig {
        MockConfig {
            auth: AuthMode::Trust,
            read_only: false,
        }
    }
}

/// Everything the tests may want to assert about server-side observations.
#[derive(Default)]
pub struct MockState {
    /// (statement name, sql) of every Parse received.
    pub parses: Vec<(String, String)>,
    /// Statement names of every Close received.
    pub closes: Vec<String>,
    /// Total sessions accepted (cancel sockets excluded).
    pub sessions: usize,
    /// Simple-query texts received, in order per arrival.
    pub queries: Vec<String>,
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<MockState>>,
    config: Arc<MockConfig>,
}

impl MockServer {
    pub async fn start(config: MockConfig) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(MockState::default()));
        let config = Arc::new(config);
        let cancels: Arc<Mutex<HashMap<i32, Arc<Notify>>>> = Arc::new(Mutex::new(HashMap::new()));
        let pids = Arc::new(AtomicI32::new(1000));

        let server = MockServer {
            addr,
            state: state.clone(),
            config: config.clone(),
        };

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let state = state.clone();
                let config = config.clone();
                let cancels = cancels.clone();
                let pids = pids.clone();
                tokio::spawn(async move {
                    let _ = Session {
                        socket,
                        state,
                        config,
                        cancels,
                        pid: pids.fetch_add(1, Ordering::Relaxed),
                        statements: HashMap::new(),
                    }
                    .run()
                    .await;
                });
            }
        });

        server
    }

    pub fn connection_string(&self, extra: &str) -> String {
        format!(
            "Host=127.0.0.1:{};Username=mock;Password=mock;Database=mockdb;{extra}",
            self.addr.port()
        )
    }
}

struct Session {
    socket: TcpStream,
    state: Arc<Mutex<MockState>>,
    config: Arc<MockConfig>,
    cancels: Arc<Mutex<HashMap<i32, Arc<Notify>>>>,
    pid: i32,
    /// Named (and unnamed) statements prepared on this session.
    statements: HashMap<String, String>,
}

enum Frontend {
    Parse { sql: String },
    Bind { statement: String },
    Describe,
    Execute,
    Close { name: String },
    Sync,
}

impl Session {
    async fn run(mut self) -> std::io::Result<()> {
        // Startup phase, looping past SSLRequest.
        loop {
            let len = self.socket.read_i32().await?;
            let mut body = vec![0u8; len as usize - 4];
            self.socket.read_exact(&mut body).await?;
            let mut body = BytesMut::from(&body[..]);
            let code = body.get_i32();
            if code == SSL_REQUEST_CODE {
                self.socket.write_all(b"N").await?;
                continue;
            }
            if code == CANCEL_REQUEST_CODE {
                let pid = body.get_i32();
                let _secret = body.get_i32();
                let notify = self.cancels.lock().get(&pid).cloned();
                if let Some(notify) = notify {
                    notify.notify_waiters();
                }
                return Ok(());
            }
            // StartupMessage; parameters are not interesting here.
            break;
        }

        self.state.lock().sessions += 1;
        let cancel = Arc::new(Notify::new());
        self.cancels.lock().insert(self.pid, cancel.clone());

        if !self.authenticate().await? {
            return Ok(());
        }

        let mut out = BytesMut::new();
        put_auth_ok(&mut out);
        put_parameter_status(&mut out, "server_version", "9.2.4 openGauss");
        put_parameter_status(&mut out, "client_encoding", "UTF8");
        put_parameter_status(&mut out, "integer_datetimes", "on");
        put_backend_key_data(&mut out, self.pid, 42);
        put_ready_for_query(&mut out, b'I');
        self.socket.write_all(&out).await?;

        let result = self.serve(cancel).await;
        self.cancels.lock().remove(&self.pid);
        result
    }

    async fn authenticate(&mut self) -> std::io::Result<bool> {
        match self.config.auth.clone() {
            AuthMode::Trust => Ok(true),
            AuthMode::Md5 {
                salt,
                user,
                password,
            } => {
                let mut out = BytesMut::new();
                out.put_u8(b'R');
                out.put_i32(12);
                out.put_i32(5);
                out.put_slice(&salt);
                self.socket.write_all(&out).await?;

                let (tag, mut body) = self.read_frame().await?;
                if tag != b'p' {
                    self.fail_auth("expected a password message").await?;
                    return Ok(false);
                }
                // nul-terminated "md5<hex>"
                body.truncate(body.len().saturating_sub(1));
                let received = String::from_utf8_lossy(&body).into_owned();
                let expected = md5_password(&user, &password, &salt);
                if received != expected {
                    self.fail_auth(&format!(
                        "password authentication failed for user \"{user}\""
                    ))
                    .await?;
                    return Ok(false);
                }
                Ok(true)
            }
            AuthMode::RejectPassword => {
                let mut out = BytesMut::new();
                out.put_u8(b'R');
                out.put_i32(8);
                out.put_i32(3);
                self.socket.write_all(&out).await?;
                let (_tag, _body) = self.read_frame().await?;
                self.fail_auth("password authentication failed for user \"mock\"")
                    .await?;
                Ok(false)
            }
        }
    }

    async fn fail_auth(&mut self, message: &str) -> std::io::Result<()> {
        let mut out = BytesMut::new();
        put_error(&mut out, "FATAL", "28P01", message);
        self.socket.write_all(&out).await
    }

    async fn serve(&mut self, cancel: Arc<Notify>) -> std::io::Result<()> {
        let mut pending: Vec<Frontend> = Vec::new();
        loop {
            let (tag, mut body) = self.read_frame().await?;
            match tag {
                b'Q' => {
                    body.truncate(body.len().saturating_sub(1));
                    let sql = String::from_utf8_lossy(&body).into_owned();
                    self.state.lock().queries.push(sql.clone());
                    let mut out = BytesMut::new();
                    self.respond_query(&sql, &cancel, &mut out).await?;
                    put_ready_for_query(&mut out, b'I');
                    self.socket.write_all(&out).await?;
                }
                b'P' => {
                    let name = read_cstring(&mut body);
                    let sql = read_cstring(&mut body);
                    self.state.lock().parses.push((name.clone(), sql.clone()));
                    self.statements.insert(name, sql.clone());
                    pending.push(Frontend::Parse { sql });
                }
                b'B' => {
                    let _portal = read_cstring(&mut body);
                    let statement = read_cstring(&mut body);
                    pending.push(Frontend::Bind { statement });
                }
                b'D' => pending.push(Frontend::Describe),
                b'E' => pending.push(Frontend::Execute),
                b'C' => {
                    let _kind = body.get_u8();
                    let name = read_cstring(&mut body);
                    self.state.lock().closes.push(name.clone());
                    pending.push(Frontend::Close { name });
                }
                b'S' => {
                    pending.push(Frontend::Sync);
                    self.run_pipeline(&mut pending, &cancel).await?;
                }
                b'X' => return Ok(()),
                _ => {
                    // Copy and friends are not scripted here.
                    let _ = body;
                }
            }
        }
    }

    /// Replay the queued extended-protocol messages at Sync, honoring the
    /// error-skips-to-sync rule.
    async fn run_pipeline(
        &mut self,
        pending: &mut Vec<Frontend>,
        cancel: &Arc<Notify>,
    ) -> std::io::Result<()> {
        let mut out = BytesMut::new();
        let mut failed = false;
        // The statement the following Bind/Execute refer to.
        let mut current_sql = String::new();

        for message in pending.drain(..) {
            if failed && !matches!(message, Frontend::Sync) {
                continue;
            }
            match message {
                Frontend::Parse { sql } => {
                    if sql == "BOOM" {
                        put_error(&mut out, "ERROR", "42601", "syntax error at or near \"BOOM\"");
                        failed = true;
                    } else {
                        out.put_u8(b'1');
                        out.put_i32(4);
                        current_sql = sql;
                    }
                }
                Frontend::Bind { statement } => {
                    if let Some(sql) = self.statements.get(&statement) {
                        current_sql = sql.clone();
                    }
                    out.put_u8(b'2');
                    out.put_i32(4);
                }
                Frontend::Describe => {
                    if select_value(&current_sql).is_some() {
                        put_row_description(&mut out, "?column?");
                    } else {
                        out.put_u8(b'n');
                        out.put_i32(4);
                    }
                }
                Frontend::Execute => {
                    self.socket.write_all(&out).await?;
                    out.clear();
                    if !self.respond_execute(&current_sql, cancel, &mut out).await? {
                        failed = true;
                    }
                }
                Frontend::Close { .. } => {
                    out.put_u8(b'3');
                    out.put_i32(4);
                }
                Frontend::Sync => {
                    put_ready_for_query(&mut out, b'I');
                }
            }
        }
        self.socket.write_all(&out).await?;
        Ok(())
    }

    /// Simple-protocol response for one statement (description + rows + tag).
    async fn respond_query(
        &mut self,
        sql: &str,
        cancel: &Arc<Notify>,
        out: &mut BytesMut,
    ) -> std::io::Result<()> {
        if let Some(value) = select_value(sql) {
            put_row_description(out, "?column?");
            put_data_row(out, &value);
            put_command_complete(out, "SELECT 1");
            return Ok(());
        }
        match sql {
            "SHOW transaction_read_only" => {
                put_row_description(out, "transaction_read_only");
                put_data_row(out, if self.config.read_only { "on" } else { "off" });
                put_command_complete(out, "SHOW");
            }
            "DISCARD ALL" => put_command_complete(out, "DISCARD ALL"),
            "ROLLBACK" => put_command_complete(out, "ROLLBACK"),
            "BOOM" => put_error(out, "ERROR", "42601", "syntax error at or near \"BOOM\""),
            "NOTICE" => {
                put_notice(out, "NOTICE", "01000", "you asked for a notice");
                put_command_complete(out, "SELECT 0");
            }
            "DIE" => {
                // Vanish mid-command.
                self.socket.shutdown().await?;
                return Err(std::io::Error::other("scripted death"));
            }
            sql if sql.starts_with("SLEEP ") => {
                let ms: u64 = sql["SLEEP ".len()..].parse().unwrap_or(0);
                let slept = tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => true,
                    _ = cancel.notified() => false,
                };
                if slept {
                    put_command_complete(out, "SELECT 1");
                } else {
                    put_error(
                        out,
                        "ERROR",
                        "57014",
                        "canceling statement due to user request",
                    );
                }
            }
            _ => put_command_complete(out, "OK"),
        }
        Ok(())
    }

    /// Extended-protocol Execute. Returns false when the statement failed.
    async fn respond_execute(
        &mut self,
        sql: &str,
        cancel: &Arc<Notify>,
        out: &mut BytesMut,
    ) -> std::io::Result<bool> {
        if let Some(value) = select_value(sql) {
            put_data_row(out, &value);
            put_command_complete(out, "SELECT 1");
            return Ok(true);
        }
        if let Some(ms) = sql.strip_prefix("SLEEP ") {
            let ms: u64 = ms.parse().unwrap_or(0);
            let slept = tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => true,
                _ = cancel.notified() => false,
            };
            if slept {
                put_command_complete(out, "SELECT 1");
            } else {
                put_error(
                    out,
                    "ERROR",
                    "57014",
                    "canceling statement due to user request",
                );
                return Ok(false);
            }
            return Ok(true);
        }
        put_command_complete(out, "OK");
        Ok(true)
    }

    async fn read_frame(&mut self) -> std::io::Result<(u8, BytesMut)> {
        let tag = self.socket.read_u8().await?;
        let len = self.socket.read_i32().await?;
        let mut body = vec![0u8; len as usize - 4];
        self.socket.read_exact(&mut body).await?;
        Ok((tag, BytesMut::from(&body[..])))
    }
}

/// `SELECT <n>` echoes n back; anything else is not a select.
fn select_value(sql: &str) -> Option<String> {
    let rest = sql.strip_prefix("SELECT ")?;
    rest.chars()
        .all(|c| c.is_ascii_digit())
        .then(|| rest.to_string())
}

fn read_cstring(body: &mut BytesMut) -> String {
    let nul = body.iter().position(|b| *b == 0).unwrap();
    let bytes = body.split_to(nul);
    body.advance(1);
    String::from_utf8_lossy(&bytes).into_owned()
}

fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::{Digest, Md5};
    let inner = format!("{:x}", Md5::digest(format!("{password}{user}")));
    let mut md5 = Md5::new();
    md5.update(inner.as_bytes());
    md5.update(salt);
    format!("md5{:x}", md5.finalize())
}

fn put_auth_ok(out: &mut BytesMut) {
    out.put_u8(b'R');
    out.put_i32(8);
    out.put_i32(0);
}

fn put_parameter_status(out: &mut BytesMut, key: &str, value: &str) {
    out.put_u8(b'S');
    out.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
    out.put_slice(key.as_bytes());
    out.put_u8(0);
    out.put_slice(value.as_bytes());
    out.put_u8(0);
}

fn put_backend_key_data(out: &mut BytesMut, pid: i32, secret: i32) {
    out.put_u8(b'K');
    out.put_i32(12);
    out.put_i32(pid);
    out.put_i32(secret);
}

fn put_ready_for_query(out: &mut BytesMut, status: u8) {
    out.put_u8(b'Z');
    out.put_i32(5);
    out.put_u8(status);
}

fn put_row_description(out: &mut BytesMut, column: &str) {
    let mut body = BytesMut::new();
    body.put_i16(1);
    body.put_slice(column.as_bytes());
    body.put_u8(0);
    body.put_i32(0);
    body.put_i16(0);
    body.put_i32(25); // text
    body.put_i16(-1);
    body.put_i32(-1);
    body.put_i16(0);

    out.put_u8(b'T');
    out.put_i32(body.len() as i32 + 4);
    out.put(body);
}

fn put_data_row(out: &mut BytesMut, value: &str) {
    out.put_u8(b'D');
    out.put_i32(4 + 2 + 4 + value.len() as i32);
    out.put_i16(1);
    out.put_i32(value.len() as i32);
    out.put_slice(value.as_bytes());
}

fn put_command_complete(out: &mut BytesMut, tag: &str) {
    out.put_u8(b'C');
    out.put_i32(4 + tag.len() as i32 + 1);
    out.put_slice(tag.as_bytes());
    out.put_u8(0);
}

fn put_error_fields(out: &mut BytesMut, tag: u8, severity: &str, code: &str, message: &str) {
    let mut body = BytesMut::new();
    body.put_u8(b'S');
    body.put_slice(severity.as_bytes());
    body.put_u8(0);
    body.put_u8(b'V');
    body.put_slice(severity.as_bytes());
    body.put_u8(0);
    body.put_u8(b'C');
    body.put_slice(code.as_bytes());
    body.put_u8(0);
    body.put_u8(b'M');
    body.put_slice(message.as_bytes());
    body.put_u8(0);
    body.put_u8(0);

    out.put_u8(tag);
    out.put_i32(body.len() as i32 + 4);
    out.put(body);
}

fn put_error(out: &mut BytesMut, severity: &str, code: &str, message: &str) {
    put_error_fields(out, b'E', severity, code, message);
}

fn put_notice(out: &mut BytesMut, severity: &str, code: &str, message: &str) {
    put_error_fields(out, b'N', severity, code, message);
}
