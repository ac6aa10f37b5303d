use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::auth::Authenticator;
use crate::cancel::CancelRegistry;
use crate::config::Config;
use crate::query::{Execer, Queryer};
use crate::session;

/// A postgres-protocol server around an application-supplied execution
/// backend. Query execution is delegated to the Queryer; SQL commands are
/// enabled by attaching an Execer. Each accepted connection is served by
/// `serve`, one session per call.
pub struct Server {
    queryer: Arc<dyn Queryer>,
    execer: Option<Arc<dyn Execer>>,
    auth: Authenticator,
    registry: CancelRegistry,
    idle_timeout: Option<Duration>,
}

impl Server {
    /// A read-only server with trust authentication.
    pub fn new(queryer: Arc<dyn Queryer>) -> Self {
        Server {
            queryer,
            execer: None,
            auth: Authenticator::trust(),
            registry: CancelRegistry::new(),
            idle_timeout: None,
        }
    }

    /// Enables execution of SQL write commands.
    pub fn with_execer(mut self, execer: Arc<dyn Execer>) -> Self {
        self.execer = Some(execer);
        self
    }

    pub fn with_auth(mut self, auth: Authenticator) -> Self {
        self.auth = auth;
        self
    }

    /// Closes sessions that stay idle longer than the limit.
    pub fn with_idle_timeout(mut self, limit: Duration) -> Self {
        self.idle_timeout = Some(limit);
        self
    }

    pub(crate) fn queryer(&self) -> &dyn Queryer {
        self.queryer.as_ref()
    }

    pub(crate) fn execer(&self) -> Option<&dyn Execer> {
        self.execer.as_deref()
    }

    pub(crate) fn auth(&self) -> &Authenticator {
        &self.auth
    }

    pub(crate) fn registry(&self) -> &CancelRegistry {
        &self.registry
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Serves one client connection to completion. Blocks until the client
    /// terminates, the connection drops, or a fatal error ends the session.
    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        session::run(self, stream).await
    }
}

/// Accept loop: binds the configured listener, serves the metrics
/// endpoint, and fans every accepted connection out to its own task,
/// bounded by the configured connection limit.
pub async fn run(config: Config, server: Server) -> Result<()> {
    let metrics_handle = PrometheusBuilder::new().install_recorder()?;
    let metrics_addr: std::net::SocketAddr = config
        .metrics
        .listen_addr
        .parse()
        .unwrap_or(([127, 0, 0, 1], 9898).into());
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route(
                "/metrics",
                axum::routing::get(|| async move { metrics_handle.render() }),
            )
            .route("/health", axum::routing::get(|| async { "ok" }));
        if let Ok(listener) = tokio::net::TcpListener::bind(metrics_addr).await {
            let _ = axum::serve(listener, app).await;
        }
    });

    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    info!("pggate listening on {}", config.server.listen_addr);

    let server = match config.server.idle_timeout_secs {
        Some(secs) => server.with_idle_timeout(Duration::from_secs(secs)),
        None => server,
    };
    let server = Arc::new(server);
    let connection_limit = Arc::new(Semaphore::new(config.server.max_connections));

    loop {
        let (socket, _) = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            result = listener.accept() => result?,
        };
        let permit = match connection_limit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let server = server.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = server.serve(socket).await {
                error!("session error: {err}");
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ConstantPasswordProvider;
    use crate::errors::PgError;
    use crate::query::{ExecResult, QueryContext, Rows};
    use async_trait::async_trait;
    use sqlparser::ast::Statement;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    struct TestRows {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
        next: usize,
    }

    #[async_trait]
    impl Rows for TestRows {
        fn columns(&self) -> Vec<String> {
            self.columns.clone()
        }

        async fn next(&mut self) -> Result<Option<Vec<String>>, PgError> {
            let row = self.rows.get(self.next).cloned();
            self.next += 1;
            Ok(row)
        }
    }

    /// Answers SELECT 1-style queries with one row; a query mentioning
    /// pg_sleep blocks until the session is cancelled.
    struct TestBackend;

    #[async_trait]
    impl crate::query::Queryer for TestBackend {
        async fn query(
            &self,
            ctx: &QueryContext,
            _stmt: &Statement,
        ) -> Result<Box<dyn Rows>, PgError> {
            if ctx.sql.contains("pg_sleep") {
                ctx.cancel.cancelled().await;
                return Err(PgError::new(
                    "57014",
                    "canceling statement due to user request",
                ));
            }
            Ok(Box::new(TestRows {
                columns: vec!["?column?".to_string()],
                rows: vec![vec!["1".to_string()]],
                next: 0,
            }))
        }
    }

    #[async_trait]
    impl crate::query::Execer for TestBackend {
        async fn exec(
            &self,
            _ctx: &QueryContext,
            _stmt: &Statement,
        ) -> Result<ExecResult, PgError> {
            Ok(ExecResult::new(1))
        }
    }

    fn test_server() -> Server {
        Server::new(Arc::new(TestBackend)).with_execer(Arc::new(TestBackend))
    }

    async fn send_startup(client: &mut (impl AsyncWrite + Unpin), params: &[u8]) {
        let mut frame = Vec::new();
        frame.extend_from_slice(&((params.len() + 8) as i32).to_be_bytes());
        frame.extend_from_slice(&196608i32.to_be_bytes());
        frame.extend_from_slice(params);
        client.write_all(&frame).await.expect("startup");
    }

    async fn send_frontend_msg(
        client: &mut (impl AsyncWrite + Unpin),
        msg_type: u8,
        payload: &[u8],
    ) {
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(msg_type);
        frame.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(payload);
        client.write_all(&frame).await.expect("frontend msg");
    }

    async fn send_query(client: &mut (impl AsyncWrite + Unpin), sql: &str) {
        let mut payload = Vec::new();
        payload.extend_from_slice(sql.as_bytes());
        payload.push(0);
        send_frontend_msg(client, b'Q', &payload).await;
    }

    async fn read_backend(client: &mut (impl AsyncRead + Unpin)) -> (u8, Vec<u8>) {
        let mut tag = [0u8; 1];
        client.read_exact(&mut tag).await.expect("tag");
        let mut len_bytes = [0u8; 4];
        client.read_exact(&mut len_bytes).await.expect("len");
        let len = i32::from_be_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len - 4];
        if !payload.is_empty() {
            client.read_exact(&mut payload).await.expect("payload");
        }
        (tag[0], payload)
    }

    /// Reads backend messages up to and including ReadyForQuery.
    async fn read_until_ready(client: &mut (impl AsyncRead + Unpin)) -> Vec<(u8, Vec<u8>)> {
        let mut messages = Vec::new();
        loop {
            let (tag, payload) = read_backend(client).await;
            let done = tag == b'Z';
            messages.push((tag, payload));
            if done {
                return messages;
            }
        }
    }

    fn error_field(payload: &[u8], wanted: u8) -> Option<String> {
        let mut cur = payload;
        while let Some((&code, rest)) = cur.split_first() {
            if code == 0 {
                return None;
            }
            let end = rest.iter().position(|&b| b == 0)?;
            if code == wanted {
                return Some(String::from_utf8_lossy(&rest[..end]).to_string());
            }
            cur = &rest[end + 1..];
        }
        None
    }

    fn command_tag_of(payload: &[u8]) -> String {
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        String::from_utf8_lossy(&payload[..end]).to_string()
    }

    /// Performs the startup exchange under trust auth and returns the
    /// session's (pid, secret) from BackendKeyData. Leaves the stream
    /// positioned after the first ReadyForQuery.
    async fn handshake(client: &mut (impl AsyncRead + AsyncWrite + Unpin)) -> (i32, i32) {
        send_startup(client, b"user\0postgres\0\0").await;

        let (tag, payload) = read_backend(client).await;
        assert_eq!(tag, b'R');
        assert_eq!(payload, vec![0, 0, 0, 0]);

        let (tag, payload) = read_backend(client).await;
        assert_eq!(tag, b'S');
        assert_eq!(payload, b"client_encoding\0utf8\0");

        let (tag, payload) = read_backend(client).await;
        assert_eq!(tag, b'K');
        let pid = i32::from_be_bytes(payload[0..4].try_into().unwrap());
        let secret = i32::from_be_bytes(payload[4..8].try_into().unwrap());

        let (tag, payload) = read_backend(client).await;
        assert_eq!(tag, b'Z');
        assert_eq!(payload, vec![b'I']);

        (pid, secret)
    }

    #[tokio::test]
    async fn startup_happy_path_with_trust_auth() {
        let server = test_server();
        let (mut client, stream) = tokio::io::duplex(8192);
        let task = tokio::spawn(async move { server.serve(stream).await });

        let (pid, secret) = handshake(&mut client).await;
        assert!(pid > 0);
        assert_ne!(secret, 0);

        send_frontend_msg(&mut client, b'X', &[]).await;
        task.await.expect("join").expect("serve");
    }

    #[tokio::test]
    async fn startup_requires_user_argument() {
        let server = test_server();
        let (mut client, stream) = tokio::io::duplex(8192);
        let task = tokio::spawn(async move { server.serve(stream).await });

        send_startup(&mut client, b"database\0db1\0\0").await;
        let (tag, payload) = read_backend(&mut client).await;
        assert_eq!(tag, b'E');
        assert_eq!(error_field(&payload, b'S').as_deref(), Some("FATAL"));
        task.await.expect("join").expect("serve");

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.expect("eof"), 0);
    }

    #[tokio::test]
    async fn rejects_unsupported_protocol_version() {
        let server = test_server();
        let (mut client, stream) = tokio::io::duplex(8192);
        let task = tokio::spawn(async move { server.serve(stream).await });

        let mut frame = Vec::new();
        frame.extend_from_slice(&8i32.to_be_bytes());
        frame.extend_from_slice(&[0, 2, 0, 0]); // 2.0
        client.write_all(&frame).await.expect("write");

        assert!(task.await.expect("join").is_err());
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.expect("eof"), 0);
    }

    #[tokio::test]
    async fn simple_query_returns_one_row() {
        let server = test_server();
        let (mut client, stream) = tokio::io::duplex(8192);
        tokio::spawn(async move { server.serve(stream).await });
        handshake(&mut client).await;

        send_query(&mut client, "SELECT 1").await;
        let messages = read_until_ready(&mut client).await;
        let tags: Vec<u8> = messages.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![b'T', b'D', b'C', b'Z']);

        let (_, description) = &messages[0];
        assert_eq!(i16::from_be_bytes(description[0..2].try_into().unwrap()), 1);
        let name_end = description[2..].iter().position(|&b| b == 0).unwrap();
        assert_eq!(&description[2..2 + name_end], b"?column?");
        let oid_at = 2 + name_end + 1 + 4 + 2;
        assert_eq!(
            i32::from_be_bytes(description[oid_at..oid_at + 4].try_into().unwrap()),
            25
        );

        let (_, row) = &messages[1];
        assert_eq!(i16::from_be_bytes(row[0..2].try_into().unwrap()), 1);
        assert_eq!(i32::from_be_bytes(row[2..6].try_into().unwrap()), 1);
        assert_eq!(&row[6..7], b"1");

        assert_eq!(command_tag_of(&messages[2].1), "SELECT 1");
    }

    #[tokio::test]
    async fn simple_command_reports_tag() {
        let server = test_server();
        let (mut client, stream) = tokio::io::duplex(8192);
        tokio::spawn(async move { server.serve(stream).await });
        handshake(&mut client).await;

        send_query(&mut client, "INSERT INTO t VALUES (1)").await;
        let messages = read_until_ready(&mut client).await;
        let tags: Vec<u8> = messages.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![b'C', b'Z']);
        assert_eq!(command_tag_of(&messages[0].1), "INSERT 0 1");
    }

    #[tokio::test]
    async fn unsupported_message_type_keeps_session_alive() {
        let server = test_server();
        let (mut client, stream) = tokio::io::duplex(8192);
        tokio::spawn(async move { server.serve(stream).await });
        handshake(&mut client).await;

        send_frontend_msg(&mut client, b'F', &[]).await;
        let messages = read_until_ready(&mut client).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].0, b'E');
        assert_eq!(error_field(&messages[0].1, b'C').as_deref(), Some("0A000"));

        send_query(&mut client, "SELECT 1").await;
        let messages = read_until_ready(&mut client).await;
        assert_eq!(messages.last().unwrap().0, b'Z');
    }

    #[tokio::test]
    async fn extended_query_parse_error_rolls_back() {
        let server = test_server();
        let (mut client, stream) = tokio::io::duplex(8192);
        tokio::spawn(async move { server.serve(stream).await });
        handshake(&mut client).await;

        let mut parse = Vec::new();
        parse.extend_from_slice(b"\0invalid garbage\0");
        parse.extend_from_slice(&0i16.to_be_bytes());
        send_frontend_msg(&mut client, b'P', &parse).await;
        send_frontend_msg(&mut client, b'S', &[]).await;

        let messages = read_until_ready(&mut client).await;
        let tags: Vec<u8> = messages.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![b'E', b'Z']);
        assert_eq!(error_field(&messages[0].1, b'C').as_deref(), Some("42601"));

        // the failed transaction left nothing behind: binding the unnamed
        // statement now fails with invalid_sql_statement_name
        let mut bind = Vec::new();
        bind.extend_from_slice(b"\0\0");
        bind.extend_from_slice(&0i16.to_be_bytes());
        bind.extend_from_slice(&0i16.to_be_bytes());
        bind.extend_from_slice(&0i16.to_be_bytes());
        send_frontend_msg(&mut client, b'B', &bind).await;
        send_frontend_msg(&mut client, b'S', &[]).await;

        let messages = read_until_ready(&mut client).await;
        let tags: Vec<u8> = messages.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![b'E', b'Z']);
        assert_eq!(error_field(&messages[0].1, b'C').as_deref(), Some("26000"));
    }

    #[tokio::test]
    async fn extended_query_happy_path() {
        let server = test_server();
        let (mut client, stream) = tokio::io::duplex(8192);
        tokio::spawn(async move { server.serve(stream).await });
        handshake(&mut client).await;

        let mut parse = Vec::new();
        parse.extend_from_slice(b"s1\0SELECT 1\0");
        parse.extend_from_slice(&0i16.to_be_bytes());
        send_frontend_msg(&mut client, b'P', &parse).await;

        let mut bind = Vec::new();
        bind.extend_from_slice(b"\0s1\0");
        bind.extend_from_slice(&0i16.to_be_bytes());
        bind.extend_from_slice(&0i16.to_be_bytes());
        bind.extend_from_slice(&0i16.to_be_bytes());
        send_frontend_msg(&mut client, b'B', &bind).await;

        let mut describe = Vec::new();
        describe.push(b'S');
        describe.extend_from_slice(b"s1\0");
        send_frontend_msg(&mut client, b'D', &describe).await;

        let mut execute = Vec::new();
        execute.extend_from_slice(b"\0");
        execute.extend_from_slice(&0i32.to_be_bytes());
        send_frontend_msg(&mut client, b'E', &execute).await;
        send_frontend_msg(&mut client, b'S', &[]).await;

        let messages = read_until_ready(&mut client).await;
        let tags: Vec<u8> = messages.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![b'1', b'2', b't', b'T', b'D', b'C', b'Z']);
        // ParameterDescription and the stub RowDescription carry no entries
        assert_eq!(messages[2].1, vec![0, 0]);
        assert_eq!(messages[3].1, vec![0, 0]);
        assert_eq!(command_tag_of(&messages[5].1), "SELECT 1");

        // the committed transaction promoted s1 into the live statements
        let mut bind = Vec::new();
        bind.extend_from_slice(b"\0s1\0");
        bind.extend_from_slice(&0i16.to_be_bytes());
        bind.extend_from_slice(&0i16.to_be_bytes());
        bind.extend_from_slice(&0i16.to_be_bytes());
        send_frontend_msg(&mut client, b'B', &bind).await;
        let mut execute = Vec::new();
        execute.extend_from_slice(b"\0");
        execute.extend_from_slice(&0i32.to_be_bytes());
        send_frontend_msg(&mut client, b'E', &execute).await;
        send_frontend_msg(&mut client, b'S', &[]).await;

        let messages = read_until_ready(&mut client).await;
        let tags: Vec<u8> = messages.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![b'2', b'D', b'C', b'Z']);
    }

    #[tokio::test]
    async fn execute_respects_max_rows_and_suspends() {
        struct ThreeRows;

        #[async_trait]
        impl crate::query::Queryer for ThreeRows {
            async fn query(
                &self,
                _ctx: &QueryContext,
                _stmt: &Statement,
            ) -> Result<Box<dyn Rows>, PgError> {
                Ok(Box::new(TestRows {
                    columns: vec!["n".to_string()],
                    rows: (1..=3).map(|i| vec![i.to_string()]).collect(),
                    next: 0,
                }))
            }
        }

        let server = Server::new(Arc::new(ThreeRows));
        let (mut client, stream) = tokio::io::duplex(8192);
        tokio::spawn(async move { server.serve(stream).await });
        handshake(&mut client).await;

        let mut parse = Vec::new();
        parse.extend_from_slice(b"\0SELECT n FROM t\0");
        parse.extend_from_slice(&0i16.to_be_bytes());
        send_frontend_msg(&mut client, b'P', &parse).await;

        let mut bind = Vec::new();
        bind.extend_from_slice(b"\0\0");
        bind.extend_from_slice(&0i16.to_be_bytes());
        bind.extend_from_slice(&0i16.to_be_bytes());
        bind.extend_from_slice(&0i16.to_be_bytes());
        send_frontend_msg(&mut client, b'B', &bind).await;

        let mut execute = Vec::new();
        execute.extend_from_slice(b"\0");
        execute.extend_from_slice(&2i32.to_be_bytes());
        send_frontend_msg(&mut client, b'E', &execute).await;
        // the portal survives the suspension inside the same transaction
        send_frontend_msg(&mut client, b'E', &execute).await;
        send_frontend_msg(&mut client, b'S', &[]).await;

        let messages = read_until_ready(&mut client).await;
        let tags: Vec<u8> = messages.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![b'1', b'2', b'D', b'D', b's', b'D', b'C', b'Z']);
        assert_eq!(command_tag_of(&messages[6].1), "SELECT 3");
    }

    #[tokio::test]
    async fn md5_auth_failure_is_fatal() {
        let server = test_server().with_auth(Authenticator::md5(Arc::new(
            ConstantPasswordProvider::new(&b"test"[..]),
        )));
        let (mut client, stream) = tokio::io::duplex(8192);
        let task = tokio::spawn(async move { server.serve(stream).await });

        send_startup(&mut client, b"user\0postgres\0\0").await;
        let (tag, payload) = read_backend(&mut client).await;
        assert_eq!(tag, b'R');
        assert_eq!(&payload[..4], &[0, 0, 0, 5]);
        assert_eq!(payload.len(), 8); // auth type + 4-byte salt

        let mut password = Vec::new();
        password.extend_from_slice(b"md5aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        password.push(0);
        send_frontend_msg(&mut client, b'p', &password).await;

        let (tag, payload) = read_backend(&mut client).await;
        assert_eq!(tag, b'E');
        assert_eq!(error_field(&payload, b'S').as_deref(), Some("FATAL"));
        assert_eq!(error_field(&payload, b'C').as_deref(), Some("28P01"));
        assert_eq!(
            error_field(&payload, b'M').as_deref(),
            Some("Password does not match for user \"postgres\"")
        );

        task.await.expect("join").expect("serve");
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.expect("eof"), 0);
    }

    #[tokio::test]
    async fn cancel_request_trips_target_session() {
        let server = Arc::new(test_server());

        let (mut client_a, stream_a) = tokio::io::duplex(8192);
        let server_a = server.clone();
        tokio::spawn(async move { server_a.serve(stream_a).await });
        let (pid, secret) = handshake(&mut client_a).await;

        send_query(&mut client_a, "SELECT pg_sleep(10)").await;

        // a stranger connection delivers the cancel key
        let (mut canceller, cancel_stream) = tokio::io::duplex(512);
        let server_c = server.clone();
        let cancel_task = tokio::spawn(async move { server_c.serve(cancel_stream).await });
        let mut frame = Vec::new();
        frame.extend_from_slice(&16i32.to_be_bytes());
        frame.extend_from_slice(&[0x04, 0xd2, 0x16, 0x2e]);
        frame.extend_from_slice(&pid.to_be_bytes());
        frame.extend_from_slice(&secret.to_be_bytes());
        canceller.write_all(&frame).await.expect("cancel");

        // the canceller gets no reply, just a disconnect
        cancel_task.await.expect("join").expect("serve");
        let mut buf = [0u8; 1];
        assert_eq!(canceller.read(&mut buf).await.expect("eof"), 0);

        // the in-flight query surfaces the cancellation as a normal error
        let messages = read_until_ready(&mut client_a).await;
        let tags: Vec<u8> = messages.iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![b'E', b'Z']);
        assert_eq!(error_field(&messages[0].1, b'C').as_deref(), Some("57014"));
    }

    #[tokio::test]
    async fn cancel_with_wrong_secret_is_ignored() {
        let server = Arc::new(test_server());

        let (mut client_a, stream_a) = tokio::io::duplex(8192);
        let server_a = server.clone();
        tokio::spawn(async move { server_a.serve(stream_a).await });
        let (pid, secret) = handshake(&mut client_a).await;

        let (mut canceller, cancel_stream) = tokio::io::duplex(512);
        let server_c = server.clone();
        let cancel_task = tokio::spawn(async move { server_c.serve(cancel_stream).await });
        let mut frame = Vec::new();
        frame.extend_from_slice(&16i32.to_be_bytes());
        frame.extend_from_slice(&[0x04, 0xd2, 0x16, 0x2e]);
        frame.extend_from_slice(&pid.to_be_bytes());
        frame.extend_from_slice(&secret.wrapping_add(1).to_be_bytes());
        canceller.write_all(&frame).await.expect("cancel");
        cancel_task.await.expect("join").expect("serve");

        // the target session is still responsive
        send_query(&mut client_a, "SELECT 1").await;
        let messages = read_until_ready(&mut client_a).await;
        assert_eq!(messages.last().unwrap().0, b'Z');
    }
}
