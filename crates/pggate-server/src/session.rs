use std::collections::HashMap;

use anyhow::Result;
use metrics::counter;
use pggate_protocol::types::type_name;
use pggate_protocol::{DescribeTarget, FrontendMessage, Message, TransactionState, Transport};
use rand::Rng;
use sqlparser::ast::Statement;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, Instrument};

use crate::cancel::CancelToken;
use crate::errors::{PgError, Severity};
use crate::query::{self, command_tag, parse_sql, Cursor, FetchOutcome, QueryContext};
use crate::server::Server;

const UNNAMED: &str = "";

/// A parsed, possibly parameterized statement stored under a name. The
/// client-supplied parameter OIDs are preserved so ParameterDescription
/// round-trips exactly.
struct PreparedStatement {
    raw_sql: String,
    ast: Option<Statement>,
    param_oids: Vec<i32>,
}

/// An executable instance of a prepared statement with bound parameter
/// values. Scoped to the extended-query transaction.
struct Portal {
    statement_name: String,
    params: Vec<Option<Vec<u8>>>,
    cursor: Option<Cursor>,
}

struct Session<'a, S> {
    server: &'a Server,
    transport: Transport<S>,
    args: HashMap<String, String>,
    pid: i32,
    cancel: CancelToken,
    stmts: HashMap<String, PreparedStatement>,
    pending_stmts: HashMap<String, PreparedStatement>,
    portals: HashMap<String, Portal>,
    in_transaction: bool,
}

/// Drives one client connection from startup to termination.
pub(crate) async fn run<S>(server: &Server, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut transport = Transport::new(stream);
    let startup = transport.startup().await?;

    if startup.is_cancel() {
        let (pid, secret) = startup.cancel_key_data()?;
        debug!(pid, "cancel request");
        server.registry().cancel(pid, secret);
        // intentionally no reply, success or not; just disconnect
        return Ok(());
    }

    let args: HashMap<String, String> = startup.startup_args()?.into_iter().collect();
    let user = match args.get("user") {
        Some(user) => user.clone(),
        None => {
            let err = PgError::invalid("startup message: missing argument \"user\"")
                .with_severity(Severity::Fatal);
            transport.write_message(err.to_message()).await?;
            return Ok(());
        }
    };

    if !server.auth().authenticate(&mut transport, &user).await? {
        counter!("pggate_auth_failures_total").increment(1);
        info!(user = %user, "authentication failed");
        return Ok(());
    }

    transport
        .write_message(Message::parameter_status("client_encoding", "utf8"))
        .await?;

    let cancel = CancelToken::new();
    let secret: i32 = rand::thread_rng().gen_range(1..i32::MAX);
    let pid = server.registry().register(secret, cancel.clone());
    transport
        .write_message(Message::backend_key_data(pid, secret))
        .await?;

    counter!("pggate_connections_total").increment(1);
    info!(pid, user = %user, "session started");

    let mut session = Session {
        server,
        transport,
        args,
        pid,
        cancel,
        stmts: HashMap::new(),
        pending_stmts: HashMap::new(),
        portals: HashMap::new(),
        in_transaction: false,
    };
    let result = session.query_loop().await;
    server.registry().deregister(pid);
    info!(pid, "session closed");
    result
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin + Send> Session<'a, S> {
    async fn query_loop(&mut self) -> Result<()> {
        loop {
            let next = self.transport.next_frontend_message();
            let (msg, state) = match self.server.idle_timeout() {
                Some(limit) => match tokio::time::timeout(limit, next).await {
                    Ok(result) => result?,
                    Err(_) => {
                        let err = PgError::internal("terminating connection due to idle timeout")
                            .with_severity(Severity::Fatal);
                        self.transport.write_message(err.to_message()).await?;
                        return Ok(());
                    }
                },
                None => next.await?,
            };
            self.apply_transaction_state(state);
            match msg {
                FrontendMessage::Terminate => return Ok(()),
                FrontendMessage::Query { sql } => {
                    let span = tracing::debug_span!("query", pid = self.pid);
                    self.handle_query(&sql).instrument(span).await?;
                }
                FrontendMessage::Parse {
                    statement_name,
                    query,
                    param_oids,
                } => self.handle_parse(statement_name, query, param_oids).await?,
                FrontendMessage::Bind {
                    portal_name,
                    statement_name,
                    param_values,
                    ..
                } => {
                    self.handle_bind(portal_name, statement_name, param_values)
                        .await?
                }
                FrontendMessage::Describe { target, name } => {
                    self.handle_describe(target, name).await?
                }
                FrontendMessage::Execute {
                    portal_name,
                    max_rows,
                } => self.handle_execute(portal_name, max_rows).await?,
                // the transport observes Sync and commits the transaction
                FrontendMessage::Sync => {}
                FrontendMessage::Password { .. } => {
                    self.write_error(&PgError::unsupported(
                        "message type 'p' outside authentication",
                    ))
                    .await?;
                }
                FrontendMessage::Unsupported { tag } => {
                    self.write_error(&PgError::unsupported(format!(
                        "message type '{}'",
                        tag as char
                    )))
                    .await?;
                }
            }
        }
    }

    /// Promotes or discards pending prepared statements and portals at
    /// extended-query transaction boundaries.
    fn apply_transaction_state(&mut self, state: TransactionState) {
        match state {
            TransactionState::TransactionEnded => {
                let pending = std::mem::take(&mut self.pending_stmts);
                self.stmts.extend(pending);
                self.portals.clear();
                self.in_transaction = false;
            }
            TransactionState::TransactionFailed => {
                self.pending_stmts.clear();
                self.portals.clear();
                self.in_transaction = false;
            }
            TransactionState::InTransaction => self.in_transaction = true,
            TransactionState::NotInTransaction => self.in_transaction = false,
        }
    }

    async fn handle_query(&mut self, sql: &str) -> Result<()> {
        counter!("pggate_queries_total").increment(1);
        let statements = match parse_sql(sql) {
            Ok(statements) => statements,
            Err(err) => {
                self.write_error(&err).await?;
                self.stmts.remove(UNNAMED);
                return Ok(());
            }
        };
        for stmt in &statements {
            match self.run_statement(sql, stmt).await? {
                Ok(()) => {}
                Err(err) => {
                    self.write_error(&err).await?;
                    break;
                }
            }
        }
        // a simple query always clears the unnamed prepared statement
        self.stmts.remove(UNNAMED);
        Ok(())
    }

    /// Runs one statement of a simple query, streaming its result. The
    /// inner error is the client-visible failure of this statement; the
    /// outer error is a dead connection.
    async fn run_statement(&mut self, sql: &str, stmt: &Statement) -> Result<Result<(), PgError>> {
        if let Statement::Prepare {
            name, statement, ..
        } = stmt
        {
            self.stmts.insert(
                name.value.clone(),
                PreparedStatement {
                    raw_sql: sql.to_string(),
                    ast: Some((**statement).clone()),
                    param_oids: Vec::new(),
                },
            );
            return Ok(Ok(()));
        }

        let ctx = self.query_context(sql.to_string(), Vec::new());
        if query::is_query_statement(stmt) {
            let rows = match self.server.queryer().query(&ctx, stmt).await {
                Ok(rows) => rows,
                Err(err) => return Ok(Err(err)),
            };
            let mut cursor = Cursor::new(rows);
            let description = Message::row_description(cursor.columns(), cursor.type_names());
            self.transport.write_message(description).await?;

            let mut out = Vec::new();
            let fetched = cursor.fetch(0, &mut out).await;
            for msg in out {
                self.transport.write_message(msg).await?;
            }
            if let Err(err) = fetched {
                return Ok(Err(err));
            }
            let tag = format!("SELECT {}", cursor.row_count());
            self.transport
                .write_message(Message::command_complete(&tag))
                .await?;
        } else {
            let execer = match self.server.execer() {
                Some(execer) => execer,
                None => {
                    return Ok(Err(PgError::unsupported(
                        "commands execution. Read-only mode.",
                    )))
                }
            };
            let result = match execer.exec(&ctx, stmt).await {
                Ok(result) => result,
                Err(err) => return Ok(Err(err)),
            };
            let tag = command_tag(stmt, &result);
            self.transport
                .write_message(Message::command_complete(&tag))
                .await?;
        }
        Ok(Ok(()))
    }

    async fn handle_parse(
        &mut self,
        name: String,
        sql: String,
        param_oids: Vec<i32>,
    ) -> Result<()> {
        let statements = match parse_sql(&sql) {
            Ok(statements) => statements,
            Err(err) => return self.write_error(&err).await,
        };
        if statements.len() > 1 {
            return self
                .write_error(&PgError::syntax(
                    "cannot insert multiple commands into a prepared statement",
                ))
                .await;
        }
        for oid in &param_oids {
            if type_name(*oid).is_none() {
                return self
                    .write_error(&PgError::unrecognized(format!("parameter type OID {}", oid)))
                    .await;
            }
        }
        let statement = PreparedStatement {
            raw_sql: sql,
            ast: statements.into_iter().next(),
            param_oids,
        };
        self.store_prepared_statement(name, statement);
        self.transport.write_message(Message::parse_complete()).await
    }

    fn store_prepared_statement(&mut self, name: String, statement: PreparedStatement) {
        if self.in_transaction {
            self.pending_stmts.insert(name, statement);
        } else {
            self.stmts.insert(name, statement);
        }
    }

    fn lookup_statement(&self, name: &str) -> Option<&PreparedStatement> {
        self.pending_stmts.get(name).or_else(|| self.stmts.get(name))
    }

    async fn handle_bind(
        &mut self,
        portal_name: String,
        statement_name: String,
        param_values: Vec<Option<Vec<u8>>>,
    ) -> Result<()> {
        if self.lookup_statement(&statement_name).is_none() {
            return self
                .write_error(&PgError::new(
                    "26000",
                    format!("prepared statement \"{}\" does not exist", statement_name),
                ))
                .await;
        }
        self.portals.insert(
            portal_name,
            Portal {
                statement_name,
                params: param_values,
                cursor: None,
            },
        );
        self.transport.write_message(Message::bind_complete()).await
    }

    async fn handle_describe(&mut self, target: DescribeTarget, name: String) -> Result<()> {
        match target {
            DescribeTarget::Statement => {
                let param_oids = self.lookup_statement(&name).map(|s| s.param_oids.clone());
                match param_oids {
                    Some(param_oids) => {
                        self.transport
                            .write_message(Message::parameter_description(&param_oids))
                            .await?;
                        // column metadata would need catalog access; the
                        // statement is described as producing no columns
                        self.transport
                            .write_message(Message::row_description(&[], &[]))
                            .await?;
                    }
                    None => {
                        self.write_error(&PgError::new(
                            "26000",
                            format!("prepared statement \"{}\" does not exist", name),
                        ))
                        .await?;
                    }
                }
            }
            DescribeTarget::Portal => {
                self.transport
                    .write_message(Message::row_description(&[], &[]))
                    .await?;
            }
            DescribeTarget::Unknown(byte) => {
                self.write_error(&PgError::new(
                    "22023",
                    format!("unrecognized describe object type '{}'", byte as char),
                ))
                .await?;
            }
        }
        Ok(())
    }

    async fn handle_execute(&mut self, portal_name: String, max_rows: i32) -> Result<()> {
        let Some(mut portal) = self.portals.remove(&portal_name) else {
            return self
                .write_error(&PgError::new(
                    "34000",
                    format!("portal \"{}\" does not exist", portal_name),
                ))
                .await;
        };
        let mut out = Vec::new();
        let outcome = self.run_portal(&mut portal, max_rows, &mut out).await;
        self.portals.insert(portal_name, portal);
        for msg in out {
            self.transport.write_message(msg).await?;
        }
        if let Err(err) = outcome {
            self.write_error(&err).await?;
        }
        Ok(())
    }

    /// Executes a portal: the first Execute materializes a cursor (query)
    /// or runs the command; later Executes resume the cursor.
    async fn run_portal(
        &mut self,
        portal: &mut Portal,
        max_rows: i32,
        out: &mut Vec<Message>,
    ) -> Result<(), PgError> {
        if portal.cursor.is_none() {
            let (raw_sql, ast) = match self.lookup_statement(&portal.statement_name) {
                Some(statement) => (statement.raw_sql.clone(), statement.ast.clone()),
                None => {
                    return Err(PgError::new(
                        "26000",
                        format!(
                            "prepared statement \"{}\" does not exist",
                            portal.statement_name
                        ),
                    ))
                }
            };
            let Some(ast) = ast else {
                // empty statement: nothing to execute
                return Ok(());
            };
            if let Statement::Prepare {
                name, statement, ..
            } = &ast
            {
                let prepared = PreparedStatement {
                    raw_sql,
                    ast: Some((**statement).clone()),
                    param_oids: Vec::new(),
                };
                self.store_prepared_statement(name.value.clone(), prepared);
                return Ok(());
            }
            let ctx = self.query_context(raw_sql, portal.params.clone());
            if query::is_query_statement(&ast) {
                let rows = self.server.queryer().query(&ctx, &ast).await?;
                portal.cursor = Some(Cursor::new(rows));
            } else {
                let execer = self
                    .server
                    .execer()
                    .ok_or_else(|| PgError::unsupported("commands execution. Read-only mode."))?;
                let result = execer.exec(&ctx, &ast).await?;
                out.push(Message::command_complete(&command_tag(&ast, &result)));
                return Ok(());
            }
        }
        if let Some(cursor) = portal.cursor.as_mut() {
            match cursor.fetch(max_rows, out).await? {
                FetchOutcome::Complete(total) => {
                    out.push(Message::command_complete(&format!("SELECT {}", total)));
                }
                FetchOutcome::Suspended => out.push(Message::portal_suspended()),
            }
        }
        Ok(())
    }

    fn query_context(&self, sql: String, params: Vec<Option<Vec<u8>>>) -> QueryContext {
        QueryContext {
            sql,
            params,
            args: self.args.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Reports an error to the client. Fatal errors tear the connection
    /// down after the response is written.
    async fn write_error(&mut self, err: &PgError) -> Result<()> {
        counter!("pggate_query_errors_total").increment(1);
        debug!(pid = self.pid, code = err.code.as_str(), "{}", err);
        self.transport.write_message(err.to_message()).await?;
        if err.is_fatal() {
            anyhow::bail!("fatal error: {}", err);
        }
        Ok(())
    }
}
