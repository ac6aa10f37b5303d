use std::collections::HashMap;

use async_trait::async_trait;
use pggate_protocol::Message;
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::cancel::CancelToken;
use crate::errors::PgError;

/// Parses SQL text into statements with the PostgreSQL grammar. Parser
/// failures become client-visible syntax errors.
pub fn parse_sql(sql: &str) -> Result<Vec<Statement>, PgError> {
    let dialect = PostgreSqlDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|err| PgError::syntax(err.to_string()))
}

/// Per-call context handed to Queryer/Execer implementations: the raw SQL,
/// the parameter values bound to the executing portal (empty on the
/// simple-query path), the session's startup arguments, and the session's
/// cancellation token.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub sql: String,
    pub params: Vec<Option<Vec<u8>>>,
    pub args: HashMap<String, String>,
    pub cancel: CancelToken,
}

impl QueryContext {
    /// A startup argument of the session (user, database, ...).
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

/// A forward-only stream of result rows in text format.
#[async_trait]
pub trait Rows: Send {
    fn columns(&self) -> Vec<String>;

    /// Declared type names for the result columns; names outside the
    /// type-OID table are described as TEXT.
    fn column_type_names(&self) -> Vec<String> {
        self.columns().iter().map(|_| "TEXT".to_string()).collect()
    }

    async fn next(&mut self) -> Result<Option<Vec<String>>, PgError>;
}

/// Objects capable of performing sql queries. The returned Rows provides
/// the row data and column metadata.
#[async_trait]
pub trait Queryer: Send + Sync {
    async fn query(&self, ctx: &QueryContext, stmt: &Statement) -> Result<Box<dyn Rows>, PgError>;
}

/// Objects capable of executing sql write commands, like INSERT or CREATE
/// TABLE. The returned result carries the number of affected rows.
#[async_trait]
pub trait Execer: Send + Sync {
    async fn exec(&self, ctx: &QueryContext, stmt: &Statement) -> Result<ExecResult, PgError>;
}

/// Outcome of an Execer call. The optional tag overrides the default
/// CommandComplete tag derived from the statement kind.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    rows_affected: u64,
    tag: Option<String>,
}

impl ExecResult {
    pub fn new(rows_affected: u64) -> Self {
        ExecResult {
            rows_affected,
            tag: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

/// Whether the statement streams rows (Queryer) rather than reporting an
/// affected-row count (Execer). SHOW streams rows, matching PostgreSQL.
pub fn is_query_statement(stmt: &Statement) -> bool {
    matches!(stmt, Statement::Query(_) | Statement::ShowVariable { .. })
}

/// The CommandComplete tag for an executed command, following the
/// protocol's tag table. Kinds without a documented tag report UPDATE with
/// the affected-row count.
pub fn command_tag(stmt: &Statement, result: &ExecResult) -> String {
    if let Some(tag) = result.tag() {
        return tag.to_string();
    }
    let count = result.rows_affected();
    match stmt {
        Statement::SetVariable { .. } => "SET".to_string(),
        // oid in INSERT is not implemented; defaults to 0
        Statement::Insert { .. } => format!("INSERT 0 {}", count),
        Statement::CreateTable {
            query: Some(_), ..
        } => format!("SELECT {}", count),
        Statement::CreateTable { .. } => "CREATE TABLE".to_string(),
        Statement::Delete { .. } => format!("DELETE {}", count),
        Statement::Fetch { .. } => format!("FETCH {}", count),
        Statement::Copy { .. } => format!("COPY {}", count),
        Statement::Update { .. } => format!("UPDATE {}", count),
        Statement::CreateRole { .. } => "CREATE ROLE".to_string(),
        Statement::CreateView { .. } => "CREATE VIEW".to_string(),
        _ => format!("UPDATE {}", count),
    }
}

/// How a cursor fetch ended: the portal completed with a total row count,
/// or hit the row limit with more rows pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Complete(u64),
    Suspended,
}

/// A lazy result handle over a Rows stream. One cursor exists per
/// executing query portal; it is forward-only and not restartable.
pub struct Cursor {
    rows: Box<dyn Rows>,
    columns: Vec<String>,
    type_names: Vec<String>,
    count: u64,
    eof: bool,
}

impl Cursor {
    pub fn new(rows: Box<dyn Rows>) -> Self {
        let columns = rows.columns();
        let type_names = rows.column_type_names();
        Cursor {
            rows,
            columns,
            type_names,
            count: 0,
            eof: false,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn type_names(&self) -> &[String] {
        &self.type_names
    }

    /// Total rows produced by this cursor so far.
    pub fn row_count(&self) -> u64 {
        self.count
    }

    pub fn at_eof(&self) -> bool {
        self.eof
    }

    /// Fetches up to max_rows rows (0 = unlimited) as DataRow messages.
    /// Rows produced before an error are left in `out` so callers can
    /// still deliver them.
    pub async fn fetch(
        &mut self,
        max_rows: i32,
        out: &mut Vec<Message>,
    ) -> Result<FetchOutcome, PgError> {
        let limit = if max_rows > 0 {
            max_rows as u64
        } else {
            u64::MAX
        };
        let mut fetched = 0u64;
        while fetched < limit && !self.eof {
            match self.rows.next().await? {
                Some(row) => {
                    out.push(Message::data_row(&row));
                    fetched += 1;
                    self.count += 1;
                }
                None => self.eof = true,
            }
        }
        if self.eof {
            Ok(FetchOutcome::Complete(self.count))
        } else {
            Ok(FetchOutcome::Suspended)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecRows {
        rows: Vec<Vec<String>>,
        next: usize,
    }

    impl VecRows {
        fn new(rows: Vec<Vec<String>>) -> Self {
            VecRows { rows, next: 0 }
        }
    }

    #[async_trait]
    impl Rows for VecRows {
        fn columns(&self) -> Vec<String> {
            vec!["?column?".to_string()]
        }

        async fn next(&mut self) -> Result<Option<Vec<String>>, PgError> {
            let row = self.rows.get(self.next).cloned();
            self.next += 1;
            Ok(row)
        }
    }

    fn statement(sql: &str) -> Statement {
        parse_sql(sql).expect("parse").remove(0)
    }

    #[test]
    fn parse_sql_reports_syntax_errors() {
        let err = parse_sql("invalid garbage").expect_err("must fail");
        assert_eq!(err.code, "42601");
    }

    #[test]
    fn classifies_queries_and_commands() {
        assert!(is_query_statement(&statement("SELECT 1")));
        assert!(is_query_statement(&statement("SHOW search_path")));
        assert!(!is_query_statement(&statement("INSERT INTO t VALUES (1)")));
        assert!(!is_query_statement(&statement("CREATE TABLE t (id INT)")));
    }

    #[test]
    fn command_tags_follow_statement_kind() {
        let result = ExecResult::new(3);
        assert_eq!(
            command_tag(&statement("INSERT INTO t VALUES (1)"), &result),
            "INSERT 0 3"
        );
        assert_eq!(command_tag(&statement("DELETE FROM t"), &result), "DELETE 3");
        assert_eq!(
            command_tag(&statement("UPDATE t SET a = 1"), &result),
            "UPDATE 3"
        );
        assert_eq!(
            command_tag(&statement("CREATE TABLE t (id INT)"), &result),
            "CREATE TABLE"
        );
        assert_eq!(
            command_tag(&statement("CREATE TABLE t AS SELECT 1"), &result),
            "SELECT 3"
        );
        assert_eq!(
            command_tag(&statement("CREATE VIEW v AS SELECT 1"), &result),
            "CREATE VIEW"
        );
        assert_eq!(command_tag(&statement("SET a = 1"), &result), "SET");
        assert_eq!(
            command_tag(&statement("TRUNCATE TABLE t"), &result),
            "UPDATE 3"
        );
    }

    #[test]
    fn explicit_tag_overrides_default() {
        let result = ExecResult::new(1).with_tag("MERGE 1");
        assert_eq!(
            command_tag(&statement("INSERT INTO t VALUES (1)"), &result),
            "MERGE 1"
        );
    }

    #[tokio::test]
    async fn cursor_fetches_in_batches() {
        let rows: Vec<Vec<String>> = (1..=3).map(|i| vec![i.to_string()]).collect();
        let mut cursor = Cursor::new(Box::new(VecRows::new(rows)));
        assert_eq!(cursor.columns(), &["?column?".to_string()]);

        let mut out = Vec::new();
        let outcome = cursor.fetch(2, &mut out).await.expect("fetch");
        assert_eq!(outcome, FetchOutcome::Suspended);
        assert_eq!(out.len(), 2);
        assert_eq!(cursor.row_count(), 2);

        let mut out = Vec::new();
        let outcome = cursor.fetch(0, &mut out).await.expect("fetch");
        assert_eq!(outcome, FetchOutcome::Complete(3));
        assert_eq!(out.len(), 1);
        assert!(cursor.at_eof());
    }

    #[tokio::test]
    async fn cursor_limit_at_boundary_suspends_until_eof_is_seen() {
        let mut cursor = Cursor::new(Box::new(VecRows::new(vec![vec!["1".to_string()]])));
        let mut out = Vec::new();
        assert_eq!(
            cursor.fetch(1, &mut out).await.expect("fetch"),
            FetchOutcome::Suspended
        );
        let mut out = Vec::new();
        assert_eq!(
            cursor.fetch(1, &mut out).await.expect("fetch"),
            FetchOutcome::Complete(1)
        );
        assert!(out.is_empty());
    }
}
