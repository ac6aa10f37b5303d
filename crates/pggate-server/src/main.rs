use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use sqlparser::ast::{Expr, SelectItem, SetExpr, Statement, Value};
use tracing_subscriber::FmtSubscriber;

use pggate_server::{Authenticator, Config, PgError, QueryContext, Queryer, Rows, Server};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, default_value = "config.example.toml")]
        config: String,
    },
    CheckConfig {
        #[arg(long, default_value = "config.example.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => {
            let config = Config::from_path(&config)?;
            let auth = Authenticator::from_config(&config.auth);
            let server = Server::new(Arc::new(LiteralBackend)).with_auth(auth);
            pggate_server::run(config, server).await?;
        }
        Command::CheckConfig { config } => {
            Config::from_path(&config)?;
            println!("config ok: {}", config);
        }
    }
    Ok(())
}

/// Demo backend for the standalone binary: answers SELECTs over literal
/// projections, enough for `SELECT 1` or `SELECT 'a' AS x, 2`. Anything
/// needing real table access is refused.
struct LiteralBackend;

struct LiteralRows {
    columns: Vec<String>,
    row: Option<Vec<String>>,
}

#[async_trait]
impl Rows for LiteralRows {
    fn columns(&self) -> Vec<String> {
        self.columns.clone()
    }

    async fn next(&mut self) -> Result<Option<Vec<String>>, PgError> {
        Ok(self.row.take())
    }
}

#[async_trait]
impl Queryer for LiteralBackend {
    async fn query(&self, _ctx: &QueryContext, stmt: &Statement) -> Result<Box<dyn Rows>, PgError> {
        let Statement::Query(query) = stmt else {
            return Err(PgError::unsupported("statement for the literal backend"));
        };
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(PgError::unsupported("query shape for the literal backend"));
        };
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for item in &select.projection {
            let (expr, name) = match item {
                SelectItem::UnnamedExpr(expr) => (expr, "?column?".to_string()),
                SelectItem::ExprWithAlias { expr, alias } => (expr, alias.value.clone()),
                _ => return Err(PgError::unsupported("projection for the literal backend")),
            };
            let Expr::Value(value) = expr else {
                return Err(PgError::unsupported("expression for the literal backend"));
            };
            values.push(render_value(value)?);
            columns.push(name);
        }
        Ok(Box::new(LiteralRows {
            columns,
            row: Some(values),
        }))
    }
}

fn render_value(value: &Value) -> Result<String, PgError> {
    match value {
        Value::Number(n, _) => Ok(n.clone()),
        Value::SingleQuotedString(s) => Ok(s.clone()),
        Value::Boolean(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(PgError::unsupported(format!("literal {}", other))),
    }
}
