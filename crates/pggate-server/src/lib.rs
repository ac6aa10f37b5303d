pub mod auth;
pub mod cancel;
pub mod config;
pub mod errors;
pub mod query;
pub mod server;
mod session;

pub use auth::{AuthMethod, Authenticator, ConstantPasswordProvider, MapPasswordProvider, PasswordProvider};
pub use cancel::{CancelRegistry, CancelToken};
pub use config::Config;
pub use errors::{PgError, Severity};
pub use query::{Cursor, ExecResult, Execer, FetchOutcome, QueryContext, Queryer, Rows};
pub use server::{run, Server};
