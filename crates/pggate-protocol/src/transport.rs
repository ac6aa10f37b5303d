use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::{read_raw_message, read_typed_message, write_message};
use crate::frontend::{self, FrontendMessage};
use crate::message::Message;

/// Transaction state reported alongside every frontend message, so the
/// session can promote or discard its pending prepared statements and
/// portals at transaction boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotInTransaction,
    InTransaction,
    TransactionEnded,
    TransactionFailed,
}

/// Outbound buffer of an extended-query transaction. The first buffered
/// ErrorResponse seals the buffer: later writes are dropped so the client
/// sees the error at the position it occurred and nothing after it until
/// Sync. The queue is flushed in order either way.
#[derive(Debug, Default)]
struct TransactionBuffer {
    out: Vec<Message>,
    has_error: bool,
}

impl TransactionBuffer {
    fn push(&mut self, msg: Message) {
        if self.has_error {
            return;
        }
        let is_error = msg.message_type() == b'E';
        self.out.push(msg);
        if is_error {
            self.has_error = true;
        }
    }
}

/// Duplex framing over one client connection. Before startup completes,
/// messages are untyped; afterwards every frontend message carries a tag.
/// Parse/Bind/Describe open an implicit transaction that buffers all
/// backend output until the next Query or Sync commits it to the wire.
pub struct Transport<S> {
    stream: S,
    initialized: bool,
    transaction: Option<TransactionBuffer>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    pub fn new(stream: S) -> Self {
        Transport {
            stream,
            initialized: false,
            transaction: None,
        }
    }

    /// First-message exchange of a new connection. Cancel requests are
    /// returned to the caller untouched; an SSLRequest is refused with 'N'
    /// and the startup message re-read; any version other than 3.0 is
    /// rejected. After a successful return the transport reads typed
    /// messages.
    pub async fn startup(&mut self) -> Result<Message> {
        if self.initialized {
            bail!("startup already completed");
        }
        let mut msg = read_raw_message(&mut self.stream).await?;
        if msg.is_cancel() {
            return Ok(msg);
        }
        if msg.is_tls_request() {
            write_message(&mut self.stream, &Message::tls_response(false)).await?;
            msg = read_raw_message(&mut self.stream).await?;
            if msg.is_tls_request() {
                bail!("repeated TLS request");
            }
        }
        let version = msg.startup_version()?;
        if version != "3.0" {
            bail!("unsupported protocol version {}", version);
        }
        self.initialized = true;
        Ok(msg)
    }

    /// Reads one message: untyped during startup, typed afterwards. Used by
    /// the authenticators, which run between startup and the query cycle.
    pub async fn read_message(&mut self) -> Result<Message> {
        if self.initialized {
            read_typed_message(&mut self.stream).await
        } else {
            read_raw_message(&mut self.stream).await
        }
    }

    /// Writes a backend message, buffering it when a transaction is open.
    pub async fn write_message(&mut self, msg: Message) -> Result<()> {
        if let Some(tx) = self.transaction.as_mut() {
            tx.push(msg);
            return Ok(());
        }
        write_message(&mut self.stream, &msg).await
    }

    /// Returns the next frontend message together with the transaction
    /// state it produced. Outside a transaction the client is first told
    /// the server is idle with ReadyForQuery; inside one, messages are read
    /// straight through. A Query or Sync that ends the transaction flushes
    /// the buffered output before this returns.
    pub async fn next_frontend_message(&mut self) -> Result<(FrontendMessage, TransactionState)> {
        if !self.initialized {
            bail!("transport not yet initialized");
        }
        if self.transaction.is_none() {
            write_message(&mut self.stream, &Message::ready_for_query()).await?;
        }
        let msg = read_typed_message(&mut self.stream).await?;
        let state = match self.transaction.take() {
            None if msg.creates_transaction() => {
                self.transaction = Some(TransactionBuffer::default());
                TransactionState::InTransaction
            }
            None => TransactionState::NotInTransaction,
            Some(buffer) if msg.ends_transaction() => {
                let failed = buffer.has_error;
                self.flush(buffer).await?;
                if failed {
                    TransactionState::TransactionFailed
                } else {
                    TransactionState::TransactionEnded
                }
            }
            Some(buffer) => {
                self.transaction = Some(buffer);
                TransactionState::InTransaction
            }
        };
        Ok((frontend::decode(&msg)?, state))
    }

    async fn flush(&mut self, buffer: TransactionBuffer) -> Result<()> {
        for msg in &buffer.out {
            write_message(&mut self.stream, msg).await?;
        }
        Ok(())
    }
}
