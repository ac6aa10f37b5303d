use anyhow::{anyhow, bail, Result};
use bytes::{BufMut, BytesMut};

use crate::types::type_oid;

/// Frontend message tags.
pub const QUERY: u8 = b'Q';
pub const TERMINATE: u8 = b'X';
pub const PARSE: u8 = b'P';
pub const BIND: u8 = b'B';
pub const DESCRIBE: u8 = b'D';
pub const EXECUTE: u8 = b'E';
pub const SYNC: u8 = b'S';
pub const PASSWORD: u8 = b'p';

/// A single framed wire message, stored exactly as it appears on the wire.
///
/// Untyped messages (startup traffic only) are `[len:4][body]`; typed
/// messages are `[tag:1][len:4][body]`. Length fields are big-endian and
/// inclusive of themselves. Untyped messages report a type of 0 because a
/// frame length never reaches 2^24, so their first byte is always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message(Vec<u8>);

/// Optional fields of an ErrorResponse, in wire order.
#[derive(Debug, Clone, Default)]
pub struct ErrorFields<'a> {
    pub severity: &'a str,
    pub code: &'a str,
    pub message: &'a str,
    pub detail: Option<&'a str>,
    pub hint: Option<&'a str>,
    pub position: Option<i32>,
}

impl Message {
    pub fn new(bytes: Vec<u8>) -> Self {
        Message(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The single-character message type, or 0 for untyped/empty messages.
    pub fn message_type(&self) -> u8 {
        self.0.first().copied().unwrap_or(0)
    }

    /// Body of a typed message, past the tag and length prefix.
    pub fn typed_body(&self) -> Result<&[u8]> {
        if self.message_type() == 0 || self.0.len() < 5 {
            bail!("not a typed message");
        }
        Ok(&self.0[5..])
    }

    /// Protocol version requested by a startup message, as "major.minor".
    /// Version 3.0 is the only one the server accepts; the magic versions
    /// 1234.5678 and 1234.5679 mark CancelRequest and SSLRequest.
    pub fn startup_version(&self) -> Result<String> {
        if self.message_type() != 0 {
            bail!(
                "expected untyped startup message, got: {:?}",
                self.message_type() as char
            );
        }
        if self.0.len() < 8 {
            bail!("startup message too short: {} bytes", self.0.len());
        }
        let major = u16::from_be_bytes([self.0[4], self.0[5]]);
        let minor = u16::from_be_bytes([self.0[6], self.0[7]]);
        Ok(format!("{}.{}", major, minor))
    }

    /// Key-value arguments of a startup message (user, database, ...), in
    /// the order the client sent them. Scanning stops at the first empty
    /// key, i.e. the terminating double-NUL.
    pub fn startup_args(&self) -> Result<Vec<(String, String)>> {
        if self.message_type() != 0 {
            bail!(
                "expected untyped startup message, got: {:?}",
                self.message_type() as char
            );
        }
        let mut args = Vec::new();
        let mut buf = &self.0[8.min(self.0.len())..];
        loop {
            let key = match take_cstring(&mut buf) {
                Some(k) if !k.is_empty() => k,
                _ => break,
            };
            let value = take_cstring(&mut buf).unwrap_or_default();
            args.push((key, value));
        }
        Ok(args)
    }

    pub fn is_tls_request(&self) -> bool {
        self.startup_version().map_or(false, |v| v == "1234.5679")
    }

    pub fn is_cancel(&self) -> bool {
        self.startup_version().map_or(false, |v| v == "1234.5678")
    }

    pub fn is_terminate(&self) -> bool {
        self.message_type() == TERMINATE
    }

    /// The (pid, secret) pair of a CancelRequest.
    pub fn cancel_key_data(&self) -> Result<(i32, i32)> {
        if !self.is_cancel() {
            bail!("not a cancel message");
        }
        if self.0.len() < 16 {
            bail!("cancel message too short: {} bytes", self.0.len());
        }
        let pid = i32::from_be_bytes([self.0[8], self.0[9], self.0[10], self.0[11]]);
        let secret = i32::from_be_bytes([self.0[12], self.0[13], self.0[14], self.0[15]]);
        Ok((pid, secret))
    }

    /// SQL text of a Query message, without its trailing NUL.
    pub fn query_text(&self) -> Result<String> {
        if self.message_type() != QUERY {
            bail!("not a query message: {:?}", self.message_type() as char);
        }
        let body = self.typed_body()?;
        let text = body.strip_suffix(&[0]).unwrap_or(body);
        Ok(String::from_utf8_lossy(text).to_string())
    }

    /// Whether this frontend message opens an extended-query transaction.
    pub fn creates_transaction(&self) -> bool {
        matches!(self.message_type(), PARSE | BIND | DESCRIBE)
    }

    /// Whether this frontend message ends the extended-query transaction.
    pub fn ends_transaction(&self) -> bool {
        matches!(self.message_type(), QUERY | SYNC)
    }

    fn typed(tag: u8, payload: &[u8]) -> Message {
        let mut buf = BytesMut::with_capacity(payload.len() + 5);
        buf.put_u8(tag);
        buf.put_i32(payload.len() as i32 + 4);
        buf.put_slice(payload);
        Message(buf.to_vec())
    }

    pub fn authentication_ok() -> Message {
        Message(vec![b'R', 0, 0, 0, 8, 0, 0, 0, 0])
    }

    pub fn authentication_cleartext() -> Message {
        Message(vec![b'R', 0, 0, 0, 8, 0, 0, 0, 3])
    }

    pub fn authentication_md5(salt: [u8; 4]) -> Message {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_i32(5);
        payload.put_slice(&salt);
        Message::typed(b'R', &payload)
    }

    pub fn parameter_status(name: &str, value: &str) -> Message {
        let mut payload = BytesMut::new();
        put_cstring(&mut payload, name);
        put_cstring(&mut payload, value);
        Message::typed(b'S', &payload)
    }

    pub fn backend_key_data(pid: i32, secret: i32) -> Message {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_i32(pid);
        payload.put_i32(secret);
        Message::typed(b'K', &payload)
    }

    /// ReadyForQuery with the idle status; the simple-query path never
    /// reports an open transaction block.
    pub fn ready_for_query() -> Message {
        Message(vec![b'Z', 0, 0, 0, 5, b'I'])
    }

    /// Single-byte SSLRequest answer; not length-prefixed.
    pub fn tls_response(supported: bool) -> Message {
        Message(vec![if supported { b'S' } else { b'N' }])
    }

    /// Schema of the DataRow messages about to be transmitted. Table OID,
    /// attribute number, type size and modifier are zeroed; the format code
    /// is always text.
    pub fn row_description(columns: &[String], type_names: &[String]) -> Message {
        let mut payload = BytesMut::new();
        payload.put_i16(columns.len() as i16);
        for (i, name) in columns.iter().enumerate() {
            put_cstring(&mut payload, name);
            payload.put_i32(0);
            payload.put_i16(0);
            let type_name = type_names.get(i).map(String::as_str).unwrap_or("");
            payload.put_i32(type_oid(type_name));
            payload.put_i16(0);
            payload.put_i32(0);
            payload.put_i16(0);
        }
        Message::typed(b'T', &payload)
    }

    /// One result row in text format: a 4-byte length then the value bytes,
    /// per column.
    pub fn data_row(values: &[String]) -> Message {
        let mut payload = BytesMut::new();
        payload.put_i16(values.len() as i16);
        for value in values {
            payload.put_i32(value.len() as i32);
            payload.put_slice(value.as_bytes());
        }
        Message::typed(b'D', &payload)
    }

    pub fn command_complete(tag: &str) -> Message {
        let mut payload = BytesMut::new();
        put_cstring(&mut payload, tag);
        Message::typed(b'C', &payload)
    }

    pub fn parse_complete() -> Message {
        Message(vec![b'1', 0, 0, 0, 4])
    }

    pub fn bind_complete() -> Message {
        Message(vec![b'2', 0, 0, 0, 4])
    }

    pub fn portal_suspended() -> Message {
        Message(vec![b's', 0, 0, 0, 4])
    }

    pub fn parameter_description(param_oids: &[i32]) -> Message {
        let mut payload = BytesMut::new();
        payload.put_i16(param_oids.len() as i16);
        for oid in param_oids {
            payload.put_i32(*oid);
        }
        Message::typed(b't', &payload)
    }

    /// Field-coded error report: severity, SQLSTATE and message always,
    /// detail/hint/position when present, closed by an extra NUL.
    pub fn error_response(fields: &ErrorFields) -> Message {
        let mut payload = BytesMut::new();
        payload.put_u8(b'S');
        put_cstring(&mut payload, fields.severity);
        payload.put_u8(b'C');
        put_cstring(&mut payload, fields.code);
        payload.put_u8(b'M');
        put_cstring(&mut payload, fields.message);
        if let Some(detail) = fields.detail {
            payload.put_u8(b'D');
            put_cstring(&mut payload, detail);
        }
        if let Some(hint) = fields.hint {
            payload.put_u8(b'H');
            put_cstring(&mut payload, hint);
        }
        if let Some(position) = fields.position {
            payload.put_u8(b'P');
            put_cstring(&mut payload, &position.to_string());
        }
        payload.put_u8(0);
        Message::typed(b'E', &payload)
    }
}

fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn take_cstring(buf: &mut &[u8]) -> Option<String> {
    let end = buf.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&buf[..end]).to_string();
    *buf = &buf[end + 1..];
    Some(s)
}

/// Severity and message of an ErrorResponse, used by tests and diagnostics.
pub fn error_message_field(msg: &Message) -> Result<String> {
    let body = msg.typed_body()?;
    let mut cur = body;
    while !cur.is_empty() && cur[0] != 0 {
        let code = cur[0];
        cur = &cur[1..];
        let value = take_cstring(&mut cur).ok_or_else(|| anyhow!("unterminated error field"))?;
        if code == b'M' {
            return Ok(value);
        }
    }
    bail!("error response has no message field");
}
