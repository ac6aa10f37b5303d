use anyhow::{anyhow, Result};

use crate::message::{self, Message};

/// A decoded frontend message, dispatched on by the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    Query {
        sql: String,
    },
    Password {
        password: Vec<u8>,
    },
    /// Extended query: Parse (P)
    Parse {
        statement_name: String,
        query: String,
        param_oids: Vec<i32>,
    },
    /// Extended query: Bind (B)
    Bind {
        portal_name: String,
        statement_name: String,
        param_format_codes: Vec<i16>,
        param_values: Vec<Option<Vec<u8>>>,
        result_format_codes: Vec<i16>,
    },
    /// Extended query: Describe (D)
    Describe {
        target: DescribeTarget,
        name: String,
    },
    /// Extended query: Execute (E)
    Execute {
        portal_name: String,
        max_rows: i32,
    },
    /// Extended query: Sync (S)
    Sync,
    Terminate,
    Unsupported {
        tag: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescribeTarget {
    Statement,
    Portal,
    /// Any other object-type byte; rejected by the session, not the codec.
    Unknown(u8),
}

/// Decodes a typed wire message into its frontend form. Tags without a
/// counterpart in the protocol core come back as `Unsupported` so the
/// session can answer without dropping the connection.
pub fn decode(msg: &Message) -> Result<FrontendMessage> {
    match msg.message_type() {
        message::QUERY => Ok(FrontendMessage::Query {
            sql: msg.query_text()?,
        }),
        message::PASSWORD => {
            let mut cur = msg.typed_body()?;
            Ok(FrontendMessage::Password {
                password: advance_bytes_until_nul(&mut cur),
            })
        }
        message::PARSE => parse_parse(msg.typed_body()?),
        message::BIND => parse_bind(msg.typed_body()?),
        message::DESCRIBE => parse_describe(msg.typed_body()?),
        message::EXECUTE => parse_execute(msg.typed_body()?),
        message::SYNC => Ok(FrontendMessage::Sync),
        message::TERMINATE => Ok(FrontendMessage::Terminate),
        other => Ok(FrontendMessage::Unsupported { tag: other }),
    }
}

fn advance_cstring(buf: &mut &[u8]) -> String {
    String::from_utf8_lossy(&advance_bytes_until_nul(buf)).to_string()
}

fn advance_bytes_until_nul(buf: &mut &[u8]) -> Vec<u8> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let bytes = buf[..end].to_vec();
    *buf = &buf[(end + 1).min(buf.len())..];
    bytes
}

fn advance_i16(buf: &mut &[u8]) -> Result<i16> {
    if buf.len() < 2 {
        return Err(anyhow!("buffer too short for i16"));
    }
    let v = i16::from_be_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(v)
}

fn advance_i32(buf: &mut &[u8]) -> Result<i32> {
    if buf.len() < 4 {
        return Err(anyhow!("buffer too short for i32"));
    }
    let v = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(v)
}

fn parse_parse(buf: &[u8]) -> Result<FrontendMessage> {
    let mut cur = buf;
    let statement_name = advance_cstring(&mut cur);
    let query = advance_cstring(&mut cur);
    let n = advance_i16(&mut cur)? as usize;
    let mut param_oids = Vec::with_capacity(n);
    for _ in 0..n {
        param_oids.push(advance_i32(&mut cur)?);
    }
    Ok(FrontendMessage::Parse {
        statement_name,
        query,
        param_oids,
    })
}

fn parse_bind(buf: &[u8]) -> Result<FrontendMessage> {
    let mut cur = buf;
    let portal_name = advance_cstring(&mut cur);
    let statement_name = advance_cstring(&mut cur);
    let n_fmt = advance_i16(&mut cur)? as usize;
    let mut param_format_codes = Vec::with_capacity(n_fmt);
    for _ in 0..n_fmt {
        param_format_codes.push(advance_i16(&mut cur)?);
    }
    let n_params = advance_i16(&mut cur)? as usize;
    let mut param_values = Vec::with_capacity(n_params);
    for _ in 0..n_params {
        let len = advance_i32(&mut cur)?;
        if len < 0 {
            param_values.push(None);
        } else {
            let len = len as usize;
            if cur.len() < len {
                return Err(anyhow!("bind buffer too short for param value"));
            }
            param_values.push(Some(cur[..len].to_vec()));
            cur = &cur[len..];
        }
    }
    let n_res = advance_i16(&mut cur)? as usize;
    let mut result_format_codes = Vec::with_capacity(n_res);
    for _ in 0..n_res {
        result_format_codes.push(advance_i16(&mut cur)?);
    }
    Ok(FrontendMessage::Bind {
        portal_name,
        statement_name,
        param_format_codes,
        param_values,
        result_format_codes,
    })
}

fn parse_describe(buf: &[u8]) -> Result<FrontendMessage> {
    let mut cur = buf;
    if cur.is_empty() {
        return Err(anyhow!("describe buffer empty"));
    }
    let target = match cur[0] {
        b'S' => DescribeTarget::Statement,
        b'P' => DescribeTarget::Portal,
        other => DescribeTarget::Unknown(other),
    };
    cur = &cur[1..];
    let name = advance_cstring(&mut cur);
    Ok(FrontendMessage::Describe { target, name })
}

fn parse_execute(buf: &[u8]) -> Result<FrontendMessage> {
    let mut cur = buf;
    let portal_name = advance_cstring(&mut cur);
    let max_rows = advance_i32(&mut cur)?;
    Ok(FrontendMessage::Execute {
        portal_name,
        max_rows,
    })
}
