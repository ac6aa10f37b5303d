use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;

/// Reads one untyped message: a 4-byte inclusive length followed by the
/// body. The returned message keeps the length prefix so that inspector
/// offsets match the wire layout.
pub async fn read_raw_message<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Message> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = i32::from_be_bytes(len_bytes);
    if len < 4 {
        bail!("invalid message length {}", len);
    }
    let mut buf = vec![0u8; len as usize];
    buf[..4].copy_from_slice(&len_bytes);
    stream.read_exact(&mut buf[4..]).await?;
    Ok(Message::new(buf))
}

/// Reads one typed message: a single-byte tag, then the length-prefixed
/// body. The tag is kept as the first byte of the returned message.
pub async fn read_typed_message<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Message> {
    let tag = stream.read_u8().await?;
    let body = read_raw_message(stream).await?;
    let mut buf = Vec::with_capacity(body.as_bytes().len() + 1);
    buf.push(tag);
    buf.extend_from_slice(body.as_bytes());
    Ok(Message::new(buf))
}

pub async fn write_message<S: AsyncWrite + Unpin>(stream: &mut S, msg: &Message) -> Result<()> {
    stream.write_all(msg.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
