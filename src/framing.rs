//! Length-prefixed framing for the TCP client protocol.

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::NodeRef;
use crate::protocol::{decode_node_ref, encode_node_ref, NODE_REF_SIZE};

/// Refuse frames above this size; a length prefix past it is a protocol
/// violation, not a real payload.
const MAX_FRAME: u64 = 256 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> Result<()> {
    stream.write_u64_le(data.len() as u64).await?;
    stream.write_all(data).await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let len = stream.read_u64_le().await?;
    if len > MAX_FRAME {
        bail!("frame of {len} bytes exceeds limit");
    }

    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn write_string<W: AsyncWrite + Unpin>(stream: &mut W, value: &str) -> Result<()> {
    write_frame(stream, value.as_bytes()).await
}

pub async fn read_string<R: AsyncRead + Unpin>(stream: &mut R) -> Result<String> {
    let bytes = read_frame(stream).await?;
    Ok(String::from_utf8(bytes)?)
}

pub async fn write_node_ref<W: AsyncWrite + Unpin>(stream: &mut W, node: &NodeRef) -> Result<()> {
    stream.write_all(&encode_node_ref(node)).await?;
    Ok(())
}

pub async fn read_node_ref<R: AsyncRead + Unpin>(stream: &mut R) -> Result<NodeRef> {
    let mut buf = [0u8; NODE_REF_SIZE];
    stream.read_exact(&mut buf).await?;
    Ok(decode_node_ref(&buf))
}
