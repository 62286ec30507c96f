//! 流式会话的帧格式。
//!
//! ```text
//! +-----------------+---------------------------+---------------+--------+
//! | header_len: u32 | "Key: Value\r\n" × N      | body_len: u32 | body   |
//! +-----------------+---------------------------+---------------+--------+
//! ```
//!
//! 长度字段为大端序；头部块与消息体各自受 `max_frame_bytes` 约束。

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use spark_rpc_core::error::codes;
use spark_rpc_core::{Metadata, RpcError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::headers;

/// 一帧：头部 + 已编码的消息体。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub headers: Metadata,
    pub body: Bytes,
}

impl Frame {
    pub fn new(headers: Metadata, body: Bytes) -> Self {
        Self { headers, body }
    }

    /// 对端通过 `Status` 头部携带的状态码；缺失或非数字时返回 `None`。
    pub fn status(&self) -> Option<u16> {
        self.headers
            .get(headers::STATUS)
            .and_then(|raw| raw.trim().parse().ok())
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame section of {len} bytes exceeds limit of {limit} bytes")]
    TooLarge { len: usize, limit: usize },
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
    #[error("peer closed the stream")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<FrameError> for RpcError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Closed => RpcError::session_closed(),
            other => RpcError::internal(codes::INTERNAL, other.to_string()).with_cause(other),
        }
    }
}

/// 将一帧编码进缓冲区。
pub fn encode(frame: &Frame, limit: usize, dst: &mut BytesMut) -> Result<(), FrameError> {
    let mut block = String::new();
    for (key, value) in frame.headers.iter() {
        if key.is_empty() || key.contains([':', '\r', '\n']) {
            return Err(FrameError::MalformedHeader(format!("invalid key {key:?}")));
        }
        if value.contains(['\r', '\n']) {
            return Err(FrameError::MalformedHeader(format!(
                "invalid value for {key}"
            )));
        }
        block.push_str(key);
        block.push_str(": ");
        block.push_str(value);
        block.push_str("\r\n");
    }
    let header_len = section_len(block.len(), limit)?;
    let body_len = section_len(frame.body.len(), limit)?;

    dst.reserve(8 + block.len() + frame.body.len());
    dst.put_u32(header_len);
    dst.put_slice(block.as_bytes());
    dst.put_u32(body_len);
    dst.put_slice(&frame.body);
    Ok(())
}

fn section_len(len: usize, limit: usize) -> Result<u32, FrameError> {
    if len > limit {
        return Err(FrameError::TooLarge { len, limit });
    }
    u32::try_from(len).map_err(|_| FrameError::TooLarge { len, limit })
}

/// 解析头部块。
pub fn decode_headers(block: &[u8]) -> Result<Metadata, FrameError> {
    let text = std::str::from_utf8(block)
        .map_err(|err| FrameError::MalformedHeader(err.to_string()))?;
    let mut metadata = Metadata::new();
    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        metadata.insert(key.trim(), value.trim_start());
    }
    Ok(metadata)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame, limit: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    encode(frame, limit, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取一帧。帧边界处的 EOF 视为对端正常关闭。
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let header_len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Err(FrameError::Closed),
        Err(err) => return Err(err.into()),
    };
    let block = read_section(reader, header_len, limit).await?;
    let headers = decode_headers(&block)?;

    let body_len = reader.read_u32().await? as usize;
    let body = read_section(reader, body_len, limit).await?;
    Ok(Frame::new(headers, Bytes::from(body)))
}

async fn read_section<R>(reader: &mut R, len: usize, limit: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    if len > limit {
        return Err(FrameError::TooLarge { len, limit });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
