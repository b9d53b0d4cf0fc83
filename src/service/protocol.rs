use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Socket path constant
pub const SOCKET_PATH: &str = "/run/facepunch/matcher.sock";

/// Two JPEG stills plus framing comfortably fit; anything larger is refused.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// Request types
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Request {
    Compare(CompareRequest),
    Ping,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompareRequest {
    pub request_id: String,
    pub probe_jpeg: Vec<u8>,
    pub reference_jpeg: Vec<u8>,
}

// Response types
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Response {
    Similarity(SimilarityResponse),
    Pong,
    Error(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SimilarityResponse {
    pub request_id: String,
    pub similarity: f32,
}

/// Writes one message: little-endian u32 length, then the bincode body.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("Failed to serialize message: {}", e)))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "Message too large"));
    }

    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Message too large"));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("Failed to deserialize message: {}", e)))
}
