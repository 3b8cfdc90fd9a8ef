use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{Result, SkeinError};
use crate::protocol::{Request, Response};

/// Maximum frame size (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// JSON codec for the envelope types.
///
/// # Example
///
/// ```
/// use skein_common::transport::JsonCodec;
/// use skein_common::protocol::Request;
/// use serde_json::json;
///
/// let request = Request::new("ping", json!({}));
/// let encoded = JsonCodec::encode_request(&request).unwrap();
/// let decoded = JsonCodec::decode_request(&encoded).unwrap();
/// assert_eq!(request, decoded);
/// ```
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    /// Decodes a request; invalid JSON is a malformed request, not a
    /// transport failure.
    pub fn decode_request(data: &[u8]) -> Result<Request> {
        serde_json::from_slice(data).map_err(|e| SkeinError::MalformedRequest(e.to_string()))
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    pub fn decode_response(data: &[u8]) -> Result<Response> {
        serde_json::from_slice(data).map_err(|e| SkeinError::MalformedRequest(e.to_string()))
    }
}

/// Writes one length-prefixed JSON frame.
///
/// Wire format: `[4-byte length as u32 big-endian] + [JSON data]`
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(SkeinError::Transport(format!(
            "Message too large: {} bytes (max {} bytes)",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }

    let len = data.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| SkeinError::Transport(format!("Failed to write length prefix: {}", e)))?;
    writer
        .write_all(&data)
        .await
        .map_err(|e| SkeinError::Transport(format!("Failed to write data: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| SkeinError::Transport(format!("Failed to flush stream: {}", e)))?;

    Ok(())
}

/// Reads one length-prefixed frame and returns its raw payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(SkeinError::Transport("Connection closed by peer".to_string()));
        }
        Err(e) => {
            return Err(SkeinError::Transport(format!("Failed to read length prefix: {}", e)));
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SkeinError::Transport(format!(
            "Message too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| SkeinError::Transport(format!("Failed to read data: {}", e)))?;

    Ok(buf)
}

/// Reads one frame and decodes it as `T`.
///
/// Undecodable payloads surface as [`SkeinError::MalformedRequest`] so the
/// receiver can still answer the peer.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let buf = read_frame(reader).await?;
    serde_json::from_slice(&buf).map_err(|e| SkeinError::MalformedRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = Request::new("ping", json!({"n": 1})).with_timeout(100);

        write_frame(&mut client, &request).await.unwrap();
        let decoded: Request = read_message(&mut server).await.unwrap();

        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_frame_prefix_is_big_endian_length() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &json!({"a": 1})).await.unwrap();

        let mut prefix = [0u8; 4];
        server.read_exact(&mut prefix).await.unwrap();
        assert_eq!(u32::from_be_bytes(prefix), br#"{"a":1}"#.len() as u32);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(err.to_string().contains("Message too large"));
    }

    #[tokio::test]
    async fn test_eof_reports_closed_connection() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, SkeinError::Transport(ref msg) if msg.contains("closed")));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let payload = b"not json";
        client.write_all(&(payload.len() as u32).to_be_bytes()).await.unwrap();
        client.write_all(payload).await.unwrap();

        let err = read_message::<_, Request>(&mut server).await.unwrap_err();
        assert!(matches!(err, SkeinError::MalformedRequest(_)));
    }

    #[test]
    fn test_decode_request_rejects_invalid_json() {
        assert!(matches!(
            JsonCodec::decode_request(b"{"),
            Err(SkeinError::MalformedRequest(_))
        ));
    }
}
