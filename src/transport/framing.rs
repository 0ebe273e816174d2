//! JSON-lines framing: one serialized frame per `\n` terminated line.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{TransportError, TransportResult};

/// Serialize `frame` and write it as a single line.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Sync,
{
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode one line (without its terminator).
pub fn decode_frame<T: DeserializeOwned>(line: &str) -> TransportResult<T> {
    let line = line.trim();
    if line.is_empty() {
        return Err(TransportError::Protocol("empty frame".to_string()));
    }
    Ok(serde_json::from_str(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientFrame, ConnectRequest};

    #[tokio::test]
    async fn test_frame_is_one_line() {
        let mut buffer: Vec<u8> = Vec::new();
        let frame = ClientFrame::Connect(ConnectRequest::fresh(30_000, true));
        write_frame(&mut buffer, &frame).await.unwrap();

        let text = String::from_utf8(buffer).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);

        let decoded: ClientFrame = decode_frame(&text).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_frame::<ClientFrame>("{not json"),
            Err(TransportError::Protocol(_))
        ));
        assert!(matches!(
            decode_frame::<ClientFrame>("   "),
            Err(TransportError::Protocol(_))
        ));
    }
}
