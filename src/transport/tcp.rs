//! TCP transport
//!
//! JSON-lines frames over a `TcpStream`. A background task reads reply
//! lines into a channel so `receive` is cancel-safe.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{ClientFrame, ConnectRequest, Reply, Request, ServerFrame};
use crate::roster::ServerEndpoint;

use super::framing::{decode_frame, write_frame};
use super::{Connection, Connector, HandshakeOutcome, TransportError, TransportResult};

/// Replies buffered ahead of the session task.
const REPLY_BUFFER: usize = 256;

/// Connects to `server::NodeServer` instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn handshake(
        &self,
        endpoint: &ServerEndpoint,
        request: ConnectRequest,
    ) -> TransportResult<HandshakeOutcome> {
        let stream = TcpStream::connect(endpoint.address())
            .await
            .map_err(|e| TransportError::Refused(format!("{}: {}", endpoint, e)))?;
        let _ = stream.set_nodelay(true);
        let (read, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write_frame(&mut writer, &ClientFrame::Connect(request)).await?;
        let line = lines.next_line().await?.ok_or(TransportError::Closed)?;

        match decode_frame::<ServerFrame>(&line)? {
            ServerFrame::Connected(response) => {
                let (tx, replies) = mpsc::channel(REPLY_BUFFER);
                let reader = tokio::spawn(async move {
                    loop {
                        let item = match lines.next_line().await {
                            Ok(Some(line)) => match decode_frame::<ServerFrame>(&line) {
                                Ok(ServerFrame::Reply(reply)) => Ok(reply),
                                Ok(_) => Err(TransportError::Protocol(
                                    "unexpected frame after handshake".to_string(),
                                )),
                                Err(e) => Err(e),
                            },
                            Ok(None) => break,
                            Err(e) => Err(TransportError::from(e)),
                        };
                        let failed = item.is_err();
                        if tx.send(item).await.is_err() || failed {
                            break;
                        }
                    }
                });
                Ok(HandshakeOutcome::Accepted {
                    response,
                    connection: Box::new(TcpConnection {
                        writer,
                        replies,
                        reader,
                        closed: false,
                    }),
                })
            }
            ServerFrame::Rejected { reason } => Ok(HandshakeOutcome::Rejected(reason)),
            ServerFrame::Reply(_) => Err(TransportError::Protocol(
                "reply before handshake".to_string(),
            )),
        }
    }
}

struct TcpConnection {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<TransportResult<Reply>>,
    reader: JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, request: Request) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        write_frame(&mut self.writer, &ClientFrame::Request(request)).await
    }

    async fn receive(&mut self) -> TransportResult<Reply> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.replies.recv().await {
            Some(item) => item,
            None => Err(TransportError::Closed),
        }
    }

    async fn cancel(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reader.abort();
        let _ = self.writer.shutdown().await;
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
