//! TCP listener for a serving node
//!
//! One task per connection. The first line must be a `Connect` frame; the
//! handshake answer is `Connected` or `Rejected`. After that every
//! `Request` line is answered with one `Reply` line, in order. Connections
//! close when the peer hangs up, on protocol errors, on shutdown, and when
//! the node drops its connections (leaving quorum).
//!
//! The accept loop also sweeps idle sessions once per node tick.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::observability::{log_event_with_fields, Event, Logger};
use crate::protocol::{ClientFrame, ConnectRequest, Operation, ServerFrame};
use crate::transport::{decode_frame, write_frame};

use super::errors::{ServerError, ServerResult};
use super::node::ServerNode;

/// How long a new connection may take to send its handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept loop serving one node over TCP.
pub struct NodeServer {
    node: Arc<ServerNode>,
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl NodeServer {
    pub async fn bind(node: Arc<ServerNode>, addr: SocketAddr) -> ServerResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::io(format!("Failed to bind {}: {}", addr, e)))?;
        Ok(Self {
            node,
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Cancel to stop accepting and close every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> ServerResult<()> {
        let address = self.local_addr()?.to_string();
        log_event_with_fields(
            Event::NodeServing,
            &[
                ("address", &address),
                ("node", self.node.name()),
                ("role", self.node.role().as_str()),
            ],
        );

        let mut sweep = interval(self.node.tick().max(Duration::from_millis(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.node.sweep_sessions();
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let node = Arc::clone(&self.node);
                        let cancel = self.shutdown.child_token();
                        tokio::spawn(async move {
                            serve_connection(node, stream, peer, cancel).await;
                        });
                    }
                    Err(e) => {
                        let error = ServerError::from(e);
                        Logger::warn(
                            "ACCEPT_FAILED",
                            &[("code", &error.error_code().to_string()), ("error", &error.message)],
                        );
                    }
                }
            }
        }

        log_event_with_fields(Event::NodeShutdown, &[("node", self.node.name())]);
        Ok(())
    }
}

async fn serve_connection(
    node: Arc<ServerNode>,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let connection_id = Uuid::new_v4().to_string();
    let peer = peer.to_string();
    let _ = stream.set_nodelay(true);
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let request = match read_handshake(&mut lines).await {
        Ok(request) => request,
        Err(error) => {
            log_closed(&node, &connection_id, &peer, Err(&error));
            return;
        }
    };

    // Subscribe before the handshake so a role change racing it is seen
    let mut epoch = node.subscribe_epoch();
    let started_at = *epoch.borrow_and_update();

    let admission = match node.handshake(&request) {
        Ok(admission) => admission,
        Err(reason) => {
            let error = ServerError::refused(reason.as_str());
            log_event_with_fields(
                Event::ConnectionRefused,
                &[
                    ("code", &error.error_code().to_string()),
                    ("connection_id", &connection_id),
                    ("node", node.name()),
                    ("peer", &peer),
                    ("reason", &error.message),
                ],
            );
            let _ = write_frame(&mut write, &ServerFrame::Rejected { reason }).await;
            return;
        }
    };

    let session = admission.session;
    let read_only = if admission.response.read_only { "true" } else { "false" };
    if let Err(e) = write_frame(&mut write, &ServerFrame::Connected(admission.response)).await {
        node.release(&session);
        log_closed(&node, &connection_id, &peer, Err(&ServerError::from(e)));
        return;
    }
    log_event_with_fields(
        Event::ConnectionAccepted,
        &[
            ("connection_id", &connection_id),
            ("node", node.name()),
            ("peer", &peer),
            ("read_only", read_only),
            ("session_id", &format!("{:#x}", session.session_id)),
        ],
    );

    let outcome: ServerResult<&str> = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok("shutdown"),
            changed = epoch.changed() => {
                if changed.is_err() || *epoch.borrow_and_update() != started_at {
                    break Ok("dropped by node");
                }
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match decode_frame::<ClientFrame>(&line) {
                    Ok(ClientFrame::Request(request)) => {
                        let closing = matches!(request.op, Operation::CloseSession);
                        let reply = node.process(&session, request);
                        if let Err(e) = write_frame(&mut write, &ServerFrame::Reply(reply)).await {
                            break Err(e.into());
                        }
                        if closing {
                            break Ok("session closed");
                        }
                    }
                    Ok(ClientFrame::Connect(_)) => {
                        break Err(ServerError::protocol("handshake repeated"));
                    }
                    Err(e) => break Err(e.into()),
                },
                Ok(None) => break Ok("peer closed"),
                Err(e) => break Err(e.into()),
            }
        }
    };

    node.release(&session);
    log_closed(&node, &connection_id, &peer, outcome.as_ref().map(|reason| *reason));
}

/// First frame of a connection, which must be a `Connect`.
async fn read_handshake(
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
) -> ServerResult<ConnectRequest> {
    let line = match timeout(HANDSHAKE_TIMEOUT, lines.next_line()).await {
        Ok(line) => line?,
        Err(_) => return Err(ServerError::protocol("no handshake in time")),
    };
    let line = line.ok_or_else(|| ServerError::protocol("closed before handshake"))?;
    match decode_frame::<ClientFrame>(&line)? {
        ClientFrame::Connect(request) => Ok(request),
        ClientFrame::Request(_) => Err(ServerError::protocol("handshake expected")),
    }
}

fn log_closed(
    node: &ServerNode,
    connection_id: &str,
    peer: &str,
    outcome: Result<&str, &ServerError>,
) {
    let code;
    let mut fields = vec![
        ("connection_id", connection_id),
        ("node", node.name()),
        ("peer", peer),
    ];
    match outcome {
        Ok(reason) => fields.push(("reason", reason)),
        Err(error) => {
            code = error.error_code().to_string();
            fields.push(("code", code.as_str()));
            fields.push(("reason", error.message.as_str()));
        }
    }
    log_event_with_fields(Event::ConnectionClosed, &fields);
}
