//! Leader Server
//!
//! Accepts replica connections and feeds their messages to the leader
//! replication service. Each connection gets a writer task draining the
//! outbound queue the service sends through.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use super::{is_disconnect, read_message, write_message, ConnectionId};
use crate::error::{Error, Result};
use crate::replication::{LeaderInput, Message, ReplicaLink};

/// TCP server for replica connections
pub struct LeaderServer {
    listener: TcpListener,
    next_connection_id: ConnectionId,
}

impl LeaderServer {
    /// Bind the listening socket
    pub async fn bind(bind_address: &str) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        tracing::info!("Replication server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            next_connection_id: 1,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until shutdown
    pub async fn run(
        mut self,
        inputs: mpsc::UnboundedSender<LeaderInput>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let connection_id = self.next_connection_id;
                            self.next_connection_id += 1;

                            tracing::info!("Replica connected from {} (C:{})", addr, connection_id);

                            let inputs = inputs.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, connection_id, inputs).await {
                                    tracing::warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Replication server stopped");
        Ok(())
    }
}

/// Pump one connection until either direction fails
async fn handle_connection(
    socket: TcpStream,
    connection_id: ConnectionId,
    inputs: mpsc::UnboundedSender<LeaderInput>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let link = ReplicaLink::new(connection_id, outbound_tx);

    let mut writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            tracing::trace!("Sending {} on C:{}", message.type_name(), connection_id);
            write_message(&mut writer, &message).await?;
        }
        Ok::<(), Error>(())
    });

    let read_loop = async {
        loop {
            match read_message(&mut reader).await {
                Ok(message) => {
                    tracing::trace!("Received {} on C:{}", message.type_name(), connection_id);
                    let input = LeaderInput::Message {
                        link: link.clone(),
                        message,
                    };
                    if inputs.send(input).is_err() {
                        return Err(Error::ShuttingDown);
                    }
                }
                Err(e) if is_disconnect(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    };

    let result = tokio::select! {
        result = read_loop => result,
        joined = &mut writer_task => match joined {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("connection writer failed: {}", e))),
        },
    };

    writer_task.abort();
    tracing::info!("Replica connection C:{} closed", connection_id);
    let _ = inputs.send(LeaderInput::ConnectionClosed { connection_id });

    match result {
        Err(e) if is_disconnect(&e) => Ok(()),
        other => other,
    }
}
