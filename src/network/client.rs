//! Replica Connection
//!
//! Opens the replica side of a replication session: an outbound queue
//! and an inbound stream of leader messages. The inbound stream ends when
//! the connection does.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{is_disconnect, read_message, write_message};
use crate::error::{Error, Result};
use crate::replication::Message;

/// Connect to the leader and spawn the reader and writer tasks
pub async fn connect_to_leader(
    address: &str,
    connect_timeout: Duration,
) -> Result<(mpsc::UnboundedSender<Message>, mpsc::UnboundedReceiver<Message>)> {
    let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
    };
    stream.set_nodelay(true)?;

    tracing::info!("Connected to leader at {}", address);

    let (mut reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Message>();

    let peer = address.to_string();
    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(e) = write_message(&mut writer, &message).await {
                tracing::warn!("Write to leader {} failed: {}", peer, e);
                break;
            }
        }
    });

    let peer = address.to_string();
    tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(message) => {
                    if inbound_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) if is_disconnect(&e) => {
                    tracing::info!("Leader {} closed the connection", peer);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Read from leader {} failed: {}", peer, e);
                    break;
                }
            }
        }
    });

    Ok((outbound_tx, inbound_rx))
}
