//! Adapters that turn concrete transports into a [`Connection`].

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt, future, stream};
use tokio::sync::mpsc;

use crate::connection::{Connection, ConnectionError};

/// Wraps an upgraded server-side WebSocket.
///
/// Text and binary frames are both delivered as raw bytes; ping and pong
/// frames never reach the reader. Outbound bytes are sent as a text frame
/// when they are valid UTF-8 and as a binary frame otherwise.
pub fn websocket(socket: WebSocket) -> Connection {
    let (sink, stream) = socket.split();

    let stream = stream.filter_map(|frame| {
        future::ready(match frame {
            Ok(WsMessage::Text(text)) => Some(Ok(Bytes::from(text))),
            Ok(WsMessage::Binary(data)) => Some(Ok(Bytes::from(data))),
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => None,
            Ok(WsMessage::Close(_)) => Some(Err(ConnectionError::Closed)),
            Err(err) => Some(Err(ConnectionError::Transport(err.to_string()))),
        })
    });

    let sink = sink
        .sink_map_err(|err| ConnectionError::Transport(err.to_string()))
        .with(|message: Bytes| future::ready(Ok::<_, ConnectionError>(ws_frame(message))));

    Connection::new(stream, sink)
}

fn ws_frame(message: Bytes) -> WsMessage {
    match String::from_utf8(message.to_vec()) {
        Ok(text) => WsMessage::Text(text),
        Err(err) => WsMessage::Binary(err.into_bytes()),
    }
}

/// The far end of a [`loopback`] connection.
pub struct LoopbackPeer {
    to_connection: mpsc::UnboundedSender<Bytes>,
    from_connection: mpsc::UnboundedReceiver<Bytes>,
}

impl LoopbackPeer {
    /// Delivers a message to the connection's reader.
    pub fn send(&self, message: impl Into<Bytes>) -> Result<(), ConnectionError> {
        self.to_connection
            .send(message.into())
            .map_err(|_| ConnectionError::Closed)
    }

    /// Next message written by the connection, or `None` once the connection
    /// has been closed and everything it wrote has been drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.from_connection.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.from_connection.try_recv().ok()
    }
}

/// An in-memory connection. Dropping the peer ends the connection's read
/// stream and makes its writes fail.
pub fn loopback() -> (Connection, LoopbackPeer) {
    let (to_connection, inbound) = mpsc::unbounded_channel();
    let (outbound, from_connection) = mpsc::unbounded_channel();

    let stream = stream::unfold(inbound, |mut inbound| async move {
        inbound
            .recv()
            .await
            .map(|message| (Ok::<_, ConnectionError>(message), inbound))
    });
    let sink = LoopbackSink {
        outbound: Some(outbound),
    };

    (
        Connection::new(stream, sink),
        LoopbackPeer {
            to_connection,
            from_connection,
        },
    )
}

struct LoopbackSink {
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
}

impl LoopbackSink {
    fn sender(&self) -> Result<&mpsc::UnboundedSender<Bytes>, ConnectionError> {
        match &self.outbound {
            Some(sender) if sender.is_closed() => Err(peer_hung_up()),
            Some(sender) => Ok(sender),
            None => Err(ConnectionError::Closed),
        }
    }
}

impl Sink<Bytes> for LoopbackSink {
    type Error = ConnectionError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(self.sender().map(|_| ()))
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        self.sender()?.send(item).map_err(|_| peer_hung_up())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.outbound = None;
        Poll::Ready(Ok(()))
    }
}

fn peer_hung_up() -> ConnectionError {
    ConnectionError::Transport("loopback peer hung up".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_carries_messages_both_ways() {
        let (connection, mut peer) = loopback();

        peer.send("ping").expect("peer send");
        assert_eq!(connection.read().await, Ok(Bytes::from_static(b"ping")));

        connection
            .write(Bytes::from_static(b"pong"))
            .await
            .expect("connection write");
        assert_eq!(peer.recv().await, Some(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn peer_observes_close_as_end_of_stream() {
        let (connection, mut peer) = loopback();
        connection.close().await.expect("close");
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn dropped_peer_fails_writes_and_ends_reads() {
        let (connection, peer) = loopback();
        drop(peer);

        assert_eq!(connection.read().await, Err(ConnectionError::Closed));
        assert_eq!(
            connection.write(Bytes::from_static(b"lost")).await,
            Err(peer_hung_up())
        );
    }

    #[test]
    fn outbound_frames_keep_text_as_text() {
        assert_eq!(
            ws_frame(Bytes::from_static(b"[alice] hi")),
            WsMessage::Text("[alice] hi".to_string())
        );
        assert_eq!(
            ws_frame(Bytes::from_static(&[0xff, 0x00])),
            WsMessage::Binary(vec![0xff, 0x00])
        );
    }
}
