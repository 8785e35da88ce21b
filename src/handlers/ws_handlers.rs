//! WebSocket endpoint feeding bucket listings to browsers.
//!
//! Each connection runs two pumps. The write pump drains the client's hub
//! queue to the socket and keeps the peer alive with pings; the read pump
//! discards whatever the peer sends and enforces the read deadline. They
//! share a `done` token: whichever stops first stops the other, and the
//! client is then unregistered from the hub.

use crate::{
    services::hub::HubMessage,
    state::{AppState, PushTiming},
};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use bytes::Bytes;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::time::Duration;
use tokio::{
    sync::mpsc,
    time::{Instant, interval_at, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// GET `/api/ws`: upgrade and register a push client.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_push_client(socket, state))
}

async fn serve_push_client(socket: WebSocket, state: AppState) {
    let client = match state.hub.register() {
        Ok(client) => client,
        Err(err) => {
            warn!("rejecting push client: {}", err);
            return;
        }
    };
    let id = client.id;
    debug!("push client {} connected", id);

    let (sink, stream) = socket.split();
    let done = state.shutdown.child_token();
    let writer = tokio::spawn(write_pump(sink, client.queue, state.push, done.clone()));
    read_pump(stream, state.push.pong_wait, done.clone()).await;
    if let Err(err) = writer.await {
        warn!("write pump for push client {} panicked: {}", id, err);
    }

    state.hub.unregister(id);
    debug!("push client {} disconnected", id);
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<HubMessage>,
    timing: PushTiming,
    done: CancellationToken,
) {
    let mut ping = interval_at(Instant::now() + timing.ping_period, timing.ping_period);
    loop {
        let message = tokio::select! {
            _ = done.cancelled() => break,
            next = queue.recv() => match next {
                Some(listing) => Message::Text(listing.as_ref().into()),
                // Closed by the hub: unregistered or evicted.
                None => {
                    let _ = timeout(timing.write_wait, sink.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(timing.write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!("push write failed: {}", err);
                break;
            }
            Err(_) => {
                debug!("push write timed out after {:?}", timing.write_wait);
                break;
            }
        }
    }
    done.cancel();
}

async fn read_pump(mut stream: SplitStream<WebSocket>, pong_wait: Duration, done: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = done.cancelled() => break,
            frame = timeout(pong_wait, stream.next()) => frame,
        };
        match frame {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(err))) => {
                debug!("push read failed: {}", err);
                break;
            }
            Err(_) => {
                debug!("no frame from push client within {:?}", pong_wait);
                break;
            }
        }
    }
    done.cancel();
}
