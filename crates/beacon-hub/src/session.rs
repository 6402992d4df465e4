//! Session pumps: one read loop and one write loop per live connection.
//!
//! The write pump drains the bounded outbound queue onto the wire and
//! injects transport-level liveness pings; the read pump enforces an
//! idle deadline and handles client control frames. Either pump exiting
//! tears the whole session down; teardown is final, and a reconnecting
//! client is a brand-new session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::{Hub, SessionHandle};
use crate::envelope::{Address, ControlFrame, Envelope, SessionId};

/// Drive a WebSocket connection for `address` until it disconnects,
/// exceeds the idle deadline, or is displaced by a newer registration.
///
/// This is the handshake boundary: the HTTP layer validates the address,
/// upgrades the connection, and hands the raw socket here.
#[instrument(skip_all, fields(address = %address))]
pub async fn run_session(ws: WebSocket, address: Address, hub: Hub) {
    let config = hub.config().clone();
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Arc<String>>(config.outbound_capacity);
    let cancel = CancellationToken::new();
    let session_id = SessionId::new();

    hub.register(SessionHandle {
        id: session_id.clone(),
        address: address.clone(),
        outbound: outbound_tx.clone(),
        cancel: cancel.clone(),
    })
    .await;

    // Write pump: queue drain interleaved with liveness pings. The
    // cancellation token is the teardown signal shared with the
    // dispatcher's eviction path.
    let writer_cancel = cancel.clone();
    let ping_interval = config.ping_interval;
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        let _ = ping.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                () = writer_cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read pump. Any inbound frame, Pong replies to our pings
    // included, refreshes the idle deadline; a half-open peer is
    // reclaimed within one deadline window.
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = tokio::time::timeout(config.idle_timeout, ws_rx.next()) => frame,
        };
        match frame {
            Err(_) => {
                info!("idle deadline exceeded, reclaiming connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => handle_control_frame(text.as_str(), &outbound_tx),
            Ok(Some(Ok(Message::Close(_)))) => {
                debug!("client sent close frame");
                break;
            }
            // Activity only; axum answers Ping frames itself.
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)))) => {}
        }
    }

    cancel.cancel();
    let _ = writer.await;
    hub.unregister(address, session_id).await;
}

/// Decode and apply one inbound control frame.
fn handle_control_frame(text: &str, outbound: &mpsc::Sender<Arc<String>>) {
    let frame: ControlFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            // Malformed input is ignored, not rejected.
            debug!(error = %e, "ignoring unparseable frame");
            return;
        }
    };

    match frame.kind.as_str() {
        "ping" => {
            // Pong delivery is best-effort: a saturated queue drops it
            // rather than blocking the read pump.
            match serde_json::to_string(&Envelope::pong()) {
                Ok(json) => {
                    if outbound.try_send(Arc::new(json)).is_err() {
                        counter!("ws_dropped_messages_total").increment(1);
                        debug!("outbound queue full, dropping pong");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize pong"),
            }
        }
        // Reserved for event filtering; accepted but currently inert.
        "subscribe" => info!("subscribe requested"),
        other => debug!(kind = other, "ignoring unknown control frame"),
    }
}
