//! One WebSocket client: request frames in, response and event frames out.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{Message, WebSocket},
    clawgate_protocol::{ErrorShape, RequestFrame, ResponseFrame, error_codes},
    futures::{SinkExt, StreamExt},
    tokio::sync::{broadcast::error::RecvError, mpsc},
    tracing::{debug, info, warn},
};

use crate::{
    methods::{MethodContext, MethodRegistry},
    state::GatewayState,
};

pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    remote: SocketAddr,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let clients = state.client_connected();
    info!(conn_id = %conn_id, remote = %remote, clients, "ws client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut events = state.events.subscribe();

    // Responses and bus events share one writer.
    let send_conn = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                out = rx.recv() => match out {
                    Some(text) => text,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(frame) => match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(conn_id = %send_conn, error = %e, "event frame not serializable");
                            continue;
                        },
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(conn_id = %send_conn, skipped, "ws client fell behind the event bus");
                        continue;
                    },
                    Err(RecvError::Closed) => break,
                },
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                debug!(conn_id = %send_conn, "ws send failed");
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let recv_state = Arc::clone(&state);
    let recv_conn = conn_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let frame = match serde_json::from_str::<RequestFrame>(text.as_str()) {
                        Ok(frame) if frame.frame_type == "req" => frame,
                        Ok(frame) => {
                            reply(&tx, &ResponseFrame::err(
                                &frame.id,
                                ErrorShape::new(
                                    error_codes::INVALID_REQUEST,
                                    format!("unexpected frame type: {}", frame.frame_type),
                                ),
                            ));
                            continue;
                        },
                        Err(e) => {
                            let preview: String = text.as_str().chars().take(200).collect();
                            warn!(conn_id = %recv_conn, error = %e, raw = %preview, "invalid request frame");
                            reply(&tx, &ResponseFrame::err(
                                "",
                                ErrorShape::new(
                                    error_codes::INVALID_REQUEST,
                                    format!("invalid frame: {e}"),
                                ),
                            ));
                            continue;
                        },
                    };

                    // Requests run concurrently; responses carry their id.
                    let ctx = MethodContext {
                        request_id: frame.id,
                        method: frame.method,
                        params: frame.params,
                        client_conn_id: recv_conn.clone(),
                        state: Arc::clone(&recv_state),
                    };
                    let methods = Arc::clone(&methods);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let response = methods.dispatch(ctx).await;
                        reply(&tx, &response);
                    });
                },
                Message::Close(_) => break,
                _ => {},
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        () = state.shutdown.cancelled() => {
            recv_task.abort();
            send_task.abort();
        },
    }

    state.client_disconnected();
    info!(conn_id = %conn_id, remote = %remote, "ws client disconnected");
}

fn reply(tx: &mpsc::UnboundedSender<String>, frame: &ResponseFrame) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = tx.send(text);
        },
        Err(e) => warn!(error = %e, "response frame not serializable"),
    }
}
