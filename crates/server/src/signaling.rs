use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use castgate_protocol::{AgentMessage, CasterRequest, ViewerMessage, ViewerRequest};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::{Broker, Outcome, Requester, ViewerContext};
use crate::caster::{CasterRegistration, CasterService};
use crate::hub::{ConnectionHub, Outbound};

/// How long a caster has to send its `register` message.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Write one hub event to the socket. Returns false when the loop should end.
async fn deliver(socket: &mut WebSocket, connection_id: Uuid, msg: Outbound) -> bool {
    match msg.to_json() {
        Ok(json) => {
            if socket.send(Message::Text(json.into())).await.is_err() {
                tracing::debug!(%connection_id, "WebSocket send failed");
                return false;
            }
            true
        }
        Err(e) => {
            tracing::error!("Failed to serialize outbound message: {e}");
            true
        }
    }
}

async fn send_direct(socket: &mut WebSocket, msg: impl Into<Outbound>) -> bool {
    match msg.into().to_json() {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

/// Write the broker's replies, then close the socket if it asked to.
/// Returns false when the loop should end.
async fn apply_outcome(socket: &mut WebSocket, connection_id: Uuid, outcome: Outcome) -> bool {
    for reply in outcome.replies {
        if !send_direct(socket, reply).await {
            return false;
        }
    }
    let ControlFlow::Break(reason) = outcome.flow else {
        return true;
    };
    tracing::info!(%connection_id, %reason, "Closing connection");
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
    false
}

/// Handle a WebSocket connection from a **viewer**.
///
/// Inbound messages drive the broker, whose replies are written here
/// directly. The hub queue carries what other connections address to this
/// viewer. Cleanup runs however the loop ends.
pub async fn handle_viewer_ws(
    mut socket: WebSocket,
    broker: Arc<Broker>,
    hub: Arc<ConnectionHub>,
    requester: Requester,
) {
    let (connection_id, mut outbound) = hub.register();
    let mut ctx = ViewerContext::new(connection_id, requester);

    tracing::info!(
        %connection_id,
        authenticated = ctx.requester().is_authenticated(),
        remote_addr = ?ctx.requester().remote_addr,
        "Viewer WebSocket connected"
    );

    if send_direct(&mut socket, ViewerMessage::Connected { connection_id }).await {
        viewer_loop(&mut socket, &broker, &mut ctx, &mut outbound).await;
    }

    broker.disconnect(&mut ctx).await;
    hub.unregister(connection_id);
    tracing::info!(%connection_id, "Viewer WebSocket disconnected");
}

async fn viewer_loop(
    socket: &mut WebSocket,
    broker: &Broker,
    ctx: &mut ViewerContext,
    outbound: &mut mpsc::Receiver<Outbound>,
) {
    let connection_id = ctx.connection_id();
    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if !deliver(socket, connection_id, msg).await {
                    break;
                }
            }
            Some(result) = socket.recv() => {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ViewerRequest>(&text) {
                            Ok(request) => {
                                tracing::debug!(%connection_id, ?request, "Viewer -> broker");
                                let outcome = broker.handle(ctx, request).await;
                                if !apply_outcome(socket, connection_id, outcome).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(%connection_id, "Invalid viewer message: {e}");
                                let err = ViewerMessage::Error {
                                    message: format!("Invalid message format: {e}"),
                                };
                                if !send_direct(socket, err).await {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!(%connection_id, "Viewer WebSocket closed");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%connection_id, "Viewer WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            else => break,
        }
    }
}

/// Wait for the caster's `register` message.
async fn await_registration(socket: &mut WebSocket) -> Option<CasterRegistration> {
    let wait = async {
        while let Some(result) = socket.recv().await {
            match result {
                Ok(Message::Text(text)) => {
                    return match serde_json::from_str::<CasterRequest>(&text) {
                        Ok(CasterRequest::Register {
                            device_id,
                            machine_name,
                            service_id,
                        }) if !device_id.trim().is_empty() => Some(CasterRegistration {
                            device_id,
                            machine_name,
                            service_id,
                        }),
                        Ok(other) => {
                            tracing::warn!(?other, "Caster sent a message before registering");
                            None
                        }
                        Err(e) => {
                            tracing::warn!("Invalid caster registration: {e}");
                            None
                        }
                    };
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                _ => {}
            }
        }
        None
    };
    match tokio::time::timeout(REGISTER_TIMEOUT, wait).await {
        Ok(registration) => registration,
        Err(_) => {
            tracing::warn!("Caster did not register in time");
            None
        }
    }
}

/// Handle a WebSocket connection from a **caster** (the screen-sharing
/// process on a device).
pub async fn handle_caster_ws(
    mut socket: WebSocket,
    casters: Arc<CasterService>,
    hub: Arc<ConnectionHub>,
) {
    let Some(registration) = await_registration(&mut socket).await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (caster_id, mut outbound) = hub.register();
    let session = casters.register(caster_id, registration).await;

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                if !deliver(&mut socket, caster_id, msg).await {
                    break;
                }
            }
            Some(result) = socket.recv() => {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<CasterRequest>(&text) {
                            Ok(request) => {
                                tracing::debug!(%caster_id, ?request, "Caster -> broker");
                                casters.handle(caster_id, &session, request).await;
                            }
                            Err(e) => {
                                tracing::warn!(%caster_id, "Invalid caster message: {e}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!(%caster_id, "Caster WebSocket closed");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%caster_id, "Caster WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            else => break,
        }
    }

    casters.disconnect(caster_id).await;
    hub.unregister(caster_id);
}

/// Handle a WebSocket connection from a device's **service agent**. Its
/// connection id is the `service_id` casters on that device register with.
pub async fn handle_agent_ws(mut socket: WebSocket, hub: Arc<ConnectionHub>) {
    let (service_id, mut outbound) = hub.register();
    tracing::info!(%service_id, "Agent WebSocket connected");

    if send_direct(&mut socket, AgentMessage::Registered { service_id }).await {
        loop {
            tokio::select! {
                msg = outbound.recv() => {
                    let Some(msg) = msg else { break };
                    if !deliver(&mut socket, service_id, msg).await {
                        break;
                    }
                }
                Some(result) = socket.recv() => {
                    match result {
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(Message::Text(text)) => {
                            tracing::debug!(%service_id, len = text.len(), "Ignoring agent message");
                        }
                        _ => {}
                    }
                }
                else => break,
            }
        }
    }

    hub.unregister(service_id);
    tracing::info!(%service_id, "Agent WebSocket disconnected");
}
