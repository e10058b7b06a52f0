//! WebSocket handler for gadget event streaming
//!
//! Clients connect to `/api/ws`, subscribe to topics (`*`, `gadget.*`,
//! `gadget.lock_changed`, ...) and then receive matching events. The first
//! subscription is answered with a `gadget.status` snapshot.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::SystemEvent;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Client-to-server message
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { topics: Vec<String> },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topics: Vec<String> },

    #[serde(rename = "ping")]
    Ping,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.events.subscribe();
    let mut shutdown_rx = state.shutdown_signal();

    // Nothing is sent until the client subscribes
    let mut subscribed_topics: Vec<String> = vec![];
    let mut snapshot_sent = false;

    info!("WebSocket client connected");

    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_client_message(&text, &mut subscribed_topics) {
                            warn!("Failed to handle client message: {}", e);
                        }

                        if !snapshot_sent && !subscribed_topics.is_empty() {
                            let snapshot = SystemEvent::Status {
                                status: state.controller.status(),
                            };
                            if let Ok(json) = serde_json::to_string(&snapshot) {
                                if sender.send(Message::Text(json)).await.is_err() {
                                    warn!("Failed to send status snapshot to client");
                                    break;
                                }
                            }
                            snapshot_sent = true;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            event = event_rx.recv() => {
                match event {
                    Ok(event) => {
                        if should_send_event(&event, &subscribed_topics) {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if sender.send(Message::Text(json)).await.is_err() {
                                    warn!("Failed to send event to client, disconnecting");
                                    break;
                                }
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("WebSocket client lagged by {} events", n);
                        let error_event = SystemEvent::Error {
                            message: format!("Lagged by {} events", n),
                        };
                        if let Ok(json) = serde_json::to_string(&error_event) {
                            let _ = sender.send(Message::Text(json)).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Event bus closed");
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                debug!("Closing WebSocket for shutdown");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!("Failed to send ping, disconnecting");
                    break;
                }
            }
        }
    }

    info!("WebSocket handler exiting");
}

fn handle_client_message(text: &str, topics: &mut Vec<String>) -> Result<(), serde_json::Error> {
    match serde_json::from_str(text)? {
        ClientMessage::Subscribe { topics: new_topics } => {
            info!("Client subscribed to topics: {:?}", new_topics);
            *topics = new_topics;
        }
        ClientMessage::Unsubscribe {
            topics: remove_topics,
        } => {
            topics.retain(|t| !remove_topics.contains(t));
            info!("Client unsubscribed from topics: {:?}", remove_topics);
        }
        ClientMessage::Ping => {
            debug!("Received ping from client");
        }
    }

    Ok(())
}

fn should_send_event(event: &SystemEvent, topics: &[String]) -> bool {
    topics.iter().any(|topic| event.matches_topic(topic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::Mode;

    fn mode_changed() -> SystemEvent {
        SystemEvent::ActiveModeChanged {
            mode: Mode::EthernetP2p,
        }
    }

    #[test]
    fn test_should_send_event() {
        let event = mode_changed();
        assert!(should_send_event(&event, &["*".to_string()]));
        assert!(should_send_event(&event, &["gadget.*".to_string()]));
        assert!(should_send_event(
            &event,
            &["gadget.active_mode_changed".to_string()]
        ));
        assert!(!should_send_event(
            &event,
            &["gadget.lock_changed".to_string()]
        ));
        assert!(!should_send_event(&event, &[]));
    }

    #[test]
    fn test_client_messages() {
        let mut topics = vec![];
        handle_client_message(
            r#"{"type":"subscribe","payload":{"topics":["gadget.*","error"]}}"#,
            &mut topics,
        )
        .unwrap();
        assert_eq!(topics, vec!["gadget.*", "error"]);

        handle_client_message(
            r#"{"type":"unsubscribe","payload":{"topics":["error"]}}"#,
            &mut topics,
        )
        .unwrap();
        assert_eq!(topics, vec!["gadget.*"]);

        handle_client_message(r#"{"type":"ping"}"#, &mut topics).unwrap();
        assert!(handle_client_message("not json", &mut topics).is_err());
    }
}
