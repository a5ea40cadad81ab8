//! SessionController over a real WebSocket against a local tokio-tungstenite
//! server.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use conclave_session::protocol::{CreatedPayload, TextPayload};
use conclave_session::{
    AuthSnapshot, ClientMessage, ConnectionManager, ConnectionState, ControllerEvent,
    ConversationId, MemoryConversationStore, ModelSelection, ReconnectPolicy, Role, ServerMessage,
    SessionConfig, SessionController, SessionError, WsConnector,
};

const WAIT: Duration = Duration::from_secs(10);

/// Minimal chat server: accepts `good-token`, answers the first message of a
/// new conversation with two tokens, the id announcement and a final frame.
async fn spawn_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let WsMessage::Text(text) = msg else { continue };
                    let Ok(client) = serde_json::from_str::<ClientMessage>(text.as_str()) else {
                        continue;
                    };
                    let replies = match client {
                        ClientMessage::Authenticate { token } if token == "good-token" => {
                            vec![ServerMessage::AuthOk {
                                connection_id: Some("e2e".to_string()),
                            }]
                        }
                        ClientMessage::Authenticate { .. } => vec![ServerMessage::AuthRejected {
                            reason: "invalid token".to_string(),
                        }],
                        ClientMessage::SendMessage {
                            client_request_id: Some(request_id),
                            ..
                        } => {
                            let id = ConversationId::new("srv-1");
                            let text = |t: &str| TextPayload {
                                text: t.to_string(),
                                model: None,
                            };
                            vec![
                                ServerMessage::Token {
                                    session_id: None,
                                    sequence: 1,
                                    payload: text("Hel"),
                                },
                                ServerMessage::Token {
                                    session_id: None,
                                    sequence: 2,
                                    payload: text("lo"),
                                },
                                ServerMessage::SessionCreated {
                                    session_id: None,
                                    sequence: 3,
                                    payload: CreatedPayload {
                                        session_id: id.clone(),
                                        client_request_id: request_id,
                                    },
                                },
                                ServerMessage::Final {
                                    session_id: Some(id),
                                    sequence: 4,
                                    payload: text(""),
                                },
                            ]
                        }
                        _ => Vec::new(),
                    };
                    for reply in replies {
                        let json = serde_json::to_string(&reply).unwrap();
                        if ws.send(WsMessage::Text(json.into())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    format!("ws://{}/ws", addr)
}

fn controller(url: String) -> Arc<SessionController<WsConnector, MemoryConversationStore>> {
    let connection = Arc::new(ConnectionManager::new(
        WsConnector::new(url),
        ReconnectPolicy {
            max_retries: 2,
            ..Default::default()
        },
    ));
    Arc::new(SessionController::new(
        connection,
        Arc::new(MemoryConversationStore::new()),
        SessionConfig::default(),
    ))
}

#[tokio::test]
async fn new_conversation_over_websocket() {
    let url = spawn_server().await;
    let controller = controller(url);
    let cancel = CancellationToken::new();
    {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel).await });
    }
    let mut events = controller.events();

    controller
        .on_auth_changed(AuthSnapshot::signed_in("good-token"))
        .await
        .unwrap();
    assert_eq!(controller.connection_state(), ConnectionState::Authenticated);

    controller
        .send_message("hi", &ModelSelection::single("m1"))
        .await
        .unwrap();

    // wait until the final frame has been applied to the bound conversation
    let id = ConversationId::new("srv-1");
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(ControllerEvent::LogUpdated {
                session_id: Some(s),
            }) = events.recv().await
            {
                if s == id && controller.log_for(&id).await.and_then(|l| l.last_seq()) == Some(4) {
                    break;
                }
            }
        }
    })
    .await
    .unwrap();

    let transcript = controller.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[1].text, "Hello");
    assert!(!transcript[1].partial);

    cancel.cancel();
    controller.connection().disconnect().await;
}

#[tokio::test]
async fn rejected_token_over_websocket() {
    let url = spawn_server().await;
    let controller = controller(url);

    let err = controller
        .on_auth_changed(AuthSnapshot::signed_in("bad-token"))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AuthRejected { ref reason } if reason == "invalid token"));
    assert!(!err.is_recoverable());
    assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
}
