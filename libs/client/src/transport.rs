//! Opening a gateway session: handshake, then a pump task bridging the
//! socket to a pair of channels.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parley_common::protocol::{Handshake, ReadyPayload, CLOSE_AUTH_FAILED};
use parley_common::{ClientEvent, ServerEvent};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::error::ConnectError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An established session. Dropping `commands` closes the transport.
pub struct Session {
    pub ready: ReadyPayload,
    pub events: mpsc::Receiver<ServerEvent>,
    pub commands: mpsc::Sender<ClientEvent>,
}

/// Opens sessions. One call is one handshake attempt; retry policy lives in
/// the connection manager.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Session, ConnectError>;
}

pub struct WsConnector {
    url: String,
    handshake_timeout: Duration,
    queue_capacity: usize,
}

impl WsConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            url: config.gateway_url.clone(),
            handshake_timeout: config.handshake_timeout,
            queue_capacity: config.event_queue_capacity.max(1),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &str) -> Result<Session, ConnectError> {
        let (ws, ready) = time::timeout(self.handshake_timeout, handshake(&self.url, token))
            .await
            .map_err(|_| ConnectError::Timeout)??;

        let (events_tx, events) = mpsc::channel(self.queue_capacity);
        let (commands, commands_rx) = mpsc::channel(self.queue_capacity);
        tokio::spawn(pump(ws, events_tx, commands_rx));

        Ok(Session {
            ready,
            events,
            commands,
        })
    }
}

fn transport(err: impl std::fmt::Display) -> ConnectError {
    ConnectError::Transport(err.to_string())
}

/// Send the handshake and wait for `ready` (or the server's close frame).
async fn handshake(url: &str, token: &str) -> Result<(WsStream, ReadyPayload), ConnectError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.map_err(transport)?;

    let frame = serde_json::to_string(&Handshake {
        auth_token: Some(token.to_string()),
    })
    .map_err(|e| ConnectError::Protocol(e.to_string()))?;
    ws.send(Message::Text(frame.into())).await.map_err(transport)?;

    while let Some(msg) = ws.next().await {
        match msg.map_err(transport)? {
            Message::Text(text) => {
                return match serde_json::from_str::<ServerEvent>(text.as_str()) {
                    Ok(ServerEvent::Ready(ready)) => Ok((ws, ready)),
                    Ok(other) => Err(ConnectError::Protocol(format!(
                        "expected ready, got {}",
                        other.name()
                    ))),
                    Err(e) => Err(ConnectError::Protocol(e.to_string())),
                };
            }
            Message::Close(Some(frame)) => {
                let code = u16::from(frame.code);
                let reason = frame.reason.as_str().to_string();
                return Err(if code == CLOSE_AUTH_FAILED {
                    ConnectError::Rejected(reason)
                } else {
                    ConnectError::Closed { code, reason }
                });
            }
            Message::Close(None) => break,
            _ => continue,
        }
    }
    Err(transport("connection closed before ready"))
}

/// Forward frames until either side goes away.
async fn pump(
    ws: WsStream,
    events_tx: mpsc::Sender<ServerEvent>,
    mut commands_rx: mpsc::Receiver<ClientEvent>,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => {
                            if events_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => tracing::warn!(%err, "dropping undecodable server event"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "server closed the connection");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    tracing::debug!(%err, "gateway read error");
                    break;
                }
                None => break,
            },

            command = commands_rx.recv() => match command {
                Some(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(%err, "failed to encode client event"),
                },
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use parley_common::protocol::{PresenceEntry, RoomSet};
    use parley_common::PresenceStatus;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    use super::*;

    enum Reply {
        Ready,
        Close(u16, &'static str),
        Nothing,
    }

    /// Accept one gateway connection, read the handshake, then act on `reply`.
    /// Resolves to the handshake token and the next client frame, if any.
    async fn fake_gateway(reply: Reply) -> (SocketAddr, tokio::task::JoinHandle<(String, Option<String>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let first = ws.next().await.unwrap().unwrap().into_text().unwrap();
            let handshake: Handshake = serde_json::from_str(first.as_str()).unwrap();
            let token = handshake.auth_token.unwrap_or_default();

            match reply {
                Reply::Ready => {
                    let ready = ServerEvent::Ready(ReadyPayload {
                        user_id: "u1".into(),
                        connection_id: "conn_1".into(),
                        presences: vec![PresenceEntry {
                            user_id: "u1".into(),
                            status: PresenceStatus::Online,
                        }],
                    });
                    let text = serde_json::to_string(&ready).unwrap();
                    ws.send(Message::Text(text.into())).await.unwrap();
                    let online = serde_json::to_string(&ServerEvent::UserOnline {
                        user_id: "u2".into(),
                    })
                    .unwrap();
                    ws.send(Message::Text(online.into())).await.unwrap();
                    let next = loop {
                        match ws.next().await {
                            Some(Ok(Message::Text(text))) => break Some(text.as_str().to_string()),
                            Some(Ok(_)) => continue,
                            _ => break None,
                        }
                    };
                    (token, next)
                }
                Reply::Close(code, reason) => {
                    ws.close(Some(CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    }))
                    .await
                    .unwrap();
                    (token, None)
                }
                Reply::Nothing => {
                    time::sleep(Duration::from_secs(5)).await;
                    (token, None)
                }
            }
        });
        (addr, handle)
    }

    fn connector(addr: SocketAddr, timeout: Duration) -> WsConnector {
        WsConnector::new(&ClientConfig {
            handshake_timeout: timeout,
            ..ClientConfig::with_url(format!("ws://{addr}/gateway"))
        })
    }

    #[tokio::test]
    async fn successful_handshake_yields_ready_and_event_stream() {
        let (addr, server) = fake_gateway(Reply::Ready).await;
        let mut session = connector(addr, Duration::from_secs(5))
            .connect("tok_1")
            .await
            .unwrap();

        assert_eq!(session.ready.connection_id, "conn_1");
        assert_eq!(
            session.events.recv().await,
            Some(ServerEvent::UserOnline {
                user_id: "u2".into()
            })
        );

        let join = ClientEvent::JoinRooms(RoomSet {
            channels: vec![],
            dms: vec!["42".into()],
        });
        session.commands.send(join.clone()).await.unwrap();

        let (token, next) = server.await.unwrap();
        assert_eq!(token, "tok_1");
        assert_eq!(ClientEvent::decode(&next.unwrap()).unwrap(), join);
    }

    #[tokio::test]
    async fn rejection_surfaces_the_reason() {
        let (addr, _server) = fake_gateway(Reply::Close(4004, "invalid-token")).await;
        let err = connector(addr, Duration::from_secs(5))
            .connect("tok_bad")
            .await
            .err()
            .unwrap();
        assert_eq!(err, ConnectError::Rejected("invalid-token".into()));
    }

    #[tokio::test]
    async fn other_close_codes_are_not_auth_failures() {
        let (addr, _server) = fake_gateway(Reply::Close(4009, "handshake-timeout")).await;
        let err = connector(addr, Duration::from_secs(5))
            .connect("tok")
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            ConnectError::Closed {
                code: 4009,
                reason: "handshake-timeout".into()
            }
        );
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (addr, _server) = fake_gateway(Reply::Nothing).await;
        let err = connector(addr, Duration::from_millis(200))
            .connect("tok")
            .await
            .err()
            .unwrap();
        assert_eq!(err, ConnectError::Timeout);
    }
}
