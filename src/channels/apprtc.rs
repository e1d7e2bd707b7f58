//! Signal channel over the public AppRTC WebSocket relay.
//!
//! Each operation opens its own connection, registers into a room named
//! by the mailbox address (sender as `"send"`, receiver as `"recv"`),
//! and exchanges one message. The relay reports problems in-band via a
//! non-empty `error` field, which surfaces as a transport error.

use async_trait::async_trait;
use async_tungstenite::tokio::{connect_async, ConnectStream};
use async_tungstenite::tungstenite::client::IntoClientRequest;
use async_tungstenite::tungstenite::http::HeaderValue;
use async_tungstenite::tungstenite::Message;
use async_tungstenite::WebSocketStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::SignalChannel;
use crate::error::{Error, Result};

const APPRTC_URL: &str = "wss://apprtc-ws.webrtc.org/ws";
const APPRTC_ORIGIN: &str = "https://appr.tc";

#[derive(Debug, Serialize)]
struct Register<'a> {
    cmd: &'a str,
    roomid: &'a str,
    clientid: &'a str,
}

#[derive(Debug, Serialize)]
struct Send<'a> {
    cmd: &'a str,
    msg: &'a str,
}

#[derive(Debug, Deserialize)]
struct Packet {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    error: String,
}

/// Signal channel using apprtc as the rendezvous service.
pub struct AppRtcChannel;

impl AppRtcChannel {
    pub fn new() -> Self {
        AppRtcChannel
    }

    async fn connect(&self, room: &str, client: &str) -> Result<WebSocketStream<ConnectStream>> {
        tracing::debug!(room, client, "apprtc connect");
        let mut request = APPRTC_URL
            .into_client_request()
            .map_err(|e| Error::Transport(e.to_string()))?;
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static(APPRTC_ORIGIN));

        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| Error::Transport(format!("error connecting to apprtc: {e}")))?;

        let register = serde_json::to_string(&Register {
            cmd: "register",
            roomid: room,
            clientid: client,
        })
        .map_err(|e| Error::Transport(e.to_string()))?;
        ws.send(Message::Text(register.into()))
            .await
            .map_err(|e| Error::Transport(format!("error registering client: {e}")))?;

        Ok(ws)
    }
}

impl Default for AppRtcChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalChannel for AppRtcChannel {
    async fn send(&self, addr: &str, data: &str) -> Result<()> {
        let mut ws = self.connect(addr, "send").await?;
        let payload = serde_json::to_string(&Send {
            cmd: "send",
            msg: data,
        })
        .map_err(|e| Error::Transport(e.to_string()))?;
        ws.send(Message::Text(payload.into()))
            .await
            .map_err(|e| Error::Transport(format!("error sending over websocket: {e}")))?;
        ws.close(None).await.ok();
        Ok(())
    }

    async fn recv(&self, addr: &str) -> Result<String> {
        let mut ws = self.connect(addr, "recv").await?;
        loop {
            let frame = ws
                .next()
                .await
                .ok_or_else(|| Error::Transport("apprtc connection closed".to_string()))?
                .map_err(|e| Error::Transport(format!("error receiving packet: {e}")))?;
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(Error::Transport("apprtc connection closed".to_string()))
                }
                _ => continue,
            };
            let text = text.to_string();
            let packet: Packet = serde_json::from_str(&text)
                .map_err(|e| Error::Transport(format!("invalid apprtc packet: {e}")))?;
            if !packet.error.is_empty() {
                return Err(Error::Transport(format!(
                    "apprtc returned an error: {}",
                    packet.error
                )));
            }
            ws.close(None).await.ok();
            return Ok(packet.msg);
        }
    }
}
