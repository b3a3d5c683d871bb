use crate::authz::Authorizer;
use crate::components::parse_custom_id;
use crate::error::DiscordError;
use crate::event::{
    intents, opcode, GatewayPayload, Hello, Interaction, MessageCreate,
    INTERACTION_MESSAGE_COMPONENT,
};
use crate::rest::DiscordRest;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use url::Url;
use warden_core::config::DiscordConfig;
use warden_core::{ButtonInteraction, InboundMessage, PlatformEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_BACKOFF_SECS: u64 = 60;
/// Close codes after which reconnecting cannot help (bad token, bad intents...).
const FATAL_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

enum ConnectionEnd {
    Reconnect,
    Fatal(String),
}

pub struct GatewayClient {
    url: Url,
    token: String,
    guild_id: String,
    authorizer: Arc<Authorizer>,
    rest: Arc<DiscordRest>,
}

impl GatewayClient {
    pub fn new(config: &DiscordConfig, authorizer: Authorizer, rest: Arc<DiscordRest>) -> Result<Self> {
        let url = Url::parse(&config.gateway_url).context("Invalid Discord gateway URL")?;
        Ok(Self {
            url,
            token: config.token.clone(),
            guild_id: config.guild_id.clone(),
            authorizer: Arc::new(authorizer),
            rest,
        })
    }

    /// Connect in the background and stream normalized events.
    pub fn spawn(self) -> mpsc::Receiver<PlatformEvent> {
        let (tx, rx) = mpsc::channel::<PlatformEvent>(64);
        tokio::spawn(async move { self.run(tx).await });
        rx
    }

    async fn run(self, tx: mpsc::Sender<PlatformEvent>) {
        let mut retry_count: u32 = 0;
        loop {
            tracing::info!("Connecting to Discord gateway at {}...", self.url);
            match connect_async(&self.url).await {
                Ok((ws_stream, _)) => {
                    tracing::info!("Connected to Discord gateway");
                    retry_count = 0;
                    match self.handle_connection(ws_stream, &tx).await {
                        Ok(ConnectionEnd::Reconnect) => tracing::warn!("Gateway asked us to reconnect"),
                        Ok(ConnectionEnd::Fatal(reason)) => {
                            tracing::error!("Gateway closed the session for good: {}", reason);
                            return;
                        }
                        Err(e) => tracing::error!("Gateway connection error: {}", e),
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to connect to Discord gateway: {}", e);
                }
            }
            if tx.is_closed() {
                tracing::info!("Event receiver dropped, stopping gateway");
                return;
            }
            let wait_secs = MAX_BACKOFF_SECS.min(2u64.pow(retry_count));
            tracing::info!("Reconnecting in {}s", wait_secs);
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
            if retry_count < 6 {
                retry_count += 1;
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: WsStream,
        tx: &mpsc::Sender<PlatformEvent>,
    ) -> Result<ConnectionEnd, DiscordError> {
        let (mut write, mut read) = stream.split();

        // The first frame is always HELLO.
        let hello = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let payload: GatewayPayload = decode(&text)?;
                    if payload.op == opcode::HELLO {
                        let hello: Hello = serde_json::from_value(payload.d.unwrap_or_default())
                            .map_err(|e| DiscordError::Decode(e.to_string()))?;
                        break hello;
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(DiscordError::Gateway(e.to_string())),
                None => return Ok(ConnectionEnd::Reconnect),
            }
        };

        let identify = GatewayPayload::identify(
            &self.token,
            intents::GUILDS | intents::GUILD_MEMBERS | intents::GUILD_MESSAGES | intents::MESSAGE_CONTENT,
        );
        write
            .send(Message::Text(encode(&identify)?))
            .await
            .map_err(|e| DiscordError::Gateway(e.to_string()))?;

        let period = Duration::from_millis(hello.heartbeat_interval.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut seq: Option<u64> = None;
        let mut awaiting_ack = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        tracing::warn!("No heartbeat ACK since the last beat, connection looks dead");
                        return Ok(ConnectionEnd::Reconnect);
                    }
                    write
                        .send(Message::Text(encode(&GatewayPayload::heartbeat(seq))?))
                        .await
                        .map_err(|e| DiscordError::Gateway(e.to_string()))?;
                    awaiting_ack = true;
                }

                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(close))) => {
                            let code = close.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                            let reason = close.map(|f| f.reason.to_string()).unwrap_or_default();
                            if FATAL_CLOSE_CODES.contains(&code) {
                                return Ok(ConnectionEnd::Fatal(format!("{} {}", code, reason)));
                            }
                            tracing::warn!("Gateway closed: {} {}", code, reason);
                            return Ok(ConnectionEnd::Reconnect);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(DiscordError::Gateway(e.to_string())),
                        None => return Ok(ConnectionEnd::Reconnect),
                    };

                    let payload: GatewayPayload = match decode(&text) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::debug!("Ignored unparseable gateway frame: {}", e);
                            continue;
                        }
                    };
                    if payload.s.is_some() {
                        seq = payload.s;
                    }

                    match payload.op {
                        opcode::DISPATCH => self.dispatch(payload, tx).await,
                        opcode::HEARTBEAT => {
                            write
                                .send(Message::Text(encode(&GatewayPayload::heartbeat(seq))?))
                                .await
                                .map_err(|e| DiscordError::Gateway(e.to_string()))?;
                        }
                        opcode::HEARTBEAT_ACK => awaiting_ack = false,
                        opcode::RECONNECT | opcode::INVALID_SESSION => return Ok(ConnectionEnd::Reconnect),
                        other => tracing::debug!("Ignored gateway opcode {}", other),
                    }
                }
            }
        }
    }

    async fn dispatch(&self, payload: GatewayPayload, tx: &mpsc::Sender<PlatformEvent>) {
        let Some(kind) = payload.t.as_deref() else {
            return;
        };
        let data = payload.d.unwrap_or_default();
        match kind {
            "READY" => {
                let user = data.pointer("/user/username").and_then(|v| v.as_str()).unwrap_or("?");
                tracing::info!("Logged in as {}", user);
            }
            "MESSAGE_CREATE" => {
                let msg: MessageCreate = match serde_json::from_value(data) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!("Unparseable MESSAGE_CREATE: {}", e);
                        return;
                    }
                };
                if msg.guild_id.as_deref() != Some(self.guild_id.as_str()) {
                    return;
                }
                let event = PlatformEvent::Message(translate_message(&msg, &self.authorizer));
                if tx.send(event).await.is_err() {
                    tracing::warn!("Event receiver dropped");
                }
            }
            "GUILD_CREATE" | "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" | "GUILD_ROLE_DELETE" => {
                track_roles(kind, &data, &self.guild_id, &self.authorizer);
            }
            "INTERACTION_CREATE" => {
                let interaction: Interaction = match serde_json::from_value(data) {
                    Ok(i) => i,
                    Err(e) => {
                        tracing::debug!("Unparseable INTERACTION_CREATE: {}", e);
                        return;
                    }
                };
                let Some(click) = translate_interaction(&interaction, &self.authorizer) else {
                    return;
                };
                let rest = self.rest.clone();
                let (id, token) = (interaction.id.clone(), interaction.token.clone());
                tokio::spawn(async move {
                    if let Err(e) = rest.ack_interaction(&id, &token).await {
                        tracing::warn!("Failed to acknowledge interaction {}: {}", id, e);
                    }
                });
                if tx.send(PlatformEvent::Interaction(click)).await.is_err() {
                    tracing::warn!("Event receiver dropped");
                }
            }
            _ => {}
        }
    }
}

fn decode(text: &str) -> Result<GatewayPayload, DiscordError> {
    serde_json::from_str(text).map_err(|e| DiscordError::Decode(e.to_string()))
}

fn encode(payload: &GatewayPayload) -> Result<String, DiscordError> {
    serde_json::to_string(payload).map_err(|e| DiscordError::Decode(e.to_string()))
}

/// Keep the authorizer's view of ADMINISTRATOR roles in step with the guild.
/// Events for other guilds are ignored.
pub fn track_roles(kind: &str, data: &Value, guild_id: &str, authorizer: &Authorizer) {
    let event_guild = match kind {
        "GUILD_CREATE" => data.get("id"),
        _ => data.get("guild_id"),
    };
    if event_guild.and_then(Value::as_str) != Some(guild_id) {
        return;
    }
    match kind {
        "GUILD_CREATE" => {
            for role in data.get("roles").and_then(Value::as_array).into_iter().flatten() {
                authorizer.observe_role(role);
            }
        }
        "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" => {
            if let Some(role) = data.get("role") {
                authorizer.observe_role(role);
            }
        }
        "GUILD_ROLE_DELETE" => {
            if let Some(id) = data.get("role_id").and_then(Value::as_str) {
                authorizer.forget_role(id);
            }
        }
        _ => {}
    }
}

/// Normalize a guild message. Authorization is resolved here, once.
pub fn translate_message(msg: &MessageCreate, authorizer: &Authorizer) -> InboundMessage {
    let roles = msg.member.as_ref().map(|m| m.roles.as_slice()).unwrap_or(&[]);
    InboundMessage {
        channel_id: msg.channel_id.clone(),
        author_id: msg.author.id.clone(),
        text: msg.content.clone(),
        author_is_bot: msg.author.bot,
        authorized: authorizer.is_authorized(&msg.author.id, roles, None),
    }
}

/// Normalize a confirmation button click. Other interactions yield `None`.
pub fn translate_interaction(interaction: &Interaction, authorizer: &Authorizer) -> Option<ButtonInteraction> {
    if interaction.kind != INTERACTION_MESSAGE_COMPONENT {
        return None;
    }
    let (signal, correlation_id) = parse_custom_id(&interaction.data.as_ref()?.custom_id)?;
    let actor = interaction.actor()?;
    let (roles, permissions) = match &interaction.member {
        Some(m) => (m.roles.as_slice(), m.permissions.as_deref()),
        None => (&[][..], None),
    };
    Some(ButtonInteraction {
        correlation_id,
        signal,
        actor_id: actor.id.clone(),
        authorized: authorizer.is_authorized(&actor.id, roles, permissions),
    })
}
