// src/ws.rs
//
// Admin notification side-channel. The hub actor owns the set of live
// connections; connect, disconnect and broadcast are all handled on its
// mailbox, so the set is never touched concurrently.

use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Recipient};
use actix_web::{Error, HttpRequest, HttpResponse, web};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::AppState;
use crate::api::auth::authenticate_token;

static NEXT_SESSION_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Message)]
#[rtype(result = "()")]
pub struct WsMessage(pub String);

#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub session_id: usize,
    pub addr: Recipient<WsMessage>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub session_id: usize,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Broadcast(pub WsResponse);

#[derive(Message)]
#[rtype(result = "usize")]
pub struct ConnectionCount;

/// Frame pushed to admin clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WsResponse {
    pub action: String,
    pub message: String,
    #[serde(rename = "userID")]
    pub user_id: i32,
}

impl WsResponse {
    pub fn logout(user_id: i32) -> Self {
        Self {
            action: "logout".to_string(),
            message: "Your account has been deleted".to_string(),
            user_id,
        }
    }
}

/// Frame sent by admin clients.
#[derive(Clone, Debug, Deserialize)]
pub struct WsPayload {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "messageType")]
    pub message_type: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Default)]
pub struct WsHub {
    sessions: HashMap<usize, Recipient<WsMessage>>,
}

impl WsHub {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Actor for WsHub {
    type Context = actix::Context<Self>;
}

impl Handler<Connect> for WsHub {
    type Result = ();

    fn handle(&mut self, msg: Connect, _: &mut Self::Context) -> Self::Result {
        self.sessions.insert(msg.session_id, msg.addr);
    }
}

impl Handler<Disconnect> for WsHub {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _: &mut Self::Context) -> Self::Result {
        self.sessions.remove(&msg.session_id);
    }
}

impl Handler<Broadcast> for WsHub {
    type Result = ();

    fn handle(&mut self, msg: Broadcast, _: &mut Self::Context) -> Self::Result {
        let payload = match serde_json::to_string(&msg.0) {
            Ok(p) => p,
            Err(e) => {
                log::error!("ws encode error: {e}");
                return;
            }
        };

        let mut dead = Vec::new();
        for (session_id, addr) in &self.sessions {
            if let Err(e) = addr.try_send(WsMessage(payload.clone())) {
                log::warn!(
                    "ws broadcast {} to session {session_id} failed: {e}",
                    msg.0.action
                );
                dead.push(*session_id);
            }
        }
        for session_id in dead {
            self.sessions.remove(&session_id);
        }
    }
}

impl Handler<ConnectionCount> for WsHub {
    type Result = usize;

    fn handle(&mut self, _: ConnectionCount, _: &mut Self::Context) -> Self::Result {
        self.sessions.len()
    }
}

/// Best effort: a full or stopped hub is logged and otherwise ignored.
pub fn notify_logout(hub: &actix::Addr<WsHub>, user_id: i32) {
    if let Err(e) = hub.try_send(Broadcast(WsResponse::logout(user_id))) {
        log::warn!("ws logout broadcast for user {user_id} not queued: {e}");
    }
}

struct WsSession {
    session_id: usize,
    hub: actix::Addr<WsHub>,
}

impl WsSession {
    fn new(hub: actix::Addr<WsHub>) -> Self {
        Self {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            hub,
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hub.do_send(Connect {
            session_id: self.session_id,
            addr: ctx.address().recipient(),
        });

        let hello = WsResponse {
            action: String::new(),
            message: "Connected to the server".to_string(),
            user_id: 0,
        };
        if let Ok(text) = serde_json::to_string(&hello) {
            ctx.text(text);
        }
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        self.hub.do_send(Disconnect {
            session_id: self.session_id,
        });
    }
}

impl Handler<WsMessage> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: WsMessage, ctx: &mut Self::Context) -> Self::Result {
        ctx.text(msg.0);
    }
}

impl actix::StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<WsPayload>(&text) {
                Ok(payload) if payload.action == "deleteUser" => {
                    log::info!("ws deleteUser from {}", payload.username);
                    // the client puts the deleted user's id in `message`
                    let user_id = payload.message.trim().parse().unwrap_or(0);
                    self.hub.do_send(Broadcast(WsResponse::logout(user_id)));
                }
                Ok(_) => {}
                Err(e) => log::warn!("ws bad frame from session {}: {e}", self.session_id),
            },
            Ok(ws::Message::Binary(_)) => {}
            Ok(ws::Message::Continuation(_)) => {}
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                log::warn!("ws protocol error on session {}: {e}", self.session_id);
                ctx.stop()
            }
        }
    }
}

#[derive(Deserialize)]
struct WsQuery {
    token: String,
}

pub async fn admin_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let token = serde_urlencoded::from_str::<WsQuery>(req.query_string())
        .ok()
        .map(|q| q.token)
        .filter(|t| !t.is_empty());

    let Some(token) = token else {
        return Err(actix_web::error::ErrorUnauthorized("Missing token"));
    };

    let user = authenticate_token(state.store.as_ref(), &token).await?;
    log::info!("ws connection for admin user {}", user.id);
    ws::start(WsSession::new(state.ws_hub.clone()), &req, stream)
}
