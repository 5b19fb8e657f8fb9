use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::{
    Actor, ActorContext, ActorFutureExt, AsyncContext, Handler, Message, Running,
    StreamHandler, WrapFuture,
};
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws::{self, CloseCode, CloseReason};
use serde::Deserialize;
use system::codec::{self, Frame, WireFormat};
use system::{
    CodecError, ConnectionId, Delta, DocumentId, RejectReason, SessionCommand, SessionEvent,
    TerminationReason, Username,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{self, Receiver};

use crate::error::{ConnectError, SessionError};
use crate::gateway::{self, AuthorizationOracle, DocumentStatus};
use crate::identity::{AuthError, IdentityVerifier};
use crate::registry::SessionRegistry;
use crate::server::ServerState;
use crate::session::{Joined, Participant, Session};

/// What a client asks for when opening `GET /ws/{document_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub document_id: DocumentId,
    pub credential: Option<String>,
    pub format: WireFormat,
}

#[derive(Deserialize)]
struct ConnectQuery {
    token: Option<String>,
    format: Option<String>,
}

impl ConnectRequest {
    /// The credential comes from an `Authorization: Bearer` header, falling
    /// back to the `token` query parameter.
    pub fn parse(req: &HttpRequest) -> Result<Self, ConnectError> {
        let document_id = req
            .match_info()
            .get("document_id")
            .unwrap_or_default()
            .parse::<DocumentId>()
            .map_err(|e| ConnectError::MalformedRequest(format!("invalid document id: {}", e)))?;
        let query = web::Query::<ConnectQuery>::from_query(req.query_string())
            .map_err(|e| ConnectError::MalformedRequest(e.to_string()))?
            .into_inner();
        let format = match query.format.as_deref() {
            Some(format) => format.parse().map_err(ConnectError::MalformedRequest)?,
            None => WireFormat::default(),
        };
        let credential = bearer_token(req).or(query.token);
        Ok(Self {
            document_id,
            credential,
            format,
        })
    }
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_owned())
}

fn close_reason(error: &ConnectError) -> CloseReason {
    let code = match error {
        ConnectError::MalformedRequest(_) => CloseCode::Invalid,
        ConnectError::Unauthenticated(_)
        | ConnectError::Forbidden
        | ConnectError::DocumentNotFound => CloseCode::Policy,
        ConnectError::DocumentDimensionsInvalid(_) | ConnectError::Unavailable(_) => {
            CloseCode::Error
        }
    };
    CloseReason {
        code,
        description: Some(error.code().to_owned()),
    }
}

async fn within<T, F>(limit: Duration, fut: F) -> Result<T, ConnectError>
where
    F: Future<Output = Result<T, ConnectError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| Err(ConnectError::Unavailable("handshake timed out".into())))
}

async fn verify_credential(
    verifier: Arc<dyn IdentityVerifier>,
    credential: Option<String>,
) -> Result<Username, ConnectError> {
    let credential = credential.ok_or(AuthError::Missing)?;
    Ok(verifier.verify(&credential).await?)
}

async fn check_authorization(
    oracle: Arc<dyn AuthorizationOracle>,
    username: Username,
    document_id: DocumentId,
) -> Result<Username, ConnectError> {
    let access = oracle.editor_access(&username, document_id).await?;
    if !access.can_edit {
        return Err(ConnectError::Forbidden);
    }
    match access.status {
        DocumentStatus::Active => Ok(username),
        DocumentStatus::Deleted => Err(ConnectError::DocumentNotFound),
        DocumentStatus::Published => Err(ConnectError::Forbidden),
    }
}

async fn join_session(
    registry: Arc<SessionRegistry>,
    participant: Participant,
) -> Result<(Username, Arc<Session>, Joined), ConnectError> {
    let (session, joined) = registry.join(&participant).await?;
    Ok((participant.username, session, joined))
}

struct ActiveSession {
    session: Arc<Session>,
    username: Username,
}

enum ConnectionState {
    Connecting,
    Authenticating,
    Authorizing,
    Joining,
    Active(ActiveSession),
    Closing,
    Closed,
}

#[derive(Message)]
#[rtype(result = "()")]
enum ConnectionActorMessage {
    Event(SessionEvent),
    /// The session stopped feeding this connection.
    QueueClosed,
    RecheckAccess,
}

pub struct ConnectionActor {
    connection_id: ConnectionId,
    state: ConnectionState,
    request: Option<Result<ConnectRequest, ConnectError>>,
    format: WireFormat,
    server: web::Data<ServerState>,
    last_heartbeat: Instant,
}

impl ConnectionActor {
    pub fn new(server: web::Data<ServerState>, request: Result<ConnectRequest, ConnectError>) -> Self {
        let format = request.as_ref().map(|r| r.format).unwrap_or_default();
        Self {
            connection_id: server.new_connection_id(),
            state: ConnectionState::Connecting,
            request: Some(request),
            format,
            server,
            last_heartbeat: Instant::now(),
        }
    }

    fn handshake_limit(&self) -> Duration {
        self.server.config.session.client_timeout()
    }

    fn authenticate(&mut self, ctx: &mut ws::WebsocketContext<Self>, request: ConnectRequest) {
        self.state = ConnectionState::Authenticating;
        let verification = verify_credential(self.server.verifier.clone(), request.credential);
        let document_id = request.document_id;
        ctx.wait(
            within(self.handshake_limit(), verification)
                .into_actor(self)
                .map(move |result, act, ctx| match result {
                    Ok(username) => act.authorize(ctx, document_id, username),
                    Err(e) => act.refuse(ctx, e),
                }),
        );
    }

    fn authorize(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        document_id: DocumentId,
        username: Username,
    ) {
        self.state = ConnectionState::Authorizing;
        let authorization = check_authorization(self.server.oracle.clone(), username, document_id);
        ctx.wait(
            within(self.handshake_limit(), authorization)
                .into_actor(self)
                .map(move |result, act, ctx| match result {
                    Ok(username) => act.join(ctx, document_id, username),
                    Err(e) => act.refuse(ctx, e),
                }),
        );
    }

    fn join(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        document_id: DocumentId,
        username: Username,
    ) {
        self.state = ConnectionState::Joining;
        let (tx, rx) = mpsc::channel(self.server.config.session.outbound_queue);
        let participant = Participant::new(self.connection_id, username, document_id, tx);
        let joining = join_session(self.server.registry.clone(), participant);
        ctx.wait(
            within(self.handshake_limit(), joining)
                .into_actor(self)
                .map(move |result, act, ctx| match result {
                    Ok((username, session, joined)) => {
                        act.activate(ctx, username, session, joined, rx)
                    }
                    Err(e) => act.refuse(ctx, e),
                }),
        );
    }

    fn activate(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        username: Username,
        session: Arc<Session>,
        joined: Joined,
        mut rx: Receiver<SessionEvent>,
    ) {
        let document_id = session.document_id();
        self.send_event(
            ctx,
            &SessionEvent::Init {
                document_id,
                revision: joined.snapshot.revision(),
                raster: joined.snapshot.encode(),
                session_snapshot: joined.session_snapshot,
            },
        );

        let addr = ctx.address();
        ctx.spawn(
            async move {
                while let Some(event) = rx.recv().await {
                    addr.do_send(ConnectionActorMessage::Event(event));
                }
                addr.do_send(ConnectionActorMessage::QueueClosed);
            }
            .into_actor(self),
        );

        let addr = ctx.address();
        let mut changes = self.server.oracle.subscribe();
        let watched = username.clone();
        ctx.spawn(
            async move {
                loop {
                    match changes.recv().await {
                        Ok(change) if change.concerns(document_id, &watched) => {
                            addr.do_send(ConnectionActorMessage::RecheckAccess)
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {
                            addr.do_send(ConnectionActorMessage::RecheckAccess)
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            .into_actor(self),
        );
        ctx.run_interval(
            self.server.config.session.revocation_poll(),
            |act, ctx| act.check_access(ctx, None),
        );

        self.last_heartbeat = Instant::now();
        self.state = ConnectionState::Active(ActiveSession { session, username });
    }

    /// Re-validates access, then applies `delta` if it is still allowed.
    fn check_access(&mut self, ctx: &mut ws::WebsocketContext<Self>, delta: Option<Delta>) {
        let ConnectionState::Active(active) = &self.state else {
            return;
        };
        let oracle = self.server.oracle.clone();
        let username = active.username.clone();
        let document_id = active.session.document_id();
        ctx.wait(
            async move { gateway::revocation(&*oracle, &username, document_id).await }
                .into_actor(self)
                .map(move |verdict, act, ctx| match verdict {
                    Some(reason) => act.terminate(ctx, reason),
                    None => {
                        if let Some(delta) = delta {
                            act.apply(ctx, delta);
                        }
                    }
                }),
        );
    }

    fn apply(&mut self, ctx: &mut ws::WebsocketContext<Self>, delta: Delta) {
        let ConnectionState::Active(active) = &self.state else {
            return;
        };
        match active.session.apply_delta(self.connection_id, &delta) {
            Ok(applied) => log::debug!(
                "Connection {} applied {} entries as revision {}, relayed to {}",
                self.connection_id,
                delta.len(),
                applied.revision,
                applied.recipients.len()
            ),
            Err(SessionError::DeltaOutOfBounds { offset, len }) => log::warn!(
                "Connection {} sent offset {} past a {} byte raster",
                self.connection_id,
                offset,
                len
            ),
            Err(e) => {
                log::warn!("Connection {}: {}", self.connection_id, e);
                self.close(ctx, CloseCode::Policy, "slow_consumer");
            }
        }
    }

    fn handle_command(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        command: Result<SessionCommand, CodecError>,
    ) {
        let ConnectionState::Active(active) = &self.state else {
            log::debug!("Connection {} ignored a frame outside a session", self.connection_id);
            return;
        };
        match command {
            Ok(SessionCommand::Delta(delta)) => {
                let max = self.server.config.limits.max_delta_entries;
                if delta.len() > max {
                    active.session.reject(
                        self.connection_id,
                        RejectReason::TooLarge {
                            entries: delta.len() as u64,
                            max: max as u64,
                        },
                    );
                    return;
                }
                self.check_access(ctx, Some(delta));
            }
            Ok(SessionCommand::Ping) => self.send_event(ctx, &SessionEvent::Pong),
            Err(e) => {
                log::warn!("Connection {} sent a malformed frame: {}", self.connection_id, e);
                active
                    .session
                    .reject(self.connection_id, RejectReason::Malformed);
            }
        }
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: &SessionEvent) {
        match codec::encode(self.format, event) {
            Ok(Frame::Text(text)) => ctx.text(text),
            Ok(Frame::Binary(bytes)) => ctx.binary(bytes),
            Err(e) => log::error!("Failed to encode event for {}: {}", self.connection_id, e),
        }
    }

    fn terminate(&mut self, ctx: &mut ws::WebsocketContext<Self>, reason: TerminationReason) {
        log::info!("Terminating connection {}: {}", self.connection_id, reason);
        self.send_event(ctx, &SessionEvent::Terminated(reason));
        self.close(ctx, CloseCode::Policy, reason.code());
    }

    fn refuse(&mut self, ctx: &mut ws::WebsocketContext<Self>, error: ConnectError) {
        log::info!("Refusing connection {}: {}", self.connection_id, error);
        self.state = ConnectionState::Closed;
        ctx.close(Some(close_reason(&error)));
        ctx.stop();
    }

    fn close(&mut self, ctx: &mut ws::WebsocketContext<Self>, code: CloseCode, description: &str) {
        ctx.close(Some(CloseReason {
            code,
            description: Some(description.to_owned()),
        }));
        ctx.stop();
    }

    /// Leaves the session exactly once; the last one out hands the session
    /// back to the registry for saving.
    fn leave(&mut self) {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Closing);
        if let ConnectionState::Active(active) = previous {
            let remaining = active.session.leave(self.connection_id);
            log::info!(
                "{} (connection {}) left {}, {} remaining",
                active.username,
                self.connection_id,
                active.session.document_id(),
                remaining
            );
            if remaining == 0 {
                let registry = self.server.registry.clone();
                tokio::spawn(async move {
                    registry.release(active.session).await;
                });
            }
        }
        self.state = ConnectionState::Closed;
    }
}

impl Actor for ConnectionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let timeout = self.server.config.session.client_timeout();
        ctx.run_interval(
            self.server.config.session.heartbeat_interval(),
            move |act, ctx| {
                if Instant::now().duration_since(act.last_heartbeat) > timeout {
                    log::warn!("Connection {} timed out", act.connection_id);
                    ctx.stop();
                    return;
                }
                ctx.ping(b"");
            },
        );

        match self.request.take() {
            Some(Ok(request)) => self.authenticate(ctx, request),
            Some(Err(e)) => self.refuse(ctx, e),
            None => unreachable!("connection {} started twice", self.connection_id),
        }
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        self.leave();
        Running::Stop
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        self.leave();
    }
}

/// Ingress
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(ws::ProtocolError::Overflow) => {
                log::warn!("Connection {} sent an oversized frame", self.connection_id);
                self.close(ctx, CloseCode::Size, "frame_too_large");
                return;
            }
            Err(e) => {
                log::warn!("Connection {} protocol error: {}", self.connection_id, e);
                self.close(ctx, CloseCode::Protocol, "protocol_error");
                return;
            }
        };
        self.last_heartbeat = Instant::now();
        match msg {
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Pong(_) => (),
            ws::Message::Text(text) => {
                log::debug!("Ingress text size: {}", text.len());
                self.handle_command(ctx, codec::decode_text(&text));
            }
            ws::Message::Binary(bin) => {
                log::debug!("Ingress binary size: {}", bin.len());
                self.handle_command(ctx, codec::decode_binary(&bin));
            }
            ws::Message::Close(reason) => {
                log::info!("Connection {} closed by client: {:?}", self.connection_id, reason);
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) => {
                self.close(ctx, CloseCode::Unsupported, "fragmented_frames");
            }
            ws::Message::Nop => (),
        }
    }
}

/// Egress
impl Handler<ConnectionActorMessage> for ConnectionActor {
    type Result = ();

    fn handle(&mut self, msg: ConnectionActorMessage, ctx: &mut Self::Context) -> Self::Result {
        if !matches!(self.state, ConnectionState::Active(_)) {
            return;
        }
        match msg {
            ConnectionActorMessage::Event(event) => {
                log::debug!("Egress {:?}", event);
                self.send_event(ctx, &event);
            }
            ConnectionActorMessage::QueueClosed => {
                log::warn!("Connection {} fell behind and was dropped", self.connection_id);
                self.close(ctx, CloseCode::Policy, "slow_consumer");
            }
            ConnectionActorMessage::RecheckAccess => self.check_access(ctx, None),
        }
    }
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    server: web::Data<ServerState>,
) -> Result<HttpResponse, Error> {
    let request = ConnectRequest::parse(&req);
    let max_frame_bytes = server.config.limits.max_frame_bytes;
    ws::WsResponseBuilder::new(ConnectionActor::new(server, request), &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}
