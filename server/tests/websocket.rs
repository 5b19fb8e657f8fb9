use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use futures_util::{SinkExt, StreamExt};
use server::config::Config;
use server::gateway::{DocumentStatus, LoadError};
use server::handlers;
use server::identity::StaticTokenVerifier;
use server::memory_store::MemoryDocumentStore;
use server::server::ServerState;
use system::codec::{self, Frame, WireFormat};
use system::uuid::Uuid;
use system::{
    Delta, DocumentId, PixelBuffer, RasterError, RejectReason, SessionCommand, SessionEvent,
    TerminationReason,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryDocumentStore>,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(Config::default())
    }

    fn start_with(config: Config) -> Self {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut verifier = StaticTokenVerifier::new();
        verifier.grant("t-alice", "alice", None);
        verifier.grant("t-bob", "bob", None);
        verifier.grant("t-carol", "carol", None);

        let state = web::Data::new(ServerState::new(
            config,
            Arc::new(verifier),
            store.clone(),
            store.clone(),
        ));
        let server = HttpServer::new(move || {
            App::new()
                .app_data(state.clone())
                .configure(handlers::root)
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .expect("");
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        Self { addr, store }
    }

    /// A 2x2 document owned by alice, editable by bob.
    fn document(&self) -> DocumentId {
        let id = Uuid::new_v4();
        self.store
            .insert(id, "alice", PixelBuffer::blank(2, 2).expect(""));
        self.store.add_collaborator(id, "bob");
        id
    }

    async fn connect(&self, path: String) -> Client {
        let (ws, _) = connect_async(format!("ws://{}{}", self.addr, path))
            .await
            .expect("");
        ws
    }

    async fn join(&self, document_id: DocumentId, token: &str) -> Client {
        self.connect(format!("/ws/{}?token={}", document_id, token))
            .await
    }

    async fn wait_for_saves(&self, count: usize) {
        for _ in 0..100 {
            if self.store.save_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} saves, saw {}", count, self.store.save_count());
    }
}

async fn next_message(ws: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            message => return message,
        }
    }
}

async fn next_event(ws: &mut Client) -> SessionEvent {
    match next_message(ws).await {
        Message::Text(text) => codec::decode_text(&text).expect(""),
        Message::Binary(bytes) => codec::decode_binary(&bytes).expect(""),
        other => panic!("unexpected message {:?}", other),
    }
}

async fn close_frame(ws: &mut Client) -> CloseFrame<'static> {
    match next_message(ws).await {
        Message::Close(Some(frame)) => frame,
        other => panic!("expected close frame, got {:?}", other),
    }
}

async fn send(ws: &mut Client, command: &SessionCommand) {
    let message = match codec::encode(WireFormat::Json, command).expect("") {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes),
    };
    ws.send(message).await.expect("");
}

fn paint_first_byte() -> Delta {
    let mut delta = Delta::new();
    delta.insert(0, 255);
    delta
}

#[actix_web::test]
async fn it_relays_deltas_and_saves_when_last_leaves() {
    let server = TestServer::start();
    let id = server.document();

    let mut alice = server.join(id, "t-alice").await;
    match next_event(&mut alice).await {
        SessionEvent::Init {
            document_id,
            revision,
            raster,
            session_snapshot,
        } => {
            assert_eq!(document_id, id);
            assert_eq!(revision, 0);
            assert_eq!(raster.decode().expect(""), PixelBuffer::blank(2, 2).expect(""));
            assert_eq!(session_snapshot.participants.len(), 1);
        }
        other => panic!("expected init, got {:?}", other),
    }

    let mut bob = server.join(id, "t-bob").await;
    assert!(matches!(next_event(&mut bob).await, SessionEvent::Init { .. }));
    match next_event(&mut alice).await {
        SessionEvent::SomeoneJoined(info) => assert_eq!(info.username, "bob"),
        other => panic!("expected join notice, got {:?}", other),
    }

    send(&mut alice, &SessionCommand::Delta(paint_first_byte())).await;
    assert_eq!(
        next_event(&mut alice).await,
        SessionEvent::DeltaAck { revision: 1 }
    );
    match next_event(&mut bob).await {
        SessionEvent::Delta {
            from,
            revision,
            delta,
        } => {
            assert_eq!(from.username, "alice");
            assert_eq!(revision, 1);
            assert_eq!(delta, paint_first_byte());
        }
        other => panic!("expected relayed delta, got {:?}", other),
    }

    alice.close(None).await.expect("");
    match next_event(&mut bob).await {
        SessionEvent::SomeoneLeft(info) => assert_eq!(info.username, "alice"),
        other => panic!("expected leave notice, got {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.store.save_count(), 0);

    bob.close(None).await.expect("");
    server.wait_for_saves(1).await;
    assert_eq!(server.store.stored(id).expect("").as_bytes()[0], 255);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.store.save_count(), 1);
}

#[actix_web::test]
async fn it_answers_pings_and_rejects_bad_frames() {
    let server = TestServer::start();
    let id = server.document();
    let mut alice = server.join(id, "t-alice").await;
    next_event(&mut alice).await;

    send(&mut alice, &SessionCommand::Ping).await;
    assert_eq!(next_event(&mut alice).await, SessionEvent::Pong);

    let mut outside = Delta::new();
    outside.insert(16, 1);
    send(&mut alice, &SessionCommand::Delta(outside)).await;
    assert_eq!(
        next_event(&mut alice).await,
        SessionEvent::DeltaRejected(RejectReason::OutOfBounds { offset: 16, len: 16 })
    );

    alice
        .send(Message::Text("{\"paint\":1}".into()))
        .await
        .expect("");
    assert_eq!(
        next_event(&mut alice).await,
        SessionEvent::DeltaRejected(RejectReason::Malformed)
    );
}

#[actix_web::test]
async fn it_speaks_binary_when_asked() {
    let server = TestServer::start();
    let id = server.document();
    let mut alice = server
        .connect(format!("/ws/{}?token=t-alice&format=binary", id))
        .await;

    match next_message(&mut alice).await {
        Message::Binary(bytes) => {
            let event: SessionEvent = codec::decode_binary(&bytes).expect("");
            assert!(matches!(event, SessionEvent::Init { .. }));
        }
        other => panic!("expected binary init, got {:?}", other),
    }
}

#[actix_web::test]
async fn it_refuses_connections_with_close_codes() {
    let server = TestServer::start();
    let id = server.document();

    let mut ws = server.connect("/ws/not-a-uuid?token=t-alice".into()).await;
    let frame = close_frame(&mut ws).await;
    assert_eq!(frame.code, CloseCode::Invalid);
    assert_eq!(frame.reason, "malformed_request");

    let mut ws = server.join(id, "bogus").await;
    let frame = close_frame(&mut ws).await;
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(frame.reason, "unauthenticated");

    let mut ws = server.connect(format!("/ws/{}", id)).await;
    assert_eq!(close_frame(&mut ws).await.reason, "unauthenticated");

    let mut ws = server.join(id, "t-carol").await;
    let frame = close_frame(&mut ws).await;
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(frame.reason, "forbidden");

    let deleted = server.document();
    server.store.set_status(deleted, DocumentStatus::Deleted);
    let mut ws = server.join(deleted, "t-alice").await;
    assert_eq!(close_frame(&mut ws).await.reason, "document_not_found");

    let broken = Uuid::new_v4();
    server.store.insert_unloadable(
        broken,
        "alice",
        LoadError::DimensionsInvalid(RasterError::DimensionsInvalid {
            width: 2,
            height: 2,
            len: 3,
        }),
    );
    let mut ws = server.join(broken, "t-alice").await;
    let frame = close_frame(&mut ws).await;
    assert_eq!(frame.code, CloseCode::Error);
    assert_eq!(frame.reason, "document_dimensions_invalid");
}

#[actix_web::test]
async fn it_terminates_revoked_collaborator_only() {
    let server = TestServer::start();
    let id = server.document();
    let mut alice = server.join(id, "t-alice").await;
    next_event(&mut alice).await;
    let mut bob = server.join(id, "t-bob").await;
    next_event(&mut bob).await;
    next_event(&mut alice).await;

    server.store.revoke_collaborator(id, "bob");
    assert_eq!(
        next_event(&mut bob).await,
        SessionEvent::Terminated(TerminationReason::AccessRevoked)
    );
    let frame = close_frame(&mut bob).await;
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(frame.reason, "access_revoked");

    assert!(matches!(
        next_event(&mut alice).await,
        SessionEvent::SomeoneLeft(_)
    ));
    send(&mut alice, &SessionCommand::Delta(paint_first_byte())).await;
    assert_eq!(
        next_event(&mut alice).await,
        SessionEvent::DeltaAck { revision: 1 }
    );
}

#[actix_web::test]
async fn it_discards_edits_when_document_is_published() {
    let server = TestServer::start();
    let id = server.document();
    let mut alice = server.join(id, "t-alice").await;
    next_event(&mut alice).await;

    send(&mut alice, &SessionCommand::Delta(paint_first_byte())).await;
    next_event(&mut alice).await;

    server.store.set_status(id, DocumentStatus::Published);
    assert_eq!(
        next_event(&mut alice).await,
        SessionEvent::Terminated(TerminationReason::DocumentPublished)
    );
    assert_eq!(close_frame(&mut alice).await.reason, "document_published");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.store.save_count(), 0);
    assert_eq!(server.store.stored(id).expect("").as_bytes()[0], 0);
}

#[actix_web::test]
async fn it_notices_revocation_without_a_push_notice() {
    let mut config = Config::default();
    config.session.revocation_poll_secs = 1;
    let server = TestServer::start_with(config);
    let id = server.document();
    let mut bob = server.join(id, "t-bob").await;
    next_event(&mut bob).await;

    assert!(server.store.revoke_collaborator_unannounced(id, "bob"));
    assert_eq!(
        next_event(&mut bob).await,
        SessionEvent::Terminated(TerminationReason::AccessRevoked)
    );
    let frame = close_frame(&mut bob).await;
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(frame.reason, "access_revoked");
}
