//! End-to-end session tests against a scripted in-process SFU
//!
//! The fake SFU is a real WebSocket server speaking the signaling
//! protocol with scriptable behavior (dropped replies, reordered
//! replies, join rejection); the media engine is a mock that raises
//! connect/produce intents the way a real engine would.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use roomcast_client::{
    ChannelError, ClientConfig, ConsumeOptions, ControlChannel, CorrelationKey, EngineConsumer,
    EngineError, EngineProducer, MediaEngine, MediaTrack, MediaTransport, ResponseKind,
    SessionController, SessionError, SessionStatus, TransportIntent, TransportOptions,
};
use roomcast_protocol::{
    ClientMessage, ConsumerId, DtlsParameters, IceParameters, MediaKind, PeerId, ProducerId,
    RemoteProducerInfo, RtpCapabilities, RtpCodecCapability, RtpParameters, ServerMessage,
    SessionRole, TransportDirection, TransportId,
};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Polls a condition until it holds or the test times out
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let mut ok = false;
        for _ in 0..200 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(ok, "timed out waiting for {}", $what);
    }};
}

// ---------------------------------------------------------------------------
// Fake SFU

#[derive(Default)]
struct SfuBehavior {
    /// Reject every join with this message
    reject_join: Option<String>,
    /// Never reply to `connect_transport`
    drop_connect_replies: bool,
    /// Buffer `consumer_created` replies and release each pair in
    /// reversed order
    reverse_consume_replies: bool,
    /// Follow every `consumer_created` reply with a `producer_closed`
    /// for the same producer
    close_producer_after_consume: bool,
}

struct SfuState {
    behavior: SfuBehavior,
    producers: Mutex<HashMap<ProducerId, (MediaKind, PeerId)>>,
    clients: Mutex<Vec<mpsc::UnboundedSender<ServerMessage>>>,
    log: Mutex<Vec<ClientMessage>>,
    next_id: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl SfuState {
    fn replies_for(
        &self,
        msg: ClientMessage,
        held_consumes: &mut Vec<ServerMessage>,
    ) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::Join { .. } => {
                if let Some(reason) = &self.behavior.reject_join {
                    return vec![ServerMessage::Error {
                        message: reason.clone(),
                        transport_id: None,
                        producer_id: None,
                    }];
                }
                let existing = self
                    .producers
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(id, (kind, peer))| RemoteProducerInfo {
                        producer_id: id.clone(),
                        kind: *kind,
                        peer_id: peer.clone(),
                    })
                    .collect();
                vec![ServerMessage::Joined {
                    router_rtp_capabilities: router_capabilities(),
                    existing_producers: existing,
                }]
            }
            ClientMessage::CreateTransport { direction, peer_id } => {
                let id = TransportId::new(format!(
                    "t{}",
                    self.next_id.fetch_add(1, Ordering::SeqCst)
                ));
                vec![ServerMessage::TransportCreated {
                    id,
                    direction,
                    ice_parameters: IceParameters(json!({"usernameFragment": "frag"})),
                    ice_candidates: vec![],
                    dtls_parameters: DtlsParameters(json!({"role": "server"})),
                    peer_id,
                }]
            }
            ClientMessage::ConnectTransport { transport_id, .. } => {
                if self.behavior.drop_connect_replies {
                    vec![]
                } else {
                    vec![ServerMessage::TransportConnected { transport_id }]
                }
            }
            ClientMessage::Produce {
                transport_id, kind, ..
            } => {
                let producer_id = ProducerId::new(format!(
                    "p{}",
                    self.next_id.fetch_add(1, Ordering::SeqCst)
                ));
                vec![ServerMessage::Produced {
                    producer_id,
                    transport_id,
                    kind,
                }]
            }
            ClientMessage::Consume {
                transport_id,
                producer_id,
                ..
            } => {
                let known = self.producers.lock().unwrap().get(&producer_id).cloned();
                let reply = match known {
                    Some((kind, peer_id)) => {
                        if self.behavior.close_producer_after_consume {
                            return vec![
                                ServerMessage::ConsumerCreated {
                                    id: ConsumerId::new(format!("c-{producer_id}")),
                                    producer_id: producer_id.clone(),
                                    kind,
                                    rtp_parameters: RtpParameters(json!({"codecs": []})),
                                    peer_id: peer_id.clone(),
                                    transport_id,
                                },
                                ServerMessage::ProducerClosed {
                                    producer_id,
                                    peer_id,
                                },
                            ];
                        }
                        ServerMessage::ConsumerCreated {
                            id: ConsumerId::new(format!("c-{producer_id}")),
                            producer_id,
                            kind,
                            rtp_parameters: RtpParameters(json!({"codecs": []})),
                            peer_id,
                            transport_id,
                        }
                    }
                    None => ServerMessage::Error {
                        message: format!("unknown producer {producer_id}"),
                        transport_id: None,
                        producer_id: Some(producer_id),
                    },
                };
                if self.behavior.reverse_consume_replies {
                    held_consumes.push(reply);
                    if held_consumes.len() == 2 {
                        let mut out: Vec<_> = held_consumes.drain(..).collect();
                        out.reverse();
                        return out;
                    }
                    vec![]
                } else {
                    vec![reply]
                }
            }
            ClientMessage::Resume { consumer_id } => {
                vec![ServerMessage::ConsumerResumed { consumer_id }]
            }
            ClientMessage::PauseProducer { producer_id } => {
                vec![ServerMessage::ProducerPaused { producer_id }]
            }
            ClientMessage::ResumeProducer { producer_id } => {
                vec![ServerMessage::ProducerResumed { producer_id }]
            }
            ClientMessage::Leave => vec![],
        }
    }
}

async fn serve_connection(state: Arc<SfuState>, stream: TcpStream) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.clients.lock().unwrap().push(tx.clone());
    let mut shutdown = state.shutdown.subscribe();
    let mut held_consumes = Vec::new();

    loop {
        tokio::select! {
            Some(out) = rx.recv() => {
                let text = serde_json::to_string(&out).unwrap();
                if write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = read.next() => {
                let Some(Ok(Message::Text(text))) = inbound else { break };
                let Ok(msg) = serde_json::from_str::<ClientMessage>(&text) else {
                    continue;
                };
                state.log.lock().unwrap().push(msg.clone());
                for reply in state.replies_for(msg, &mut held_consumes) {
                    let _ = tx.send(reply);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

struct FakeSfu {
    addr: SocketAddr,
    state: Arc<SfuState>,
}

impl FakeSfu {
    async fn start() -> Self {
        Self::start_with(SfuBehavior::default()).await
    }

    async fn start_with(behavior: SfuBehavior) -> Self {
        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(SfuState {
            behavior,
            producers: Mutex::new(HashMap::new()),
            clients: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            shutdown,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(accept_state.clone(), stream));
            }
        });
        Self { addr, state }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.url(),
            request_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
        }
    }

    fn register_producer(&self, id: &str, kind: MediaKind, peer: &str) {
        self.state
            .producers
            .lock()
            .unwrap()
            .insert(ProducerId::new(id), (kind, PeerId::new(peer)));
    }

    fn announce(&self, id: &str, kind: MediaKind, peer: &str) {
        self.register_producer(id, kind, peer);
        self.broadcast(ServerMessage::NewProducer {
            producer_id: ProducerId::new(id),
            kind,
            peer_id: PeerId::new(peer),
        });
    }

    fn close_producer(&self, id: &str, peer: &str) {
        self.state
            .producers
            .lock()
            .unwrap()
            .remove(&ProducerId::new(id));
        self.broadcast(ServerMessage::ProducerClosed {
            producer_id: ProducerId::new(id),
            peer_id: PeerId::new(peer),
        });
    }

    fn broadcast(&self, msg: ServerMessage) {
        for tx in self.state.clients.lock().unwrap().iter() {
            let _ = tx.send(msg.clone());
        }
    }

    fn disconnect_clients(&self) {
        let _ = self.state.shutdown.send(true);
    }

    fn log(&self) -> Vec<ClientMessage> {
        self.state.log.lock().unwrap().clone()
    }
}

fn router_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                parameters: json!({}),
            },
            RtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                parameters: json!({}),
            },
        ],
        header_extensions: json!([]),
    }
}

// ---------------------------------------------------------------------------
// Mock media engine

struct MockEngine {
    consume_delay: Duration,
    closed_transports: Arc<Mutex<Vec<TransportId>>>,
}

impl MockEngine {
    fn new() -> Arc<Self> {
        Self::with_consume_delay(Duration::ZERO)
    }

    /// An engine whose `consume` takes a while, widening race windows
    fn with_consume_delay(consume_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            consume_delay,
            closed_transports: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn closed_transports(&self) -> Vec<TransportId> {
        self.closed_transports.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MediaEngine for MockEngine {
    async fn load_capabilities(
        &self,
        router: &RtpCapabilities,
    ) -> std::result::Result<RtpCapabilities, EngineError> {
        Ok(router.clone())
    }

    async fn create_send_transport(
        &self,
        options: TransportOptions,
    ) -> std::result::Result<Arc<dyn MediaTransport>, EngineError> {
        Ok(MockTransport::create(
            options,
            self.consume_delay,
            self.closed_transports.clone(),
        ))
    }

    async fn create_recv_transport(
        &self,
        options: TransportOptions,
    ) -> std::result::Result<Arc<dyn MediaTransport>, EngineError> {
        Ok(MockTransport::create(
            options,
            self.consume_delay,
            self.closed_transports.clone(),
        ))
    }
}

struct MockTransport {
    id: TransportId,
    consume_delay: Duration,
    closed: Arc<Mutex<Vec<TransportId>>>,
    intents_tx: mpsc::UnboundedSender<TransportIntent>,
    intents_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportIntent>>>,
}

impl MockTransport {
    /// Raises its connect intent on creation, the way a real engine
    /// gathers DTLS parameters as soon as the transport exists
    fn create(
        options: TransportOptions,
        consume_delay: Duration,
        closed: Arc<Mutex<Vec<TransportId>>>,
    ) -> Arc<dyn MediaTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let intents = tx.clone();
        tokio::spawn(async move {
            let (done_tx, done_rx) = oneshot::channel();
            let _ = intents.send(TransportIntent::Connect {
                dtls_parameters: DtlsParameters(json!({"role": "client"})),
                done: done_tx,
            });
            let _ = done_rx.await;
        });
        Arc::new(Self {
            id: options.id,
            consume_delay,
            closed,
            intents_tx: tx,
            intents_rx: Mutex::new(Some(rx)),
        })
    }
}

#[async_trait::async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn take_intents(&self) -> Option<mpsc::UnboundedReceiver<TransportIntent>> {
        self.intents_rx.lock().unwrap().take()
    }

    async fn produce(
        &self,
        track: MediaTrack,
        _encodings: serde_json::Value,
    ) -> std::result::Result<Arc<dyn EngineProducer>, EngineError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.intents_tx
            .send(TransportIntent::Produce {
                kind: track.kind,
                rtp_parameters: RtpParameters(json!({"track": track.id})),
                done: done_tx,
            })
            .map_err(|_| EngineError::new("transport closed"))?;
        let id = done_rx
            .await
            .map_err(|_| EngineError::new("produce abandoned"))??;
        Ok(Arc::new(MockProducer {
            id,
            kind: track.kind,
        }))
    }

    async fn consume(
        &self,
        options: ConsumeOptions,
    ) -> std::result::Result<Arc<dyn EngineConsumer>, EngineError> {
        if !self.consume_delay.is_zero() {
            tokio::time::sleep(self.consume_delay).await;
        }
        Ok(Arc::new(MockConsumer {
            id: options.id,
            kind: options.kind,
            track: MediaTrack::new(options.kind),
        }))
    }

    async fn close(&self) {
        self.closed.lock().unwrap().push(self.id.clone());
    }
}

struct MockProducer {
    id: ProducerId,
    kind: MediaKind,
}

#[async_trait::async_trait]
impl EngineProducer for MockProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn set_paused(&self, _paused: bool) {}

    async fn close(&self) {}
}

struct MockConsumer {
    id: ConsumerId,
    kind: MediaKind,
    track: MediaTrack,
}

#[async_trait::async_trait]
impl EngineConsumer for MockConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> MediaTrack {
        self.track.clone()
    }

    async fn resume(&self) {}

    async fn close(&self) {}
}

fn engine() -> Arc<dyn MediaEngine> {
    MockEngine::new()
}

fn count_matching(log: &[ClientMessage], pred: impl Fn(&ClientMessage) -> bool) -> usize {
    log.iter().filter(|m| pred(m)).count()
}

// ---------------------------------------------------------------------------
// Tests

#[tokio::test]
async fn publisher_joins_and_publishes_in_order() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start().await;
    let session =
        SessionController::join(sfu.config(), engine(), SessionRole::Publisher).await?;
    assert_eq!(session.status(), SessionStatus::Ready);

    let outcomes = session
        .publish(vec![(
            MediaTrack::new(MediaKind::Video),
            json!([{"maxBitrate": 900_000}]),
        )])
        .await;
    assert_eq!(outcomes.len(), 1);
    let (kind, result) = &outcomes[0];
    assert_eq!(*kind, MediaKind::Video);
    let producer_id = result.as_ref().expect("publish should succeed");
    assert!(!producer_id.as_str().is_empty());
    assert_eq!(session.status(), SessionStatus::Streaming);

    // the wire sequence is join, create, connect, produce
    let log = sfu.log();
    assert!(matches!(
        log[0],
        ClientMessage::Join {
            role: SessionRole::Publisher
        }
    ));
    assert!(matches!(
        log[1],
        ClientMessage::CreateTransport {
            direction: TransportDirection::Send,
            peer_id: None
        }
    ));
    assert!(matches!(log[2], ClientMessage::ConnectTransport { .. }));
    assert!(matches!(
        log[3],
        ClientMessage::Produce {
            kind: MediaKind::Video,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn existing_producers_are_consumed_on_join() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start().await;
    sfu.register_producer("p1", MediaKind::Video, "peer-2");

    let session =
        SessionController::join(sfu.config(), engine(), SessionRole::Subscriber).await?;

    eventually!("remote stream for peer-2", {
        session.remote_streams().await.contains_key(&PeerId::new("peer-2"))
    });
    let streams = session.remote_streams().await;
    let stream = &streams[&PeerId::new("peer-2")];
    assert_eq!(stream.consumer_ids, vec![ConsumerId::new("c-p1")]);
    assert_eq!(stream.tracks.len(), 1);
    assert_eq!(stream.tracks[0].kind, MediaKind::Video);
    eventually!("streaming status", session.status() == SessionStatus::Streaming);
    Ok(())
}

#[tokio::test]
async fn reordered_consume_replies_reach_the_right_peers() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start_with(SfuBehavior {
        reverse_consume_replies: true,
        ..Default::default()
    })
    .await;
    sfu.register_producer("p-a", MediaKind::Video, "peer-a");
    sfu.register_producer("p-b", MediaKind::Video, "peer-b");

    let session =
        SessionController::join(sfu.config(), engine(), SessionRole::Subscriber).await?;

    eventually!("both remote streams", session.remote_streams().await.len() == 2);
    let streams = session.remote_streams().await;
    // each consumer landed with the peer whose producer it consumes,
    // even though the replies came back in the opposite order
    assert_eq!(
        streams[&PeerId::new("peer-a")].consumer_ids,
        vec![ConsumerId::new("c-p-a")]
    );
    assert_eq!(
        streams[&PeerId::new("peer-b")].consumer_ids,
        vec![ConsumerId::new("c-p-b")]
    );
    Ok(())
}

#[tokio::test]
async fn one_receive_transport_per_peer() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start().await;
    let session =
        SessionController::join(sfu.config(), engine(), SessionRole::Subscriber).await?;

    // two announcements for the same peer in quick succession
    sfu.announce("p-audio", MediaKind::Audio, "peer-3");
    sfu.announce("p-video", MediaKind::Video, "peer-3");

    eventually!("both consumers for peer-3", {
        session
            .remote_streams()
            .await
            .get(&PeerId::new("peer-3"))
            .map(|s| s.consumer_ids.len() == 2)
            .unwrap_or(false)
    });

    let recv_creates = count_matching(&sfu.log(), |m| {
        matches!(
            m,
            ClientMessage::CreateTransport {
                direction: TransportDirection::Recv,
                peer_id: Some(p)
            } if p.as_str() == "peer-3"
        )
    });
    assert_eq!(recv_creates, 1);
    Ok(())
}

#[tokio::test]
async fn remote_stream_outlives_a_partial_close() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start().await;
    sfu.register_producer("p2-audio", MediaKind::Audio, "peer-2");
    sfu.register_producer("p2-video", MediaKind::Video, "peer-2");

    let eng = MockEngine::new();
    let session =
        SessionController::join(sfu.config(), eng.clone(), SessionRole::Subscriber).await?;
    eventually!("both consumers", {
        session
            .remote_streams()
            .await
            .get(&PeerId::new("peer-2"))
            .map(|s| s.consumer_ids.len() == 2)
            .unwrap_or(false)
    });

    // closing one producer shrinks the stream but keeps it alive, and the
    // receive transport stays open for the surviving consumer
    sfu.close_producer("p2-audio", "peer-2");
    eventually!("one consumer left", {
        session
            .remote_streams()
            .await
            .get(&PeerId::new("peer-2"))
            .map(|s| s.consumer_ids == vec![ConsumerId::new("c-p2-video")])
            .unwrap_or(false)
    });
    assert!(eng.closed_transports().is_empty());

    // closing the last one destroys the stream and closes the transport
    sfu.close_producer("p2-video", "peer-2");
    eventually!("stream destroyed", session.remote_streams().await.is_empty());
    eventually!("receive transport closed", eng.closed_transports().len() == 1);
    Ok(())
}

#[tokio::test]
async fn producer_closing_during_consume_leaves_nothing_behind() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start_with(SfuBehavior {
        close_producer_after_consume: true,
        ..Default::default()
    })
    .await;
    sfu.register_producer("p1", MediaKind::Video, "peer-1");

    // the closure arrives while the engine-side consume is still running
    let eng = MockEngine::with_consume_delay(Duration::from_millis(300));
    let session =
        SessionController::join(sfu.config(), eng.clone(), SessionRole::Subscriber).await?;

    eventually!("resume handshake", {
        count_matching(&sfu.log(), |m| matches!(m, ClientMessage::Resume { .. })) == 1
    });
    eventually!("consumer discarded", session.remote_streams().await.is_empty());
    eventually!("receive transport closed", !eng.closed_transports().is_empty());
    assert_eq!(session.status(), SessionStatus::Ready);
    Ok(())
}

#[tokio::test]
async fn concurrent_publishes_of_one_kind_yield_one_producer() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start().await;
    let session =
        SessionController::join(sfu.config(), engine(), SessionRole::Publisher).await?;

    let (a, b) = tokio::join!(
        session.publish(vec![(MediaTrack::new(MediaKind::Audio), json!([]))]),
        session.publish(vec![(MediaTrack::new(MediaKind::Audio), json!([]))]),
    );
    let outcomes: Vec<_> = a.into_iter().chain(b).collect();
    assert_eq!(outcomes.iter().filter(|(_, r)| r.is_ok()).count(), 1);
    assert_eq!(outcomes.iter().filter(|(_, r)| r.is_err()).count(), 1);
    assert_eq!(
        count_matching(&sfu.log(), |m| matches!(m, ClientMessage::Produce { .. })),
        1
    );
    Ok(())
}

#[tokio::test]
async fn consume_racing_a_closed_producer_is_benign() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start().await;
    let session =
        SessionController::join(sfu.config(), engine(), SessionRole::Subscriber).await?;

    // announce a producer the SFU no longer knows; the consume comes back
    // as an unknown-producer error
    sfu.broadcast(ServerMessage::NewProducer {
        producer_id: ProducerId::new("p-gone"),
        kind: MediaKind::Video,
        peer_id: PeerId::new("peer-9"),
    });

    eventually!("consume attempt reaches the SFU", {
        count_matching(&sfu.log(), |m| matches!(m, ClientMessage::Consume { .. })) == 1
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(session.remote_streams().await.is_empty());
    assert_eq!(session.status(), SessionStatus::Ready);
    assert!(session.last_error().await.is_none());
    Ok(())
}

#[tokio::test]
async fn leave_is_idempotent() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start().await;
    let session =
        SessionController::join(sfu.config(), engine(), SessionRole::Publisher).await?;
    session
        .publish(vec![(MediaTrack::new(MediaKind::Audio), json!([]))])
        .await;

    session.leave().await;
    session.leave().await;
    assert_eq!(session.status(), SessionStatus::Closed);

    eventually!("leave reaches the SFU", {
        count_matching(&sfu.log(), |m| matches!(m, ClientMessage::Leave)) >= 1
    });
    assert_eq!(
        count_matching(&sfu.log(), |m| matches!(m, ClientMessage::Leave)),
        1
    );
    Ok(())
}

#[tokio::test]
async fn join_rejection_surfaces_the_reason() {
    init_tracing();
    let sfu = FakeSfu::start_with(SfuBehavior {
        reject_join: Some("room is full".to_string()),
        ..Default::default()
    })
    .await;

    let err = SessionController::join(sfu.config(), engine(), SessionRole::Participant)
        .await
        .expect_err("join must be rejected");
    match err {
        SessionError::JoinRejected(message) => assert!(message.contains("room is full")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn unanswered_connect_fails_the_join_with_a_timeout() {
    init_tracing();
    let sfu = FakeSfu::start_with(SfuBehavior {
        drop_connect_replies: true,
        ..Default::default()
    })
    .await;
    let config = ClientConfig {
        server_url: sfu.url(),
        request_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(200),
    };

    let err = SessionController::join(config, engine(), SessionRole::Publisher)
        .await
        .expect_err("join must fail when the transport never connects");
    assert!(matches!(err, SessionError::ConnectTimeout(..)));
}

#[tokio::test]
async fn timed_out_request_leaves_no_pending_entry() {
    init_tracing();
    let sfu = FakeSfu::start_with(SfuBehavior {
        drop_connect_replies: true,
        ..Default::default()
    })
    .await;

    let (channel, _events) = ControlChannel::connect(&sfu.url()).await.unwrap();
    let err = channel
        .request(
            ClientMessage::ConnectTransport {
                transport_id: TransportId::new("t1"),
                dtls_parameters: DtlsParameters(json!({})),
            },
            ResponseKind::TransportConnected,
            CorrelationKey::Transport(TransportId::new("t1")),
            Duration::from_millis(200),
        )
        .await
        .expect_err("request must time out");
    assert!(matches!(
        err,
        ChannelError::RequestTimeout(ResponseKind::TransportConnected)
    ));
    assert_eq!(channel.pending_requests(), 0);
}

#[tokio::test]
async fn toggle_track_pauses_and_resumes_server_side() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start().await;
    let session =
        SessionController::join(sfu.config(), engine(), SessionRole::Publisher).await?;
    let outcomes = session
        .publish(vec![(MediaTrack::new(MediaKind::Audio), json!([]))])
        .await;
    assert!(outcomes[0].1.is_ok());

    let paused = session.toggle_track(MediaKind::Audio).await?;
    assert!(paused);
    let paused = session.toggle_track(MediaKind::Audio).await?;
    assert!(!paused);

    let log = sfu.log();
    assert_eq!(
        count_matching(&log, |m| matches!(m, ClientMessage::PauseProducer { .. })),
        1
    );
    assert_eq!(
        count_matching(&log, |m| matches!(m, ClientMessage::ResumeProducer { .. })),
        1
    );
    Ok(())
}

#[tokio::test]
async fn lost_connection_fails_the_session() -> Result<()> {
    init_tracing();
    let sfu = FakeSfu::start().await;
    let session =
        SessionController::join(sfu.config(), engine(), SessionRole::Publisher).await?;
    assert_eq!(session.status(), SessionStatus::Ready);

    sfu.disconnect_clients();

    eventually!("session reports the failure", {
        session.status() == SessionStatus::Error
    });
    let reason = session.last_error().await.expect("a reason is recorded");
    assert!(reason.contains("disconnected"));
    Ok(())
}
