//! End-to-end engine tests against an in-process mock switch.
//!
//! The mock speaks just enough of the manager protocol: banner, login,
//! scripted responses to Originate/Playback/Hangup, and hand-rolled
//! channel events. Speech services are scripted doubles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use ringflow_ami_client::{AmiClient, AmiClientConfig};
use ringflow_ami_core::{encode_block, Block, BlockDecoder};
use ringflow_call_engine::collaborators::{
    AudioRef, CallRecord, CallStore, RecognitionError, RecognitionResult, SpeechRecognizer,
    SpeechSynthesizer, StorageError, SynthesisError,
};
use ringflow_call_engine::{
    CallManager, CallOutcome, CallState, DialRequest, EngineConfig, EngineError,
    EngineNotification, EngineServices, TimingConfig,
};

struct SwitchConn {
    stream: TcpStream,
    decoder: BlockDecoder,
}

impl SwitchConn {
    async fn read_block(&mut self) -> Block {
        loop {
            if let Some(block) = self.decoder.next_block().unwrap() {
                return block;
            }
            let mut buf = [0u8; 1024];
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the connection unexpectedly");
            self.decoder.extend(&buf[..n]);
        }
    }

    async fn send(&mut self, pairs: &[(&str, &str)]) {
        let mut block = Block::new();
        for (k, v) in pairs {
            block.push(*k, *v);
        }
        self.stream.write_all(&encode_block(&block)).await.unwrap();
    }

    /// Read one action block, assert its name, and acknowledge it.
    async fn ack_action(&mut self, expected: &str) -> Block {
        let block = self.read_block().await;
        assert_eq!(block.get("Action"), Some(expected));
        let id = block.action_id().unwrap().to_string();
        self.send(&[("Response", "Success"), ("ActionID", &id)]).await;
        block
    }

    /// Walk an answered call up: Newchannel bound to the originate's
    /// ActionID, then ringing, then up.
    async fn answer(&mut self, originate: &Block, channel: &str) {
        let aid = originate.action_id().unwrap().to_string();
        self.send(&[("Event", "Newchannel"), ("ActionID", &aid), ("Channel", channel)])
            .await;
        self.send(&[
            ("Event", "Newstate"),
            ("Channel", channel),
            ("ChannelStateDesc", "Ringing"),
        ])
        .await;
        self.send(&[
            ("Event", "Newstate"),
            ("Channel", channel),
            ("ChannelStateDesc", "Up"),
        ])
        .await;
    }
}

async fn accept_login(listener: &TcpListener) -> SwitchConn {
    let (stream, _) = listener.accept().await.unwrap();
    let mut conn = SwitchConn {
        stream,
        decoder: BlockDecoder::new(),
    };
    conn.stream
        .write_all(b"Asterisk Call Manager/5.0.2\r\n")
        .await
        .unwrap();

    let login = conn.read_block().await;
    assert_eq!(login.get("Action"), Some("Login"));
    let id = login.action_id().unwrap().to_string();
    conn.send(&[
        ("Response", "Success"),
        ("ActionID", &id),
        ("Message", "Authentication accepted"),
    ])
    .await;
    conn
}

fn client_config(addr: std::net::SocketAddr) -> AmiClientConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    AmiClientConfig {
        address: addr.to_string(),
        username: "test".to_string(),
        secret: "secret".to_string(),
        action_timeout: Duration::from_millis(500),
        reconnect_initial: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
    }
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        stall_timeout: Duration::from_secs(5),
        eviction_grace: Duration::from_millis(100),
        timing: TimingConfig {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            base_delay: Duration::from_millis(1),
            filler_frequency: 0.0,
            hesitation_frequency: 0.0,
            ..TimingConfig::default()
        },
        ..EngineConfig::default()
    }
}

#[derive(Default)]
struct StubSynthesizer {
    failures: Mutex<u32>,
}

impl StubSynthesizer {
    fn failing(times: u32) -> Self {
        Self {
            failures: Mutex::new(times),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for StubSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<AudioRef, SynthesisError> {
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(SynthesisError("engine offline".into()));
        }
        Ok(AudioRef(format!("/tmp/tts-{}.wav", text.len())))
    }
}

struct StubRecognizer {
    text: String,
}

#[async_trait]
impl SpeechRecognizer for StubRecognizer {
    async fn recognize(&self, _audio: AudioRef) -> Result<RecognitionResult, RecognitionError> {
        Ok(RecognitionResult {
            text: self.text.clone(),
            language: "de".into(),
            confidence: 0.92,
        })
    }
}

#[derive(Default)]
struct MemoryStore {
    records: Mutex<Vec<CallRecord>>,
}

#[async_trait]
impl CallStore for MemoryStore {
    async fn store(&self, record: &CallRecord) -> Result<(), StorageError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

fn services_with(
    synthesizer: StubSynthesizer,
    recognizer_text: &str,
    store: Arc<MemoryStore>,
) -> EngineServices {
    EngineServices {
        recognizer: Arc::new(StubRecognizer {
            text: recognizer_text.to_string(),
        }),
        synthesizer: Arc::new(synthesizer),
        store,
    }
}

async fn next_matching<F>(
    rx: &mut broadcast::Receiver<EngineNotification>,
    pred: F,
) -> EngineNotification
where
    F: Fn(&EngineNotification) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(n) if pred(&n) => return n,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("notifications closed"),
            }
        }
    })
    .await
    .expect("notification not observed in time")
}

#[tokio::test]
async fn answered_call_greets_and_completes_on_remote_hangup() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let channel = "SIP/trunk/+4930111-0001";

    let server = tokio::spawn(async move {
        let mut conn = accept_login(&listener).await;
        let originate = conn.ack_action("Originate").await;
        assert_eq!(originate.get("Channel"), Some("SIP/trunk/+4930111"));
        assert_eq!(originate.get("Async"), Some("true"));
        conn.answer(&originate, channel).await;

        // The greeting arrives as a playback of synthesized audio.
        let playback = conn.ack_action("Playback").await;
        assert_eq!(playback.get("Channel"), Some(channel));
        assert!(playback.get("Filename").unwrap().starts_with("/tmp/tts-"));

        conn.send(&[("Event", "Hangup"), ("Channel", channel), ("Cause", "16")])
            .await;
        conn
    });

    let store = Arc::new(MemoryStore::default());
    let client = AmiClient::connect(client_config(addr)).await.unwrap();
    let manager = CallManager::start(
        client,
        engine_config(),
        services_with(StubSynthesizer::default(), "", store.clone()),
    );
    let mut notifications = manager.subscribe();

    let id = manager
        .dial(DialRequest::new("+4930111").with_customer_name("Herr Schmidt"))
        .unwrap();

    next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::StateChanged { to: CallState::Answered, .. })
    })
    .await;

    let spoke = next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::Spoke { .. })
    })
    .await;
    match spoke {
        EngineNotification::Spoke { call_id, turn, .. } => {
            assert_eq!(call_id, id);
            assert!(turn.text.contains("Herr Schmidt"));
        }
        _ => unreachable!(),
    }

    // First acknowledged playback proves the media path.
    next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::StateChanged { to: CallState::InProgress, .. })
    })
    .await;

    let ended = next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::CallEnded { .. })
    })
    .await;
    assert!(matches!(
        ended,
        EngineNotification::CallEnded { outcome: CallOutcome::Completed, .. }
    ));

    // Record stored with the transcript; call evicted after grace.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let records = store.records.lock();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].call.id, id);
    assert!(!records[0].transcript.is_empty());
    drop(records);
    assert!(manager.active_calls().is_empty());

    manager.shutdown().await;
    drop(server);
}

#[tokio::test]
async fn silent_switch_gives_up_as_no_answer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut conn = accept_login(&listener).await;
        // Accept the originate, then say nothing at all.
        let _ = conn.ack_action("Originate").await;
        conn
    });

    let store = Arc::new(MemoryStore::default());
    let client = AmiClient::connect(client_config(addr)).await.unwrap();
    let mut config = engine_config();
    config.stall_timeout = Duration::from_millis(150);
    let manager = CallManager::start(
        client,
        config,
        services_with(StubSynthesizer::default(), "", store.clone()),
    );
    let mut notifications = manager.subscribe();

    let id = manager.dial(DialRequest::new("+4930222")).unwrap();

    let ended = next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::CallEnded { .. })
    })
    .await;
    match ended {
        EngineNotification::CallEnded { call_id, outcome } => {
            assert_eq!(call_id, id);
            assert_eq!(outcome, CallOutcome::NoAnswer);
        }
        _ => unreachable!(),
    }

    manager.shutdown().await;
    drop(server);
}

#[tokio::test]
async fn recognized_refusal_says_goodbye_and_hangs_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let channel = "SIP/trunk/+4930333-0001";

    let server = tokio::spawn(async move {
        let mut conn = accept_login(&listener).await;
        let originate = conn.ack_action("Originate").await;
        conn.answer(&originate, channel).await;

        // Greeting playback, then the goodbye playback after the
        // refusal, then the engine's hangup request.
        let _ = conn.ack_action("Playback").await;
        let _ = conn.ack_action("Playback").await;
        let hangup = conn.ack_action("Hangup").await;
        assert_eq!(hangup.get("Channel"), Some(channel));
        conn.send(&[("Event", "Hangup"), ("Channel", channel), ("Cause", "16")])
            .await;
        conn
    });

    let store = Arc::new(MemoryStore::default());
    let client = AmiClient::connect(client_config(addr)).await.unwrap();
    let manager = CallManager::start(
        client,
        engine_config(),
        services_with(StubSynthesizer::default(), "Nein, kein Interesse", store.clone()),
    );
    let mut notifications = manager.subscribe();

    let id = manager.dial(DialRequest::new("+4930333")).unwrap();

    // Wait until the greeting has been spoken, then feed captured
    // audio through the recognizer double.
    next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::StateChanged { to: CallState::InProgress, .. })
    })
    .await;
    manager
        .hear(&id, AudioRef("/tmp/caller-1.wav".into()), None)
        .await
        .unwrap();

    let heard = next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::Heard { .. })
    })
    .await;
    assert!(matches!(
        heard,
        EngineNotification::Heard { ref text, .. } if text.contains("kein Interesse")
    ));

    let ended = next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::CallEnded { .. })
    })
    .await;
    assert!(matches!(
        ended,
        EngineNotification::CallEnded { outcome: CallOutcome::Completed, .. }
    ));

    // The transcript carries both sides of the exchange.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let records = store.records.lock();
    assert_eq!(records.len(), 1);
    assert!(records[0]
        .transcript
        .iter()
        .any(|t| t.text.contains("kein Interesse")));

    manager.shutdown().await;
    drop(server);
}

#[tokio::test]
async fn synthesis_failing_twice_skips_the_turn() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let channel = "SIP/trunk/+4930444-0001";

    let server = tokio::spawn(async move {
        let mut conn = accept_login(&listener).await;
        let originate = conn.ack_action("Originate").await;
        conn.answer(&originate, channel).await;
        // No playback ever arrives; end the call from the far side.
        tokio::time::sleep(Duration::from_millis(200)).await;
        conn.send(&[("Event", "Hangup"), ("Channel", channel), ("Cause", "16")])
            .await;
        conn
    });

    let store = Arc::new(MemoryStore::default());
    let client = AmiClient::connect(client_config(addr)).await.unwrap();
    let manager = CallManager::start(
        client,
        engine_config(),
        services_with(StubSynthesizer::failing(2), "", store.clone()),
    );
    let mut notifications = manager.subscribe();

    let id = manager.dial(DialRequest::new("+4930444")).unwrap();

    let skipped = next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::TurnSkipped { .. })
    })
    .await;
    assert!(matches!(
        skipped,
        EngineNotification::TurnSkipped { ref call_id } if *call_id == id
    ));

    // The call survives the skipped turn and ends normally.
    let ended = next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::CallEnded { .. })
    })
    .await;
    assert!(matches!(
        ended,
        EngineNotification::CallEnded { outcome: CallOutcome::Completed, .. }
    ));

    manager.shutdown().await;
    drop(server);
}

#[tokio::test]
async fn local_hangup_aborts_a_gated_turn() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let channel = "SIP/trunk/+4930666-0001";

    let server = tokio::spawn(async move {
        let mut conn = accept_login(&listener).await;
        let originate = conn.ack_action("Originate").await;
        conn.answer(&originate, channel).await;

        // The greeting is sitting in the timing gate; the hangup must
        // come through first, not the playback.
        let hangup = conn.ack_action("Hangup").await;
        assert_eq!(hangup.get("Channel"), Some(channel));
        conn.send(&[("Event", "Hangup"), ("Channel", channel), ("Cause", "16")])
            .await;
        conn
    });

    let store = Arc::new(MemoryStore::default());
    let client = AmiClient::connect(client_config(addr)).await.unwrap();
    let mut config = engine_config();
    config.timing.base_delay = Duration::from_secs(2);
    config.timing.min_delay = Duration::from_secs(2);
    config.timing.max_delay = Duration::from_secs(3);
    let manager = CallManager::start(
        client,
        config,
        services_with(StubSynthesizer::default(), "", store.clone()),
    );
    let mut notifications = manager.subscribe();

    let id = manager.dial(DialRequest::new("+4930666")).unwrap();

    next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::StateChanged { to: CallState::Answered, .. })
    })
    .await;
    // Give the call task a moment to enter the gate.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let hung_up_at = std::time::Instant::now();
    manager.hangup(&id).unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match notifications.recv().await {
                Ok(EngineNotification::Spoke { .. }) => {
                    panic!("gated turn was spoken after hangup")
                }
                Ok(n @ EngineNotification::CallEnded { .. }) => return n,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("notifications closed"),
            }
        }
    })
    .await
    .expect("call did not end in time");

    assert!(matches!(
        ended,
        EngineNotification::CallEnded { outcome: CallOutcome::Completed, .. }
    ));
    assert!(
        hung_up_at.elapsed() < Duration::from_millis(1500),
        "hangup waited out the timing gate"
    );

    manager.shutdown().await;
    drop(server);
}

#[tokio::test]
async fn interleaved_events_keep_each_call_in_arrival_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let chan_a = "SIP/trunk/+4930777-0001";
    let chan_b = "SIP/trunk/+4930888-0001";

    let server = tokio::spawn(async move {
        let mut conn = accept_login(&listener).await;
        // The two dials race; sort the originates by destination.
        let one = conn.ack_action("Originate").await;
        let two = conn.ack_action("Originate").await;
        let (orig_a, orig_b) = if one.get("Channel") == Some("SIP/trunk/+4930777") {
            (one, two)
        } else {
            (two, one)
        };
        let aid_a = orig_a.action_id().unwrap().to_string();
        let aid_b = orig_b.action_id().unwrap().to_string();
        conn.send(&[("Event", "Newchannel"), ("ActionID", &aid_a), ("Channel", chan_a)])
            .await;
        conn.send(&[("Event", "Newchannel"), ("ActionID", &aid_b), ("Channel", chan_b)])
            .await;

        // Interleave progress across the calls; b answers first.
        conn.send(&[("Event", "Newstate"), ("Channel", chan_a), ("ChannelStateDesc", "Ringing")])
            .await;
        conn.send(&[("Event", "Newstate"), ("Channel", chan_b), ("ChannelStateDesc", "Ringing")])
            .await;
        conn.send(&[("Event", "Newstate"), ("Channel", chan_b), ("ChannelStateDesc", "Up")])
            .await;
        conn.send(&[("Event", "Newstate"), ("Channel", chan_a), ("ChannelStateDesc", "Up")])
            .await;

        // One greeting per call, in whichever order the gates release.
        let first = conn.ack_action("Playback").await;
        let second = conn.ack_action("Playback").await;
        assert_ne!(first.get("Channel"), second.get("Channel"));

        conn.send(&[("Event", "Hangup"), ("Channel", chan_a), ("Cause", "16")])
            .await;
        conn.send(&[("Event", "Hangup"), ("Channel", chan_b), ("Cause", "16")])
            .await;
        conn
    });

    let store = Arc::new(MemoryStore::default());
    let client = AmiClient::connect(client_config(addr)).await.unwrap();
    let manager = CallManager::start(
        client,
        engine_config(),
        services_with(StubSynthesizer::default(), "", store.clone()),
    );
    let mut notifications = manager.subscribe();

    let a = manager.dial(DialRequest::new("+4930777")).unwrap();
    let b = manager.dial(DialRequest::new("+4930888")).unwrap();

    let mut transitions_a = Vec::new();
    let mut transitions_b = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut ended = 0;
        loop {
            match notifications.recv().await {
                Ok(EngineNotification::StateChanged { call_id, from, to }) => {
                    if call_id == a {
                        transitions_a.push((from, to));
                    } else if call_id == b {
                        transitions_b.push((from, to));
                    }
                }
                Ok(EngineNotification::CallEnded { outcome, .. }) => {
                    assert_eq!(outcome, CallOutcome::Completed);
                    ended += 1;
                    if ended == 2 {
                        return;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("notifications closed"),
            }
        }
    })
    .await
    .expect("both calls should complete");

    // Despite the interleaving on the wire, each call walks its own
    // transitions in arrival order.
    let expected = vec![
        (CallState::Idle, CallState::Dialing),
        (CallState::Dialing, CallState::Ringing),
        (CallState::Ringing, CallState::Answered),
        (CallState::Answered, CallState::InProgress),
        (CallState::InProgress, CallState::Ended),
    ];
    assert_eq!(transitions_a, expected);
    assert_eq!(transitions_b, expected);

    manager.shutdown().await;
    drop(server);
}

#[tokio::test]
async fn connection_loss_fails_every_active_call_and_service_resumes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let mut conn = accept_login(&listener).await;
        let first = conn.ack_action("Originate").await;
        let second = conn.ack_action("Originate").await;
        let first_aid = first.action_id().unwrap().to_string();
        let second_aid = second.action_id().unwrap().to_string();
        conn.send(&[
            ("Event", "Newchannel"),
            ("ActionID", &first_aid),
            ("Channel", "SIP/trunk/a-0001"),
        ])
        .await;
        conn.send(&[
            ("Event", "Newchannel"),
            ("ActionID", &second_aid),
            ("Channel", "SIP/trunk/b-0001"),
        ])
        .await;
        // Kill the connection with both calls live.
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(conn);

        // The client reconnects; normal service resumes.
        let mut conn = accept_login(&listener).await;
        let _ = conn.ack_action("Originate").await;
        conn
    });

    let store = Arc::new(MemoryStore::default());
    let client = AmiClient::connect(client_config(addr)).await.unwrap();
    let manager = CallManager::start(
        client,
        engine_config(),
        services_with(StubSynthesizer::default(), "", store.clone()),
    );
    let mut notifications = manager.subscribe();

    let a = manager.dial(DialRequest::new("+4930001")).unwrap();
    let b = manager.dial(DialRequest::new("+4930002")).unwrap();

    let mut lost = Vec::new();
    for _ in 0..2 {
        let ended = next_matching(&mut notifications, |n| {
            matches!(n, EngineNotification::CallEnded { .. })
        })
        .await;
        match ended {
            EngineNotification::CallEnded { call_id, outcome } => {
                assert_eq!(outcome, CallOutcome::ConnectionLost);
                lost.push(call_id);
            }
            _ => unreachable!(),
        }
    }
    assert!(lost.contains(&a) && lost.contains(&b));

    next_matching(&mut notifications, |n| {
        matches!(n, EngineNotification::ConnectionUp { .. })
    })
    .await;

    // New calls dial normally on the restored connection.
    let c = manager.dial(DialRequest::new("+4930003")).unwrap();
    assert_ne!(c, a);

    manager.shutdown().await;
    drop(server);
}

#[tokio::test]
async fn shutdown_refuses_new_dials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move { accept_login(&listener).await });

    let store = Arc::new(MemoryStore::default());
    let client = AmiClient::connect(client_config(addr)).await.unwrap();
    let manager = CallManager::start(
        client,
        engine_config(),
        services_with(StubSynthesizer::default(), "", store.clone()),
    );

    manager.shutdown().await;

    let err = manager.dial(DialRequest::new("+4930555")).unwrap_err();
    assert!(matches!(err, EngineError::ShutDown));
    assert!(manager.active_calls().is_empty());

    drop(server);
}
