//! Call manager: registry, event routing, per-call tasks.
//!
//! The manager owns the registry of active calls and the single AMI
//! client. A router task maps unsolicited switch events onto per-call
//! input queues; each call runs its own task consuming that queue, so
//! processing within a call is strictly in arrival order while calls
//! never block each other. Events that match no registered call are
//! logged and discarded, never crash-worthy.
//!
//! Terminal calls linger in the registry for a short grace window so
//! trailing switch events still resolve to them (and get absorbed)
//! instead of being misrouted, then they are evicted and their record
//! handed to storage fire-and-forget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use ringflow_ami_client::{AmiClient, ClientError, ConnectionStatus, RawEvent};
use ringflow_ami_core::Action;

use crate::call::{Call, CallId, CallOutcome, CallSnapshot, CallState};
use crate::collaborators::{CallRecord, CallStore, SpeechRecognizer, SpeechSynthesizer};
use crate::config::{DialRequest, EngineConfig};
use crate::conversation::{ConversationMachine, EmotionSignal, ScriptLibrary, SpokenTurn};
use crate::error::{EngineError, Result};
use crate::events::EngineNotification;
use crate::lifecycle::{self, LifecycleInput, Transition};
use crate::timing::TimingGate;

/// External services the engine orchestrates.
pub struct EngineServices {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub store: Arc<dyn CallStore>,
}

/// Input consumed by a call's task, in strict arrival order.
#[derive(Debug, Clone)]
enum CallInput {
    Lifecycle(LifecycleInput),
    Utterance {
        text: String,
        emotion: Option<EmotionSignal>,
    },
}

struct CallEntry {
    input_tx: mpsc::UnboundedSender<CallInput>,
    cancel_tx: watch::Sender<bool>,
    call: Arc<RwLock<Call>>,
}

struct ManagerInner {
    config: EngineConfig,
    client: AmiClient,
    scripts: ScriptLibrary,
    services: EngineServices,
    gate: TimingGate,
    calls: DashMap<CallId, CallEntry>,
    /// Switch channel name to call, bound at `Newchannel`.
    channels: DashMap<String, CallId>,
    /// Originate ActionID to call, registered before submit so events
    /// racing the response still resolve.
    actions: DashMap<String, CallId>,
    notify_tx: broadcast::Sender<EngineNotification>,
    shutting_down: AtomicBool,
}

/// Orchestrates outbound calls over one switch connection.
///
/// Cheap to clone; all clones share the registry and the client.
#[derive(Clone)]
pub struct CallManager {
    inner: Arc<ManagerInner>,
}

impl CallManager {
    /// Start the manager on an established client connection.
    pub fn start(client: AmiClient, config: EngineConfig, services: EngineServices) -> Self {
        Self::start_with_scripts(client, config, services, ScriptLibrary::default())
    }

    /// Start with a campaign-specific script library.
    pub fn start_with_scripts(
        client: AmiClient,
        config: EngineConfig,
        services: EngineServices,
        scripts: ScriptLibrary,
    ) -> Self {
        let gate = TimingGate::new(config.timing.clone());
        let (notify_tx, _) = broadcast::channel(256);
        let inner = Arc::new(ManagerInner {
            config,
            client,
            scripts,
            services,
            gate,
            calls: DashMap::new(),
            channels: DashMap::new(),
            actions: DashMap::new(),
            notify_tx,
            shutting_down: AtomicBool::new(false),
        });

        tokio::spawn(route_events(inner.clone()));
        tokio::spawn(watch_connection(inner.clone()));

        Self { inner }
    }

    /// Dial an outbound call. Returns as soon as the call is registered
    /// and dialing has been initiated; progress arrives via
    /// [`subscribe`](Self::subscribe).
    pub fn dial(&self, request: DialRequest) -> Result<CallId> {
        if self.inner.shutting_down.load(Ordering::SeqCst) || self.inner.client.is_closed() {
            return Err(EngineError::ShutDown);
        }

        let id = CallId::new();
        let call = Arc::new(RwLock::new(Call::new(id.clone(), request.number.clone())));

        let mut slots = self.inner.config.base_slots();
        if let Some(name) = &request.customer_name {
            slots.insert("customer_name".to_string(), name.clone());
        }
        slots.extend(request.slots.clone());
        let machine = ConversationMachine::new(
            self.inner.scripts.clone(),
            slots,
            self.inner.config.emotion_threshold,
            self.inner.config.language.clone(),
        );

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        // Reserve the correlation id and index it before anything hits
        // the wire: switch events and the action response race, and
        // both must resolve to this call.
        let originate_id = self.inner.client.allocate_action_id();
        self.inner.actions.insert(originate_id.to_string(), id.clone());
        self.inner.calls.insert(
            id.clone(),
            CallEntry {
                input_tx: input_tx.clone(),
                cancel_tx,
                call: call.clone(),
            },
        );

        info!("call {}: dialing {}", id, request.number);
        tokio::spawn(call_task(
            self.inner.clone(),
            id.clone(),
            call,
            machine,
            input_rx,
            cancel_rx,
            originate_id,
            request,
        ));
        let _ = input_tx.send(CallInput::Lifecycle(LifecycleInput::DialRequested));

        Ok(id)
    }

    /// Feed a recognized utterance into a call's conversation.
    pub fn utterance(
        &self,
        id: &CallId,
        text: impl Into<String>,
        emotion: Option<EmotionSignal>,
    ) -> Result<()> {
        self.send(
            id,
            CallInput::Utterance {
                text: text.into(),
                emotion,
            },
        )
    }

    /// Run captured caller audio through the recognizer and feed the
    /// result into the conversation. Recognition failure degrades to an
    /// empty utterance, which asks for clarification instead of killing
    /// the call.
    pub async fn hear(
        &self,
        id: &CallId,
        audio: crate::collaborators::AudioRef,
        emotion: Option<EmotionSignal>,
    ) -> Result<()> {
        let text = match self.inner.services.recognizer.recognize(audio).await {
            Ok(result) => result.text,
            Err(e) => {
                warn!("call {}: {}, treating as unintelligible", id, e);
                String::new()
            }
        };
        self.utterance(id, text, emotion)
    }

    /// Hang up one call locally. The call's cancel signal fires first,
    /// so a turn sitting in the timing gate is aborted instead of being
    /// spoken ahead of the hangup.
    pub fn hangup(&self, id: &CallId) -> Result<()> {
        match self.inner.calls.get(id) {
            Some(entry) => {
                let _ = entry
                    .input_tx
                    .send(CallInput::Lifecycle(LifecycleInput::HangupRequested));
                let _ = entry.cancel_tx.send(true);
                Ok(())
            }
            None => Err(EngineError::CallNotFound(id.clone())),
        }
    }

    /// Snapshot of one call, if still registered.
    pub fn snapshot(&self, id: &CallId) -> Option<CallSnapshot> {
        self.inner.calls.get(id).map(|entry| entry.call.read().snapshot())
    }

    /// Snapshots of every registered call.
    pub fn active_calls(&self) -> Vec<CallSnapshot> {
        self.inner
            .calls
            .iter()
            .map(|entry| entry.call.read().snapshot())
            .collect()
    }

    /// Subscribe to engine notifications. Slow receivers lag and lose
    /// the oldest entries rather than blocking the engine.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotification> {
        self.inner.notify_tx.subscribe()
    }

    /// Hang up every active call, wait for the registry to drain, and
    /// close the switch connection.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine shutting down, {} active call(s)", self.inner.calls.len());

        for entry in self.inner.calls.iter() {
            let _ = entry
                .input_tx
                .send(CallInput::Lifecycle(LifecycleInput::HangupRequested));
            let _ = entry.cancel_tx.send(true);
        }

        let drain = async {
            while !self.inner.calls.is_empty() {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
            warn!("{} call(s) still registered at shutdown", self.inner.calls.len());
        }

        self.inner.client.shutdown().await;
    }

    fn send(&self, id: &CallId, input: CallInput) -> Result<()> {
        match self.inner.calls.get(id) {
            Some(entry) => {
                let _ = entry.input_tx.send(input);
                Ok(())
            }
            None => Err(EngineError::CallNotFound(id.clone())),
        }
    }
}

impl ManagerInner {
    fn publish(&self, notification: EngineNotification) {
        let _ = self.notify_tx.send(notification);
    }

    fn send_to(&self, id: &CallId, input: CallInput) {
        if let Some(entry) = self.calls.get(id) {
            let _ = entry.input_tx.send(input);
        }
    }

    fn call_by_channel(&self, channel: &str) -> Option<CallId> {
        self.channels.get(channel).map(|id| id.value().clone())
    }

    /// Fire a call's cancel signal; any in-flight gate wait aborts.
    fn cancel_gate(&self, id: &CallId) {
        if let Some(entry) = self.calls.get(id) {
            let _ = entry.cancel_tx.send(true);
        }
    }
}

/// Router task: map unsolicited switch events onto per-call queues.
async fn route_events(inner: Arc<ManagerInner>) {
    let mut stream = inner.client.subscribe_all();
    while let Some(event) = stream.next().await {
        route_one(&inner, &event);
    }
    debug!("event router stopped");
}

fn route_one(inner: &Arc<ManagerInner>, event: &RawEvent) {
    let Some(name) = event.name() else {
        debug!("unsolicited block without an Event header discarded");
        return;
    };

    match name {
        "Newchannel" => {
            // Correlated by the Originate ActionID; binds the channel
            // name so later events resolve by channel.
            let Some(call_id) = event
                .block
                .action_id()
                .and_then(|aid| inner.actions.get(aid).map(|id| id.value().clone()))
            else {
                debug!("Newchannel without a known ActionID discarded");
                return;
            };
            if let Some(channel) = event.block.get("Channel") {
                inner.channels.insert(channel.to_string(), call_id.clone());
                inner.send_to(
                    &call_id,
                    CallInput::Lifecycle(LifecycleInput::ChannelCreated {
                        channel: channel.to_string(),
                    }),
                );
            }
        }
        "Newstate" => {
            let Some(call_id) = channel_call(inner, event) else { return };
            let desc = event.block.get("ChannelStateDesc").unwrap_or_default();
            let input = match desc {
                d if d.eq_ignore_ascii_case("Ringing") => LifecycleInput::Progress,
                d if d.eq_ignore_ascii_case("Up") => LifecycleInput::Answered,
                _ => LifecycleInput::ChannelActivity,
            };
            inner.send_to(&call_id, CallInput::Lifecycle(input));
        }
        "DialEnd" => {
            let Some(call_id) = channel_call(inner, event) else { return };
            let status = event.block.get("DialStatus").unwrap_or_default();
            let input = match status {
                s if s.eq_ignore_ascii_case("ANSWER") => LifecycleInput::Answered,
                s if s.eq_ignore_ascii_case("BUSY") => LifecycleInput::HangupEvent {
                    cause: Some("17".to_string()),
                },
                _ => LifecycleInput::HangupEvent { cause: None },
            };
            inner.send_to(&call_id, CallInput::Lifecycle(input));
        }
        "Hangup" => {
            let Some(call_id) = channel_call(inner, event) else { return };
            let cause = event.block.get("Cause").map(str::to_string);
            inner.send_to(
                &call_id,
                CallInput::Lifecycle(LifecycleInput::HangupEvent { cause }),
            );
        }
        _ => {
            // Anything else on a known channel only proves liveness.
            match channel_call(inner, event) {
                Some(call_id) => {
                    inner.send_to(&call_id, CallInput::Lifecycle(LifecycleInput::ChannelActivity))
                }
                None => debug!("event {} matches no registered call, discarded", name),
            }
        }
    }
}

fn channel_call(inner: &Arc<ManagerInner>, event: &RawEvent) -> Option<CallId> {
    let channel = event.block.get("Channel")?;
    let found = inner.call_by_channel(channel);
    if found.is_none() {
        warn!(
            "{} for unknown channel {} discarded",
            event.name().unwrap_or("event"),
            channel
        );
    }
    found
}

/// Watch the connection: on loss, every registered call fails (its
/// switch-side state can no longer be confirmed).
async fn watch_connection(inner: Arc<ManagerInner>) {
    let mut status = inner.client.connection_status();
    loop {
        if status.changed().await.is_err() {
            break;
        }
        let current = *status.borrow();
        match current {
            ConnectionStatus::Down { epoch } => {
                warn!(
                    "switch connection lost on epoch {}, failing {} active call(s)",
                    epoch,
                    inner.calls.len()
                );
                for entry in inner.calls.iter() {
                    let _ = entry
                        .input_tx
                        .send(CallInput::Lifecycle(LifecycleInput::ConnectionLost));
                }
                inner.publish(EngineNotification::ConnectionDown);
            }
            ConnectionStatus::Up { epoch } => {
                info!("switch connection restored on epoch {}", epoch);
                inner.publish(EngineNotification::ConnectionUp { epoch });
            }
            ConnectionStatus::Closed => break,
        }
    }
}

/// One call's task: consume the input queue in order, drive both state
/// machines, and speak decisions through the timing gate.
#[allow(clippy::too_many_arguments)]
async fn call_task(
    inner: Arc<ManagerInner>,
    id: CallId,
    call: Arc<RwLock<Call>>,
    mut machine: ConversationMachine,
    mut input_rx: mpsc::UnboundedReceiver<CallInput>,
    mut cancel_rx: watch::Receiver<bool>,
    originate_id: u64,
    request: DialRequest,
) {
    loop {
        let state = call.read().state;
        if state.is_terminal() {
            break;
        }

        let input = if state.is_pre_answer() {
            // The stall deadline moves with every switch event.
            let deadline = {
                let c = call.read();
                c.last_event_at + chrono::Duration::from_std(inner.config.stall_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(45))
            };
            let remaining = (deadline - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                maybe = input_rx.recv() => match maybe {
                    Some(input) => input,
                    None => break,
                },
                _ = tokio::time::sleep(remaining) => {
                    CallInput::Lifecycle(LifecycleInput::StallTimeout)
                }
            }
        } else if state == CallState::Ending {
            // Absorb trailing events, but only for the grace window.
            tokio::select! {
                maybe = input_rx.recv() => match maybe {
                    Some(input) => input,
                    None => break,
                },
                _ = tokio::time::sleep(inner.config.eviction_grace) => {
                    CallInput::Lifecycle(LifecycleInput::Finalize)
                }
                // Only shutdown skips the grace window; a hangup's
                // cancel signal must not.
                _ = cancel_rx.changed(), if inner.shutting_down.load(Ordering::SeqCst) => {
                    CallInput::Lifecycle(LifecycleInput::Finalize)
                }
            }
        } else {
            match input_rx.recv().await {
                Some(input) => input,
                None => break,
            }
        };

        match input {
            CallInput::Lifecycle(lifecycle_input) => {
                handle_lifecycle(
                    &inner,
                    &id,
                    &call,
                    &mut machine,
                    &mut cancel_rx,
                    originate_id,
                    &request,
                    lifecycle_input,
                )
                .await;
            }
            CallInput::Utterance { text, emotion } => {
                handle_utterance(&inner, &id, &call, &mut machine, &mut cancel_rx, &text, emotion)
                    .await;
            }
        }
    }

    finish_call(&inner, &id, &call, &mut machine, &mut cancel_rx, &mut input_rx, originate_id)
        .await;
}

#[allow(clippy::too_many_arguments)]
async fn handle_lifecycle(
    inner: &Arc<ManagerInner>,
    id: &CallId,
    call: &Arc<RwLock<Call>>,
    machine: &mut ConversationMachine,
    cancel_rx: &mut watch::Receiver<bool>,
    originate_id: u64,
    request: &DialRequest,
    input: LifecycleInput,
) {
    let is_dial = input == LifecycleInput::DialRequested;
    let is_local_hangup = input == LifecycleInput::HangupRequested;

    let transition = {
        let mut c = call.write();
        lifecycle::apply(&mut c, input)
    };

    let Transition::Changed { from, to } = transition else {
        return;
    };
    inner.publish(EngineNotification::StateChanged {
        call_id: id.clone(),
        from,
        to,
    });

    if is_dial {
        originate(inner, id, call, originate_id, request).await;
        return;
    }
    if is_local_hangup && to == CallState::Ending {
        send_hangup(inner, id, call).await;
        return;
    }

    if to == CallState::Answered {
        let turn = machine.on_answered();
        speak(inner, id, call, cancel_rx, turn, machine).await;
    }
}

/// Issue the Originate for a freshly registered call and apply the
/// switch's verdict.
async fn originate(
    inner: &Arc<ManagerInner>,
    id: &CallId,
    call: &Arc<RwLock<Call>>,
    originate_id: u64,
    request: &DialRequest,
) {
    let config = &inner.config;
    let action = Action::new("Originate")
        .field("Channel", config.channel_for(&request.number))
        .field("Context", &config.context)
        .field("Exten", &config.extension)
        .field("Priority", "1")
        .field("CallerID", &config.caller_id)
        .field(
            "Timeout",
            config.originate_timeout.as_millis().to_string(),
        )
        .field("Async", "true");

    let verdict = match inner.client.submit_with_id(originate_id, action).await {
        Ok(response) if response.is_success() => LifecycleInput::OriginateAccepted,
        Ok(response) => LifecycleInput::OriginateRejected {
            reason: response
                .get("Message")
                .unwrap_or("rejected by switch")
                .to_string(),
        },
        Err(ClientError::ConnectionLost) => LifecycleInput::ConnectionLost,
        Err(e) => LifecycleInput::OriginateRejected {
            reason: e.to_string(),
        },
    };

    let transition = {
        let mut c = call.write();
        lifecycle::apply(&mut c, verdict)
    };
    if let Transition::Changed { from, to } = transition {
        inner.publish(EngineNotification::StateChanged {
            call_id: id.clone(),
            from,
            to,
        });
    }
}

/// Ask the switch to hang the channel up. Failure is logged; the grace
/// timer finalizes the call either way.
async fn send_hangup(inner: &Arc<ManagerInner>, id: &CallId, call: &Arc<RwLock<Call>>) {
    let channel = call.read().channel.clone();
    let Some(channel) = channel else {
        debug!("call {}: no channel bound, nothing to hang up", id);
        return;
    };
    let action = Action::new("Hangup").field("Channel", channel);
    if let Err(e) = inner.client.submit(action).await {
        warn!("call {}: hangup not confirmed: {}", id, e);
    }
}

async fn handle_utterance(
    inner: &Arc<ManagerInner>,
    id: &CallId,
    call: &Arc<RwLock<Call>>,
    machine: &mut ConversationMachine,
    cancel_rx: &mut watch::Receiver<bool>,
    text: &str,
    emotion: Option<EmotionSignal>,
) {
    let state = call.read().state;
    if !matches!(state, CallState::Answered | CallState::InProgress) {
        debug!("call {}: utterance in state {} ignored", id, state);
        return;
    }

    inner.publish(EngineNotification::Heard {
        call_id: id.clone(),
        text: text.to_string(),
    });

    let decision = machine.advance(text, emotion);
    if let Some(turn) = decision.turn {
        speak(inner, id, call, cancel_rx, turn, machine).await;
    }
    if decision.end_call {
        let transition = {
            let mut c = call.write();
            lifecycle::apply(&mut c, LifecycleInput::HangupRequested)
        };
        if let Transition::Changed { from, to } = transition {
            // The farewell is already out; nothing queued after it may
            // still gate and speak.
            inner.cancel_gate(id);
            inner.publish(EngineNotification::StateChanged {
                call_id: id.clone(),
                from,
                to,
            });
            send_hangup(inner, id, call).await;
        }
    }
}

/// Speak one turn: gate, synthesize (retry once), play back. Synthesis
/// failing twice skips the turn with a warning; the call carries on.
async fn speak(
    inner: &Arc<ManagerInner>,
    id: &CallId,
    call: &Arc<RwLock<Call>>,
    cancel_rx: &mut watch::Receiver<bool>,
    turn: SpokenTurn,
    machine: &ConversationMachine,
) {
    if !inner.gate.wait(&turn.text, cancel_rx).await {
        debug!("call {}: turn canceled before speaking", id);
        return;
    }

    let text = inner.gate.embellish(&turn.text);
    let voice = &inner.config.voice;
    let audio = match inner.services.synthesizer.synthesize(&text, voice).await {
        Ok(audio) => audio,
        Err(first) => {
            debug!("call {}: synthesis failed, retrying: {}", id, first);
            match inner.services.synthesizer.synthesize(&text, voice).await {
                Ok(audio) => audio,
                Err(second) => {
                    warn!("call {}: synthesis failed twice, skipping turn: {}", id, second);
                    inner.publish(EngineNotification::TurnSkipped { call_id: id.clone() });
                    return;
                }
            }
        }
    };

    let channel = call.read().channel.clone();
    let Some(channel) = channel else {
        warn!("call {}: no channel bound, turn dropped", id);
        return;
    };
    let action = Action::new("Playback")
        .field("Channel", channel)
        .field("Filename", audio.0);
    match inner.client.submit(action).await {
        Ok(_) => {
            inner.publish(EngineNotification::Spoke {
                call_id: id.clone(),
                turn,
                conversation: machine.state(),
            });
            // First acknowledged playback proves the media path.
            let transition = {
                let mut c = call.write();
                lifecycle::apply(&mut c, LifecycleInput::MediaReady)
            };
            if let Transition::Changed { from, to } = transition {
                inner.publish(EngineNotification::StateChanged {
                    call_id: id.clone(),
                    from,
                    to,
                });
            }
        }
        Err(e) => warn!("call {}: playback not confirmed: {}", id, e),
    }
}

/// Terminal handling: publish the outcome, absorb trailing events for
/// the grace window, evict, and hand the record to storage without
/// blocking anything on it.
async fn finish_call(
    inner: &Arc<ManagerInner>,
    id: &CallId,
    call: &Arc<RwLock<Call>>,
    machine: &mut ConversationMachine,
    cancel_rx: &mut watch::Receiver<bool>,
    input_rx: &mut mpsc::UnboundedReceiver<CallInput>,
    originate_id: u64,
) {
    machine.on_call_ended();

    let (snapshot, outcome) = {
        let c = call.read();
        (c.snapshot(), c.outcome.unwrap_or(CallOutcome::Error))
    };
    info!("call {}: ended with outcome {}", id, outcome);
    inner.publish(EngineNotification::CallEnded {
        call_id: id.clone(),
        outcome,
    });

    let record = CallRecord::new(snapshot, machine.take_history());
    let store = inner.services.store.clone();
    let record_id = id.clone();
    tokio::spawn(async move {
        if let Err(first) = store.store(&record).await {
            debug!("call {}: store failed, retrying: {}", record_id, first);
            if let Err(second) = store.store(&record).await {
                warn!("call {}: record dropped after retry: {}", record_id, second);
            }
        }
    });

    // Grace window: trailing switch events still resolve to this call
    // and are absorbed by the (terminal, thus no-op) state machine.
    let grace = tokio::time::sleep(inner.config.eviction_grace);
    tokio::pin!(grace);
    loop {
        tokio::select! {
            _ = &mut grace => break,
            _ = cancel_rx.changed(), if inner.shutting_down.load(Ordering::SeqCst) => break,
            maybe = input_rx.recv() => match maybe {
                Some(CallInput::Lifecycle(input)) => {
                    let mut c = call.write();
                    lifecycle::apply(&mut c, input);
                }
                Some(CallInput::Utterance { .. }) => {}
                None => break,
            }
        }
    }

    inner.calls.remove(id);
    inner.actions.remove(&originate_id.to_string());
    // A late Newchannel can bind during the grace window, so sweep the
    // index by value rather than trusting the snapshot.
    inner.channels.retain(|_, owner| owner != id);
    debug!("call {}: evicted", id);
}
