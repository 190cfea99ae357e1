use std::time::Duration;

use chrono::Utc;
use sync_core::{
    ChannelEvent, ConnectionState, ConversationStatus, MessageAdded, MessageEntry, MessageRole,
    OutboundFrame, Reconciled, Subscription, SyncError, SyncErrorCategory, Timer, TranscriptBuffer,
    TranscriptError,
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    api::SupportApi,
    client::{Connector, TransportClient},
};

const COMMAND_QUEUE: usize = 32;
const DEFAULT_HANDOFF_BANNER: &str = "This conversation was handed to a human operator";

#[derive(Debug, Clone)]
pub struct TranscriptConfig {
    /// Auto-clear delay of the typing indicator.
    pub typing_timeout: Duration,
    /// Oldest entries are dropped beyond this many.
    pub max_items: usize,
    /// Status known from the conversation summary, if any.
    pub initial_status: Option<ConversationStatus>,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            typing_timeout: Duration::from_secs(3),
            max_items: 500,
            initial_status: None,
        }
    }
}

/// Observable transcript state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptSnapshot {
    pub conversation_id: String,
    /// Confirmed history followed by unconfirmed local echoes.
    pub messages: Vec<MessageEntry>,
    pub typing: bool,
    /// Non-fatal notice from a handoff or a server error frame.
    pub banner: Option<String>,
    pub status: Option<ConversationStatus>,
    pub connected: bool,
    pub can_send: bool,
    pub last_error: Option<SyncError>,
}

enum Input {
    Event(ChannelEvent),
    State(ConnectionState),
    TransportError(SyncError),
}

enum Command {
    Send {
        content: String,
        reply: oneshot::Sender<Result<MessageEntry, SyncError>>,
    },
    Refresh(oneshot::Sender<Result<(), SyncError>>),
}

/// Live transcript of one open conversation with optimistic sends.
pub struct TranscriptSync<C: Connector> {
    conversation_id: String,
    transport: TransportClient<C>,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<TranscriptSnapshot>,
    subscriptions: Vec<Subscription>,
    task: Option<JoinHandle<()>>,
}

impl<C: Connector> TranscriptSync<C> {
    pub fn spawn<A: SupportApi>(
        conversation_id: impl Into<String>,
        transport: TransportClient<C>,
        api: A,
        config: TranscriptConfig,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);

        let events = input_tx.clone();
        let states = input_tx.clone();
        let errors = input_tx;
        let subscriptions = vec![
            transport.on_message(move |event| {
                let _ = events.send(Input::Event(event.clone()));
            }),
            transport.on_connection_state_change(move |state| {
                let _ = states.send(Input::State(*state));
            }),
            transport.on_error(move |err| {
                let _ = errors.send(Input::TransportError(err.clone()));
            }),
        ];

        let status = config.initial_status;
        let (snapshot_tx, snapshot_rx) = watch::channel(TranscriptSnapshot {
            conversation_id: conversation_id.clone(),
            messages: Vec::new(),
            typing: false,
            banner: None,
            status,
            connected: false,
            can_send: status != Some(ConversationStatus::Closed),
            last_error: None,
        });

        let task = TranscriptTask {
            transport: transport.clone(),
            api,
            buffer: TranscriptBuffer::new(conversation_id.clone(), config.max_items),
            typing: false,
            typing_clear: Timer::one_shot(),
            banner: None,
            status,
            connected: false,
            resync_on_connect: false,
            last_error: None,
            config,
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(task.run(input_rx, command_rx));

        Self {
            conversation_id,
            transport,
            commands: command_tx,
            snapshot: snapshot_rx,
            subscriptions,
            task: Some(task),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TranscriptSnapshot> {
        self.snapshot.clone()
    }

    /// Send a user message; returns the optimistic entry.
    ///
    /// Goes over the push channel when connected, otherwise through the REST
    /// API followed by a history re-fetch. On failure the optimistic entry
    /// is removed again.
    pub async fn send(&self, content: impl Into<String>) -> Result<MessageEntry, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                content: content.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| closed_error())?;
        reply_rx.await.map_err(|_| closed_error())?
    }

    /// Tell the other side the operator is typing. `false` when offline.
    pub fn notify_typing(&self) -> bool {
        self.transport.send(&OutboundFrame::Typing)
    }

    /// Re-fetch the full history.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Refresh(reply_tx))
            .await
            .map_err(|_| closed_error())?;
        reply_rx.await.map_err(|_| closed_error())?
    }

    /// Unsubscribe, disconnect and stop every timer. Idempotent.
    pub fn close(&mut self) {
        self.subscriptions.clear();
        self.transport.disconnect();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(conversation_id = %self.conversation_id, "transcript synchronizer closed");
        }
    }
}

impl<C: Connector> Drop for TranscriptSync<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error() -> SyncError {
    SyncError::new(
        SyncErrorCategory::Internal,
        "synchronizer_closed",
        "transcript synchronizer is no longer running",
    )
}

struct TranscriptTask<C, A> {
    transport: TransportClient<C>,
    api: A,
    config: TranscriptConfig,
    buffer: TranscriptBuffer,
    typing: bool,
    typing_clear: Timer,
    banner: Option<String>,
    status: Option<ConversationStatus>,
    connected: bool,
    resync_on_connect: bool,
    last_error: Option<SyncError>,
    snapshot: watch::Sender<TranscriptSnapshot>,
}

impl<C: Connector, A: SupportApi> TranscriptTask<C, A> {
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        // `connected` follows the queued state events.
        self.transport.connect().await;
        if let Err(err) = self.refetch().await {
            warn!(error = %err, "initial history fetch failed");
        }

        loop {
            tokio::select! {
                Some(input) = inputs.recv() => self.handle_input(input).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = self.typing_clear.fired() => {
                    self.typing = false;
                    self.publish();
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { content, reply } => {
                let _ = reply.send(self.send(content).await);
            }
            Command::Refresh(reply) => {
                let _ = reply.send(self.refetch().await);
            }
        }
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Event(event) => self.handle_event(event),
            Input::State(state) => {
                let resync = state.is_connected() && self.resync_on_connect;
                if self.connected && !state.is_connected() {
                    self.resync_on_connect = true;
                }
                self.connected = state.is_connected();
                self.publish();
                if resync {
                    self.resync_on_connect = false;
                    info!(
                        conversation_id = %self.buffer.conversation_id(),
                        "chat channel back; re-fetching history"
                    );
                    if let Err(err) = self.refetch().await {
                        warn!(error = %err, "history re-fetch after reconnect failed");
                    }
                }
            }
            Input::TransportError(err) => {
                debug!(error = %err, "chat channel error");
                self.last_error = Some(err);
                self.publish();
            }
        }
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::MessageAdded(added) => {
                if let Some(other) = added.conversation_id.as_deref()
                    && other != self.buffer.conversation_id()
                {
                    trace!(%other, "message for another conversation ignored");
                    return;
                }
                if matches!(added.role, MessageRole::Agent | MessageRole::Admin) {
                    self.typing = false;
                    self.typing_clear.stop();
                }
                let outcome = self.buffer.apply_message(added, Utc::now());
                trace!(?outcome, "message merged");
                if outcome != Reconciled::EchoIgnored {
                    self.publish();
                }
            }
            ChannelEvent::Typing => {
                self.typing = true;
                self.typing_clear.reset(self.config.typing_timeout);
                self.publish();
            }
            ChannelEvent::Status { status } => {
                debug!(?status, "conversation status changed");
                self.status = Some(status);
                self.publish();
            }
            ChannelEvent::Handoff { reason } => {
                self.banner = Some(reason.unwrap_or_else(|| DEFAULT_HANDOFF_BANNER.to_owned()));
                self.publish();
            }
            ChannelEvent::Error { message } => {
                warn!(%message, "server reported an error on the chat channel");
                self.banner = Some(message);
                self.publish();
            }
            other => trace!(kind = other.kind(), "transcript ignores event"),
        }
    }

    async fn send(&mut self, content: String) -> Result<MessageEntry, SyncError> {
        if self.status == Some(ConversationStatus::Closed) {
            return Err(self.reject(TranscriptError::ConversationClosed));
        }
        let entry = match self.buffer.push_pending(&content, Utc::now()) {
            Ok(entry) => entry,
            Err(TranscriptError::EmptyContent) => {
                return Err(TranscriptError::EmptyContent.into());
            }
            Err(err) => return Err(self.reject(err)),
        };
        self.publish();

        let frame = OutboundFrame::Message {
            content: content.clone(),
            timestamp: entry.timestamp,
            client_id: Some(entry.id.clone()),
        };
        if self.transport.send(&frame) {
            debug!(temp_id = %entry.id, "message sent over push channel");
            return Ok(entry);
        }

        debug!(temp_id = %entry.id, "push channel down; submitting over REST");
        let conversation_id = self.buffer.conversation_id().to_owned();
        match self.api.submit_message(&conversation_id, &content).await {
            Ok(confirmed) => {
                debug!(temp_id = %entry.id, server_id = %confirmed.id, "fallback submit accepted");
                self.buffer.apply_message(
                    MessageAdded {
                        id: Some(confirmed.id),
                        conversation_id: Some(confirmed.conversation_id),
                        role: confirmed.role,
                        content: confirmed.content,
                        timestamp: Some(confirmed.timestamp),
                        client_id: Some(entry.id.clone()),
                    },
                    Utc::now(),
                );
                self.publish();
                if let Err(err) = self.refetch().await {
                    warn!(error = %err, "history re-fetch after fallback submit failed");
                }
                Ok(entry)
            }
            Err(err) => {
                warn!(error = %err, "fallback submit failed; dropping local echo");
                self.buffer.discard_pending(&entry.id);
                self.last_error = Some(err.clone());
                self.publish();
                Err(err)
            }
        }
    }

    fn reject(&mut self, err: TranscriptError) -> SyncError {
        let err = SyncError::from(err);
        self.last_error = Some(err.clone());
        self.publish();
        err
    }

    /// Authoritative history fetch; pending local echoes survive it.
    async fn refetch(&mut self) -> Result<(), SyncError> {
        let conversation_id = self.buffer.conversation_id().to_owned();
        let outcome = match self.api.message_history(&conversation_id).await {
            Ok(history) => {
                self.buffer.replace_history(history);
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                self.last_error = Some(err.clone());
                Err(err)
            }
        };
        self.publish();
        outcome
    }

    fn publish(&self) {
        self.snapshot.send_replace(TranscriptSnapshot {
            conversation_id: self.buffer.conversation_id().to_owned(),
            messages: self.buffer.entries().to_vec(),
            typing: self.typing,
            banner: self.banner.clone(),
            status: self.status,
            connected: self.connected,
            can_send: self.status != Some(ConversationStatus::Closed),
            last_error: self.last_error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sync_core::MessageAdded;
    use sync_platform::{CredentialSource, StaticCredential};
    use tokio::time::{sleep, timeout};
    use url::Url;

    use super::*;
    use crate::{
        client::TransportConfig,
        memory::{MemoryConnector, MemoryPeer, MemoryServer, memory_channel},
        testing::{FakeApi, message},
    };

    const WAIT: Duration = Duration::from_secs(60);
    const CONVERSATION: &str = "c1";

    struct Harness {
        sync: TranscriptSync<MemoryConnector>,
        server: MemoryServer,
        api: FakeApi,
    }

    fn harness(token: Option<&str>, api: FakeApi) -> Harness {
        let (connector, server) = memory_channel();
        let credentials: Arc<dyn CredentialSource> = match token {
            Some(token) => Arc::new(StaticCredential::new(token)),
            None => Arc::new(StaticCredential::missing()),
        };
        let base = Url::parse("ws://desk.test/").expect("url");
        let transport = TransportClient::new(
            connector,
            TransportConfig::chat(&base, CONVERSATION).expect("config"),
            credentials,
        );
        let sync = TranscriptSync::spawn(
            CONVERSATION,
            transport,
            api.clone(),
            TranscriptConfig::default(),
        );
        Harness { sync, server, api }
    }

    async fn accept(server: &mut MemoryServer) -> MemoryPeer {
        timeout(WAIT, server.accept())
            .await
            .expect("accept in time")
            .expect("peer")
    }

    async fn wait_for(
        sync: &TranscriptSync<MemoryConnector>,
        predicate: impl FnMut(&TranscriptSnapshot) -> bool,
    ) -> TranscriptSnapshot {
        let mut rx = sync.subscribe();
        let snapshot = timeout(WAIT, rx.wait_for(predicate))
            .await
            .expect("snapshot in time")
            .expect("sender alive");
        snapshot.clone()
    }

    fn pending(snapshot: &TranscriptSnapshot) -> usize {
        snapshot.messages.iter().filter(|m| !m.confirmed).count()
    }

    fn agent_message(id: &str, content: &str) -> ChannelEvent {
        ChannelEvent::MessageAdded(MessageAdded {
            id: Some(id.into()),
            conversation_id: Some(CONVERSATION.into()),
            role: MessageRole::Agent,
            content: content.into(),
            timestamp: None,
            client_id: None,
        })
    }

    #[tokio::test]
    async fn loads_history_on_open() {
        let api = FakeApi::default();
        api.state().history = vec![message("m1", CONVERSATION, MessageRole::Agent, "hi there")];
        let mut h = harness(Some("t"), api);
        let peer = accept(&mut h.server).await;
        assert!(peer.url().path().ends_with("/ws/chat/c1"));

        let snapshot = wait_for(&h.sync, |s| s.connected && s.messages.len() == 1).await;
        assert!(snapshot.can_send);
        assert_eq!(h.api.state().history_calls, 1);
    }

    #[tokio::test]
    async fn optimistic_send_is_confirmed_by_echo() {
        let mut h = harness(Some("t"), FakeApi::default());
        let mut peer = accept(&mut h.server).await;
        wait_for(&h.sync, |s| s.connected).await;

        let entry = h.sync.send("where is my order?").await.expect("send");
        assert!(!entry.confirmed);
        assert_eq!(pending(&h.sync.snapshot()), 1);

        let sent = timeout(WAIT, peer.next_sent()).await.expect("frame").expect("text");
        let frame: serde_json::Value = serde_json::from_str(&sent).expect("json");
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["client_id"], entry.id.as_str());

        peer.push_event(&ChannelEvent::MessageAdded(MessageAdded {
            id: Some("m7".into()),
            conversation_id: Some(CONVERSATION.into()),
            role: MessageRole::User,
            content: "where is my order?".into(),
            timestamp: None,
            client_id: Some(entry.id.clone()),
        }));
        let snapshot = wait_for(&h.sync, |s| pending(s) == 0 && !s.messages.is_empty()).await;
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].id, "m7");
    }

    #[tokio::test]
    async fn rejects_empty_duplicate_and_closed_sends() {
        let mut h = harness(Some("t"), FakeApi::default());
        let peer = accept(&mut h.server).await;
        wait_for(&h.sync, |s| s.connected).await;

        let err = h.sync.send("   ").await.expect_err("empty");
        assert_eq!(err.code, "empty_content");
        assert!(h.sync.snapshot().messages.is_empty());
        assert_eq!(h.sync.snapshot().last_error, None);

        h.sync.send("refund please").await.expect("first send");
        let err = h.sync.send("refund please").await.expect_err("duplicate");
        assert_eq!(err.code, "duplicate_pending");
        assert_eq!(h.sync.snapshot().messages.len(), 1);

        peer.push_text(r#"{"type":"status","status":"CLOSED"}"#);
        wait_for(&h.sync, |s| !s.can_send).await;
        let err = h.sync.send("anyone?").await.expect_err("closed");
        assert_eq!(err.code, "conversation_closed");
    }

    #[tokio::test]
    async fn fallback_submit_then_refetch_when_offline() {
        let h = harness(None, FakeApi::default());
        wait_for(&h.sync, |s| !s.connected).await;

        let entry = h.sync.send("hello?").await.expect("fallback send");
        assert!(!entry.confirmed);
        assert_eq!(h.api.state().submitted, vec!["hello?".to_owned()]);

        let snapshot = h.sync.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert!(snapshot.messages[0].confirmed);
        assert_eq!(snapshot.messages[0].id, "m1");
    }

    #[tokio::test]
    async fn failed_fallback_removes_local_echo() {
        let api = FakeApi::default();
        api.state().fail_submit = true;
        let h = harness(None, api);

        let err = h.sync.send("hello?").await.expect_err("submit fails");
        assert!(err.is_recoverable());
        let snapshot = h.sync.snapshot();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.last_error, Some(err));
    }

    #[tokio::test]
    async fn accepted_fallback_is_confirmed_even_if_refetch_fails() {
        let api = FakeApi::default();
        api.state().fail_history = true;
        let h = harness(None, api);

        h.sync.send("refund please").await.expect("fallback send");
        let snapshot = h.sync.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert!(snapshot.messages[0].confirmed);
        assert_eq!(snapshot.messages[0].id, "m1");
        assert_eq!(
            snapshot.last_error.map(|err| err.code),
            Some("http_timeout".to_owned())
        );

        h.sync
            .send("refund please")
            .await
            .expect("same text again is not a pending duplicate");
        assert_eq!(pending(&h.sync.snapshot()), 0);
        assert_eq!(h.sync.snapshot().messages.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_surface_an_error() {
        let mut h = harness(Some("t"), FakeApi::default());
        let peer = accept(&mut h.server).await;
        wait_for(&h.sync, |s| s.connected).await;

        h.server.set_refuse(true);
        peer.drop_connection();
        sleep(Duration::from_secs(120)).await;

        let snapshot = h.sync.snapshot();
        assert!(!snapshot.connected);
        assert_eq!(
            snapshot.last_error.map(|err| err.code),
            Some("reconnect_exhausted".to_owned())
        );
        assert_eq!(h.server.open_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_indicator_resets_instead_of_stacking() {
        let mut h = harness(Some("t"), FakeApi::default());
        let peer = accept(&mut h.server).await;
        wait_for(&h.sync, |s| s.connected).await;

        peer.push_event(&ChannelEvent::Typing);
        wait_for(&h.sync, |s| s.typing).await;
        sleep(Duration::from_secs(1)).await;
        peer.push_event(&ChannelEvent::Typing);

        sleep(Duration::from_millis(2_900)).await;
        assert!(h.sync.snapshot().typing, "still typing 2.9s after the second event");
        sleep(Duration::from_millis(200)).await;
        assert!(!h.sync.snapshot().typing, "cleared 3s after the second event");
    }

    #[tokio::test]
    async fn agent_message_clears_typing_and_is_deduplicated() {
        let mut h = harness(Some("t"), FakeApi::default());
        let peer = accept(&mut h.server).await;
        wait_for(&h.sync, |s| s.connected).await;

        peer.push_event(&ChannelEvent::Typing);
        wait_for(&h.sync, |s| s.typing).await;
        peer.push_event(&agent_message("a1", "Let me check."));
        peer.push_event(&agent_message("a1", "Let me check."));
        peer.push_event(&agent_message("a2", "Found it."));

        let snapshot = wait_for(&h.sync, |s| s.messages.len() == 2).await;
        assert!(!snapshot.typing);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(h.sync.snapshot().messages.len(), 2);
    }

    #[tokio::test]
    async fn handoff_and_error_set_banner_without_blocking_sends() {
        let mut h = harness(Some("t"), FakeApi::default());
        let peer = accept(&mut h.server).await;
        wait_for(&h.sync, |s| s.connected).await;

        peer.push_text(r#"{"type":"handoff"}"#);
        let snapshot = wait_for(&h.sync, |s| s.banner.is_some()).await;
        assert_eq!(snapshot.banner.as_deref(), Some(DEFAULT_HANDOFF_BANNER));
        assert!(snapshot.can_send);

        peer.push_text(r#"{"type":"error","message":"agent offline"}"#);
        wait_for(&h.sync, |s| s.banner.as_deref() == Some("agent offline")).await;
        h.sync.send("still there?").await.expect("send allowed");
    }

    #[tokio::test(start_paused = true)]
    async fn pending_messages_survive_drop_and_reconcile_after_reconnect() {
        let mut h = harness(Some("t"), FakeApi::default());
        let mut peer = accept(&mut h.server).await;
        wait_for(&h.sync, |s| s.connected).await;

        h.sync.send("first").await.expect("send first");
        h.sync.send("second").await.expect("send second");
        for _ in 0..2 {
            timeout(WAIT, peer.next_sent()).await.expect("frame").expect("text");
        }

        h.api.state().history = vec![
            message("m1", CONVERSATION, MessageRole::User, "first"),
            message("m2", CONVERSATION, MessageRole::User, "second"),
        ];
        peer.drop_connection();

        let snapshot = wait_for(&h.sync, |s| !s.connected).await;
        assert_eq!(pending(&snapshot), 2, "both stay visible while offline");

        let peer = accept(&mut h.server).await;
        let snapshot = wait_for(&h.sync, |s| s.connected && pending(s) == 0).await;
        assert_eq!(snapshot.messages.len(), 2);
        assert!(snapshot.messages.iter().all(|m| m.confirmed));

        peer.push_event(&ChannelEvent::MessageAdded(MessageAdded {
            id: Some("m1".into()),
            conversation_id: Some(CONVERSATION.into()),
            role: MessageRole::User,
            content: "first".into(),
            timestamp: None,
            client_id: None,
        }));
        sleep(Duration::from_millis(50)).await;
        assert_eq!(h.sync.snapshot().messages.len(), 2, "late echo is not duplicated");
    }

    #[tokio::test]
    async fn notify_typing_needs_connection() {
        let mut h = harness(Some("t"), FakeApi::default());
        let mut peer = accept(&mut h.server).await;
        wait_for(&h.sync, |s| s.connected).await;

        assert!(h.sync.notify_typing());
        let sent = timeout(WAIT, peer.next_sent()).await.expect("frame");
        assert_eq!(sent.as_deref(), Some(r#"{"type":"typing"}"#));

        h.sync.close();
        assert!(!h.sync.notify_typing());
    }
}
