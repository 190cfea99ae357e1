use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use sync_core::{
    ABNORMAL_CLOSURE, ChannelEvent, CloseDecision, ConnectionState, ConnectionStateMachine,
    NORMAL_CLOSURE, OutboundFrame, ReconnectPolicy, Subject, Subscription, SyncError,
    SyncErrorCategory, Timer, decode_frame, encode_frame,
};
use sync_platform::CredentialSource;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

/// One inbound item read from an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    /// The peer closed the channel with this code.
    Closed(u16),
}

/// An open, bidirectional frame channel.
pub trait FrameConnection: Send + 'static {
    /// Next inbound frame; `None` once the stream is gone without a close
    /// frame. Must be cancel-safe.
    fn recv(&mut self) -> impl Future<Output = Option<WireFrame>> + Send;

    fn send(&mut self, text: String) -> impl Future<Output = Result<(), SyncError>> + Send;

    fn close(&mut self, code: u16) -> impl Future<Output = ()> + Send;
}

/// Opens frame channels to a URL.
pub trait Connector: Send + Sync + 'static {
    type Conn: FrameConnection;

    fn open(&self, url: &Url) -> impl Future<Output = Result<Self::Conn, SyncError>> + Send;
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Channel URL without credential.
    pub url: Url,
    pub reconnect: ReconnectPolicy,
}

impl TransportConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// `<ws base>/ws/dashboard`
    pub fn dashboard(ws_base: &Url) -> Result<Self, SyncError> {
        Ok(Self::new(join_path(ws_base, &["ws", "dashboard"])?))
    }

    /// `<ws base>/ws/chat/<conversation id>`
    pub fn chat(ws_base: &Url, conversation_id: &str) -> Result<Self, SyncError> {
        Ok(Self::new(join_path(ws_base, &["ws", "chat", conversation_id])?))
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

pub(crate) fn join_path(base: &Url, segments: &[&str]) -> Result<Url, SyncError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| {
            SyncError::new(
                SyncErrorCategory::Config,
                "invalid_base_url",
                format!("cannot append a path to '{base}'"),
            )
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// State shared between the client handles and the running session task.
struct Link<C> {
    connector: C,
    config: TransportConfig,
    machine: Mutex<ConnectionStateMachine>,
    messages: Subject<ChannelEvent>,
    errors: Subject<SyncError>,
    states: Subject<ConnectionState>,
}

impl<C> Link<C> {
    /// Apply `f` to the state machine unless `stop` fired, and publish the
    /// resulting connection state if it changed.
    fn update<R>(
        &self,
        stop: &CancellationToken,
        f: impl FnOnce(&mut ConnectionStateMachine) -> R,
    ) -> Option<R> {
        let (result, before, after) = {
            let mut machine = lock(&self.machine);
            if stop.is_cancelled() {
                return None;
            }
            let before = machine.connection_state();
            let result = f(&mut machine);
            (result, before, machine.connection_state())
        };
        if before != after {
            self.states.emit(&after);
        }
        Some(result)
    }

    fn report(&self, stop: &CancellationToken, err: &SyncError) {
        if !stop.is_cancelled() {
            self.errors.emit(err);
        }
    }

    fn deliver(&self, stop: &CancellationToken, event: &ChannelEvent) {
        if !stop.is_cancelled() {
            self.messages.emit(event);
        }
    }
}

struct Session {
    stop: CancellationToken,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

struct Shared<C> {
    link: Arc<Link<C>>,
    credentials: Arc<dyn CredentialSource>,
    session: Mutex<Option<Session>>,
}

impl<C> Drop for Shared<C> {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.stop.cancel();
        }
    }
}

/// Reconnecting push-channel client.
///
/// Cloning yields another handle to the same channel. The live session
/// stops when [`TransportClient::disconnect`] is called or the last handle
/// is dropped.
pub struct TransportClient<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for TransportClient<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C> fmt::Debug for TransportClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("url", &self.shared.link.config.url.as_str())
            .field("state", &lock(&self.shared.link.machine).connection_state())
            .finish()
    }
}

impl<C: Connector> TransportClient<C> {
    pub fn new(
        connector: C,
        config: TransportConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let machine = ConnectionStateMachine::new(config.reconnect);
        Self {
            shared: Arc::new(Shared {
                link: Arc::new(Link {
                    connector,
                    config,
                    machine: Mutex::new(machine),
                    messages: Subject::new(),
                    errors: Subject::new(),
                    states: Subject::new(),
                }),
                credentials,
                session: Mutex::new(None),
            }),
        }
    }

    /// Open the channel and resolve once the first attempt completed.
    ///
    /// Without a credential this is a no-op, as is calling it while a
    /// session is still live. An explicit call forgets earlier reconnect
    /// failures.
    pub async fn connect(&self) -> ConnectionState {
        let Some(token) = self.shared.credentials.credential() else {
            debug!(url = %self.shared.link.config.url, "no credential available; connect skipped");
            return self.state();
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut session = lock(&self.shared.session);
            if session.as_ref().is_some_and(|live| !live.task.is_finished()) {
                debug!("push channel session already running");
                return self.state();
            }
            lock(&self.shared.link.machine).reset_attempts();

            let stop = CancellationToken::new();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let url = channel_url(&self.shared.link.config.url, &token);
            let task = tokio::spawn(run_session(
                Arc::clone(&self.shared.link),
                url,
                stop.clone(),
                outbound_rx,
                ready_tx,
            ));
            *session = Some(Session {
                stop,
                outbound: outbound_tx,
                task,
            });
        }

        let _ = ready_rx.await;
        self.state()
    }

    /// Close with the normal-closure code and cancel any pending reconnect.
    ///
    /// The only callback fired afterwards for this session is the final
    /// `Disconnected` state change.
    pub fn disconnect(&self) {
        let Some(session) = lock(&self.shared.session).take() else {
            return;
        };

        let was = {
            let mut machine = lock(&self.shared.link.machine);
            session.stop.cancel();
            let was = machine.connection_state();
            machine.on_manual_close();
            was
        };
        info!(url = %self.shared.link.config.url, "push channel disconnected");
        if was != ConnectionState::Disconnected {
            self.shared.link.states.emit(&ConnectionState::Disconnected);
        }
    }

    /// Queue a frame on the open channel; `false` when not connected.
    pub fn send(&self, frame: &OutboundFrame) -> bool {
        if !self.state().is_connected() {
            debug!(url = %self.shared.link.config.url, "send skipped; channel not connected");
            return false;
        }

        let text = match encode_frame(frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound frame");
                return false;
            }
        };

        lock(&self.shared.session)
            .as_ref()
            .is_some_and(|session| session.outbound.send(text).is_ok())
    }

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.shared.link.messages.subscribe(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncError) + Send + Sync + 'static,
    {
        self.shared.link.errors.subscribe(handler)
    }

    pub fn on_connection_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.shared.link.states.subscribe(handler)
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.link.machine).connection_state()
    }

    /// Consecutive abnormal closures since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.shared.link.machine).attempts()
    }

    pub fn is_exhausted(&self) -> bool {
        lock(&self.shared.link.machine).is_exhausted()
    }
}

fn channel_url(base: &Url, token: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("token", token);
    url
}

fn signal_ready(ready: &mut Option<oneshot::Sender<()>>) {
    if let Some(ready) = ready.take() {
        let _ = ready.send(());
    }
}

async fn run_session<C: Connector>(
    link: Arc<Link<C>>,
    url: Url,
    stop: CancellationToken,
    mut outbound: mpsc::UnboundedReceiver<String>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut reconnect = Timer::one_shot();
    let target = link.config.url.clone();

    loop {
        match link.update(&stop, ConnectionStateMachine::begin_connect) {
            None => break,
            Some(Err(err)) => {
                warn!(error = %err, "push channel session in unexpected phase");
                break;
            }
            Some(Ok(())) => {}
        }

        debug!(url = %target, "opening push channel");
        let opened = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            opened = link.connector.open(&url) => opened,
        };

        let code = match opened {
            Ok(mut conn) => {
                match link.update(&stop, ConnectionStateMachine::on_open) {
                    None => {
                        conn.close(NORMAL_CLOSURE).await;
                        break;
                    }
                    Some(Err(err)) => warn!(error = %err, "open reported in unexpected phase"),
                    Some(Ok(())) => info!(url = %target, "push channel open"),
                }
                signal_ready(&mut ready);

                match pump(&link, &mut conn, &stop, &mut outbound).await {
                    Some(code) => {
                        if code != NORMAL_CLOSURE {
                            link.report(
                                &stop,
                                &SyncError::new(
                                    SyncErrorCategory::Network,
                                    "channel_closed",
                                    format!("push channel closed abnormally (code {code})"),
                                ),
                            );
                        }
                        code
                    }
                    None => {
                        conn.close(NORMAL_CLOSURE).await;
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(url = %target, error = %err, "push channel open failed");
                link.report(&stop, &err);
                ABNORMAL_CLOSURE
            }
        };

        let decision = link.update(&stop, |machine| machine.on_close(code));
        signal_ready(&mut ready);
        let Some(decision) = decision else {
            break;
        };

        match decision {
            CloseDecision::Idle => {
                info!(url = %target, "push channel closed normally");
                break;
            }
            CloseDecision::Reconnect { attempt, delay } => {
                info!(
                    url = %target,
                    code,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "push channel reconnect scheduled"
                );
                reconnect.reset(delay);
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = reconnect.fired() => {}
                }
            }
            CloseDecision::Exhausted { attempts } => {
                warn!(url = %target, attempts, "push channel reconnect attempts exhausted");
                link.report(
                    &stop,
                    &SyncError::new(
                        SyncErrorCategory::Network,
                        "reconnect_exhausted",
                        format!("gave up after {attempts} consecutive failures"),
                    ),
                );
                break;
            }
        }
    }

    trace!(url = %target, "push channel session finished");
}

/// Drive one open connection. Returns the close code, or `None` when the
/// session was stopped locally.
async fn pump<C, T: FrameConnection>(
    link: &Link<C>,
    conn: &mut T,
    stop: &CancellationToken,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) -> Option<u16> {
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return None,
            Some(text) = outbound.recv() => {
                if let Err(err) = conn.send(text).await {
                    warn!(error = %err, "push channel write failed");
                    return Some(ABNORMAL_CLOSURE);
                }
            }
            frame = conn.recv() => match frame {
                Some(WireFrame::Text(text)) => match decode_frame(&text) {
                    Ok(ChannelEvent::Ping) => {
                        trace!("ping received; answering");
                        let pong = match encode_frame(&OutboundFrame::Pong) {
                            Ok(pong) => pong,
                            Err(err) => {
                                warn!(error = %err, "failed to encode pong");
                                continue;
                            }
                        };
                        if let Err(err) = conn.send(pong).await {
                            warn!(error = %err, "push channel write failed");
                            return Some(ABNORMAL_CLOSURE);
                        }
                    }
                    Ok(event) => {
                        trace!(kind = event.kind(), "push event received");
                        link.deliver(stop, &event);
                    }
                    Err(err) => warn!(error = %err, "dropping malformed frame"),
                },
                Some(WireFrame::Closed(code)) => return Some(code),
                None => return Some(ABNORMAL_CLOSURE),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
