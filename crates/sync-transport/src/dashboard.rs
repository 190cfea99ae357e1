use std::time::Duration;

use sync_core::{
    ChannelEvent, ConnectionState, ConversationFilter, ConversationList, ConversationQuery,
    ConversationSummary, DEFAULT_DISPLAY_WINDOW, DashboardStats, EscalationNotifier,
    NotificationSurface, Subscription, SyncError, SyncErrorCategory, Timer,
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

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    /// Fallback refresh period while the push channel is down.
    pub poll_interval: Duration,
    pub polling_enabled: bool,
    /// `limit` sent with list re-fetches.
    pub list_limit: Option<u32>,
    pub filter: ConversationFilter,
    /// How long an escalation alert counts as still on screen.
    pub display_window: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            polling_enabled: true,
            list_limit: Some(100),
            filter: ConversationFilter::default(),
            display_window: DEFAULT_DISPLAY_WINDOW,
        }
    }
}

/// Observable dashboard state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardSnapshot {
    /// Visible conversations in display order.
    pub conversations: Vec<ConversationSummary>,
    pub needs_attention: u64,
    pub connected: bool,
    /// Whether the fallback poll timer is armed.
    pub polling: bool,
    pub stats: Option<DashboardStats>,
    pub filter: ConversationFilter,
    /// Last recoverable error; cleared by a successful refresh.
    pub last_error: Option<SyncError>,
}

enum Input {
    Event(ChannelEvent),
    State(ConnectionState),
    TransportError(SyncError),
}

enum Command {
    Refresh(oneshot::Sender<Result<(), SyncError>>),
    SetFilter(ConversationFilter, oneshot::Sender<Result<(), SyncError>>),
}

/// Live conversation list for the support dashboard.
///
/// Owns one task that merges push events, re-fetches from the REST API and
/// polls while the push channel is down. Dropping the handle tears it all
/// down.
pub struct DashboardSync<C: Connector> {
    transport: TransportClient<C>,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<DashboardSnapshot>,
    subscriptions: Vec<Subscription>,
    task: Option<JoinHandle<()>>,
}

impl<C: Connector> DashboardSync<C> {
    pub fn spawn<A, S>(
        transport: TransportClient<C>,
        api: A,
        surface: S,
        config: DashboardConfig,
    ) -> Self
    where
        A: SupportApi,
        S: NotificationSurface + 'static,
    {
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

        let initial = DashboardSnapshot {
            filter: config.filter.clone(),
            ..DashboardSnapshot::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let task = DashboardTask {
            transport: transport.clone(),
            api,
            notifier: EscalationNotifier::new(surface, config.display_window),
            list: ConversationList::new(config.filter.clone()),
            poll: Timer::repeating(config.poll_interval),
            config,
            stats: None,
            connected: false,
            resync_on_connect: false,
            last_error: None,
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(task.run(input_rx, command_rx));

        Self {
            transport,
            commands: command_tx,
            snapshot: snapshot_rx,
            subscriptions,
            task: Some(task),
        }
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DashboardSnapshot> {
        self.snapshot.clone()
    }

    /// Re-fetch the list and stats from the server.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Command::Refresh(reply_tx), reply_rx).await
    }

    /// Swap the filter predicate and re-fetch.
    pub async fn set_filter(&self, filter: ConversationFilter) -> Result<(), SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request(Command::SetFilter(filter, reply_tx), reply_rx)
            .await
    }

    /// Unsubscribe, disconnect and stop every timer. Idempotent.
    pub fn close(&mut self) {
        self.subscriptions.clear();
        self.transport.disconnect();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("dashboard synchronizer closed");
        }
    }

    async fn request(
        &self,
        command: Command,
        reply: oneshot::Receiver<Result<(), SyncError>>,
    ) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| closed_error())?;
        reply.await.map_err(|_| closed_error())?
    }
}

impl<C: Connector> Drop for DashboardSync<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error() -> SyncError {
    SyncError::new(
        SyncErrorCategory::Internal,
        "synchronizer_closed",
        "dashboard synchronizer is no longer running",
    )
}

struct DashboardTask<C, A, S> {
    transport: TransportClient<C>,
    api: A,
    notifier: EscalationNotifier<S>,
    config: DashboardConfig,
    list: ConversationList,
    stats: Option<DashboardStats>,
    poll: Timer,
    connected: bool,
    /// Set when a live channel dropped; the next open re-fetches.
    resync_on_connect: bool,
    last_error: Option<SyncError>,
    snapshot: watch::Sender<DashboardSnapshot>,
}

impl<C, A, S> DashboardTask<C, A, S>
where
    C: Connector,
    A: SupportApi,
    S: NotificationSurface,
{
    async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<Input>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        // Connectivity follows the queued state events; only arm polling here.
        if !self.transport.connect().await.is_connected() {
            self.set_connected(false);
        }
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "initial dashboard fetch failed");
        }

        loop {
            tokio::select! {
                Some(input) = inputs.recv() => self.handle_input(input).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = self.poll.fired() => {
                    debug!("fallback poll");
                    if let Err(err) = self.refresh().await {
                        debug!(error = %err, "fallback poll failed");
                    }
                }
            }
        }
        debug!("dashboard task finished");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Refresh(reply) => {
                let _ = reply.send(self.refresh().await);
            }
            Command::SetFilter(filter, reply) => {
                debug!(?filter, "dashboard filter changed");
                self.list.set_filter(filter);
                self.publish();
                let _ = reply.send(self.refresh().await);
            }
        }
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Event(event) => self.handle_event(event).await,
            Input::State(state) => {
                let resync = state.is_connected() && self.resync_on_connect;
                if self.connected && !state.is_connected() {
                    self.resync_on_connect = true;
                }
                self.set_connected(state.is_connected());
                self.publish();
                if resync {
                    self.resync_on_connect = false;
                    info!("push channel back; re-fetching dashboard");
                    if let Err(err) = self.refresh().await {
                        warn!(error = %err, "dashboard re-fetch after reconnect failed");
                    }
                }
            }
            Input::TransportError(err) => {
                self.last_error = Some(err);
                self.publish();
            }
        }
    }

    async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::ConversationUpdated { conversation } => {
                self.list.apply_update(conversation);
                self.publish();
            }
            ChannelEvent::ConversationEscalated {
                conversation,
                reason,
            } => {
                info!(conversation_id = %conversation.id, "conversation escalated");
                self.notifier.notify(&conversation, reason.as_deref()).await;
                if let Err(err) = self.refresh().await {
                    warn!(error = %err, "re-fetch after escalation failed");
                }
            }
            ChannelEvent::StatsUpdated { stats } => {
                self.list.apply_stats(&stats);
                self.stats = Some(stats);
                self.publish();
            }
            ChannelEvent::Error { message } => {
                warn!(%message, "server reported an error on the dashboard channel");
                self.last_error = Some(SyncError::new(
                    SyncErrorCategory::Protocol,
                    "server_error",
                    message,
                ));
                self.publish();
            }
            other => trace!(kind = other.kind(), "dashboard ignores event"),
        }
    }

    /// Authoritative re-fetch; overwrites the derived view wholesale.
    async fn refresh(&mut self) -> Result<(), SyncError> {
        let query = ConversationQuery {
            status: None,
            agent_id: self.list.filter().agent_id.clone(),
            limit: self.config.list_limit,
        };

        let outcome = match self.api.list_conversations(&query).await {
            Ok(conversations) => {
                self.list.replace_all(conversations);
                match self.api.fetch_stats().await {
                    Ok(stats) => {
                        self.list.apply_stats(&stats);
                        self.stats = Some(stats);
                    }
                    Err(err) => warn!(error = %err, "stats fetch failed; keeping previous stats"),
                }
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "conversation list fetch failed");
                self.last_error = Some(err.clone());
                Err(err)
            }
        };
        self.publish();
        outcome
    }

    fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if connected {
            self.poll.stop();
        } else if self.config.polling_enabled {
            self.poll.start(self.config.poll_interval);
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(DashboardSnapshot {
            conversations: self.list.items().to_vec(),
            needs_attention: self.list.needs_attention(),
            connected: self.connected,
            polling: self.poll.is_active(),
            stats: self.stats.clone(),
            filter: self.list.filter().clone(),
            last_error: self.last_error.clone(),
        });
    }
}
