//! Session Manager
//!
//! Owns the single upstream connection. One background task drives the session
//! state machine (`SessionState::on`): create session, open the stream,
//! resubscribe, then read until the connection fails, the stream goes quiet for
//! longer than the stale timeout, or shutdown is requested. Connect attempts go
//! through the upstream circuit breaker; between attempts the task backs off
//! exponentially. Renewal happens in place on the live socket.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::fanout::FanoutDistributor;
use super::protocol::{self, ControlFrame, UpstreamFrame};
use super::provider::{MarketDataProvider, UpstreamStream};
use super::registry::UpstreamControl;
use crate::cache::QuoteCache;
use crate::config::UpstreamConfig;
use crate::coordination::{
    backoff_delay, CircuitBreaker, Clock, SharedClock, ShutdownSignal, ShutdownToken,
};
use crate::domain::{Quote, Session, SessionEvent, SessionState};
use crate::error::{QuoteflowError, Result};
use crate::services::Metrics;

pub type QuoteCallback = Arc<dyn Fn(&Quote) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ControlCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Desired upstream symbol set plus the command channel into the session task.
///
/// Created before the session manager so the registry can hold it without a
/// reference cycle through the fan-out distributor.
pub struct SessionControl {
    desired: Mutex<BTreeSet<String>>,
    tx: mpsc::UnboundedSender<ControlCommand>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ControlCommand>>>,
    metrics: Arc<Metrics>,
}

impl SessionControl {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            desired: Mutex::new(BTreeSet::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            metrics,
        }
    }

    fn desired(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.desired.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn desired_symbols(&self) -> Vec<String> {
        self.desired().iter().cloned().collect()
    }

    pub fn is_desired(&self, symbol: &str) -> bool {
        self.desired().contains(symbol)
    }

    fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<ControlCommand>> {
        self.rx.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Symbols for the initial subscribe of a new connection. Queued commands
    /// are discarded under the lock that orders them against the desired set,
    /// so a symbol lands either in the snapshot or in a later command, never both.
    fn snapshot_for_connect(
        &self,
        commands: &mut mpsc::UnboundedReceiver<ControlCommand>,
    ) -> Vec<String> {
        let desired = self.desired();
        while commands.try_recv().is_ok() {}
        desired.iter().cloned().collect()
    }
}

// Commands are sent while the desired-set lock is held.
impl UpstreamControl for SessionControl {
    fn subscribe(&self, symbol: &str) {
        let mut desired = self.desired();
        if desired.insert(symbol.to_string()) {
            self.metrics
                .upstream_subscribes
                .fetch_add(1, Ordering::Relaxed);
            // Receiver lives as long as the session manager; a send error only means it is gone
            let _ = self.tx.send(ControlCommand::Subscribe(symbol.to_string()));
        }
    }

    fn unsubscribe(&self, symbol: &str) {
        let mut desired = self.desired();
        if desired.remove(symbol) {
            self.metrics
                .upstream_unsubscribes
                .fetch_add(1, Ordering::Relaxed);
            let _ = self.tx.send(ControlCommand::Unsubscribe(symbol.to_string()));
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub renew_before: chrono::Duration,
    pub stale_timeout: Duration,
    pub ping_interval: Duration,
    /// Symbols warmed from the cache backend after every (re)connect
    pub warm_symbols: Vec<String>,
}

impl SessionSettings {
    pub fn from_config(config: &UpstreamConfig, warm_symbols: Vec<String>) -> Self {
        Self {
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            renew_before: chrono::Duration::seconds(config.renew_before_expiry_secs as i64),
            stale_timeout: Duration::from_secs(config.stale_stream_timeout_secs),
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            warm_symbols,
        }
    }
}

/// Why the read loop ended
enum StreamExit {
    Shutdown,
    Closed,
    Failed(QuoteflowError),
}

pub struct SessionManager {
    provider: Arc<dyn MarketDataProvider>,
    control: Arc<SessionControl>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<QuoteCache>,
    fanout: Arc<FanoutDistributor>,
    callbacks: RwLock<Vec<QuoteCallback>>,
    session: RwLock<Option<Session>>,
    state_tx: watch::Sender<SessionState>,
    settings: SessionSettings,
    clock: SharedClock,
    metrics: Arc<Metrics>,
    shutdown: ShutdownSignal,
    running: AtomicBool,
    connect_attempts: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        control: Arc<SessionControl>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<QuoteCache>,
        fanout: Arc<FanoutDistributor>,
        settings: SessionSettings,
        clock: SharedClock,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            provider,
            control,
            breaker,
            cache,
            fanout,
            callbacks: RwLock::new(Vec::new()),
            session: RwLock::new(None),
            state_tx,
            settings,
            clock,
            metrics,
            shutdown: ShutdownSignal::new(),
            running: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Currently active session, if connected
    pub fn active_session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Number of connect attempts made so far (successful or not)
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self, symbol: &str) {
        self.control.subscribe(symbol);
    }

    pub fn unsubscribe(&self, symbol: &str) {
        self.control.unsubscribe(symbol);
    }

    /// Register a callback invoked for every normalized quote, after fan-out
    pub fn on_quote<F>(&self, callback: F)
    where
        F: Fn(&Quote) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(callback));
    }

    /// Start the connection task. Calling it again while running is a no-op.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(QuoteflowError::Cancelled);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Session manager already running");
            return Ok(());
        }
        let commands = self.control.take_receiver().ok_or_else(|| {
            QuoteflowError::Internal("session control channel already consumed".into())
        })?;

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.run(commands).await;
        });
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    /// Cancel reconnect attempts, close the stream and wait for the task to finish
    pub async fn shutdown(&self) {
        self.shutdown.trigger("session manager shutdown");
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                warn!("Session task did not stop within 10s");
            }
        }
        self.clear_session();
        self.transition(SessionEvent::Shutdown);
    }

    fn transition(&self, event: SessionEvent) -> SessionState {
        let current = self.state();
        match current.on(event) {
            Ok(next) => {
                if next != current {
                    debug!(from = %current, to = %next, "Session state transition");
                }
                self.state_tx.send_replace(next);
                next
            }
            Err(e) => {
                error!("Session state machine bug: {}", e);
                current
            }
        }
    }

    fn set_session(&self, session: Session) {
        *self.session.write().unwrap_or_else(|p| p.into_inner()) = Some(session);
    }

    fn clear_session(&self) {
        *self.session.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    async fn run(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<ControlCommand>) {
        let mut shutdown = self.shutdown.token();
        let mut failures: u32 = 0;
        self.transition(SessionEvent::Connect);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let permit = match self.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    self.transition(SessionEvent::ConnectionFailed);
                    warn!(
                        retry_in_ms = open.retry_after.as_millis() as u64,
                        "Upstream circuit open, skipping reconnect until cooldown elapses"
                    );
                    if !self.pause(open.retry_after, &mut shutdown).await {
                        break;
                    }
                    self.transition(SessionEvent::Retry);
                    continue;
                }
            };

            self.connect_attempts.fetch_add(1, Ordering::Relaxed);
            let attempt = tokio::select! {
                result = self.establish(&mut commands) => result,
                _ = shutdown.cancelled() => break,
            };

            let exit = match attempt {
                Ok((session, stream)) => {
                    permit.success();
                    failures = 0;
                    self.metrics
                        .upstream_connects
                        .fetch_add(1, Ordering::Relaxed);
                    self.set_session(session.clone());
                    self.transition(SessionEvent::Authenticated);
                    info!(
                        symbols = self.control.desired_symbols().len(),
                        expires_at = %session.expires_at,
                        "Upstream session connected"
                    );

                    self.warm_cache().await;
                    self.read_loop(session, stream, &mut commands, &mut shutdown)
                        .await
                }
                Err(e) => {
                    permit.failure();
                    self.metrics
                        .upstream_connect_failures
                        .fetch_add(1, Ordering::Relaxed);
                    StreamExit::Failed(e)
                }
            };

            self.clear_session();
            match exit {
                StreamExit::Shutdown => break,
                StreamExit::Closed => info!("Upstream stream closed, reconnecting"),
                StreamExit::Failed(e) if e.is_transient() => warn!(
                    breaker = %self.breaker.state(),
                    "Upstream connection error: {}",
                    e
                ),
                // Retried like any other failure, but needs an operator to look
                StreamExit::Failed(e) => error!(
                    breaker = %self.breaker.state(),
                    "Upstream connection failed with non-transient error: {}",
                    e
                ),
            }

            self.transition(SessionEvent::ConnectionFailed);
            failures = failures.saturating_add(1);
            let delay = backoff_delay(self.settings.backoff_base, self.settings.backoff_max, failures);
            debug!(attempt = failures, delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
            if !self.pause(delay, &mut shutdown).await {
                break;
            }
            self.transition(SessionEvent::Retry);
        }

        self.clear_session();
        self.transition(SessionEvent::Shutdown);
        info!("Session manager stopped");
    }

    /// Sleep unless shutdown fires first. Returns false on shutdown.
    async fn pause(&self, delay: Duration, shutdown: &mut ShutdownToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.cancelled() => false,
        }
    }

    /// Connecting → Authenticating → stream open with the desired set subscribed
    async fn establish(
        &self,
        commands: &mut mpsc::UnboundedReceiver<ControlCommand>,
    ) -> Result<(Session, Box<dyn UpstreamStream>)> {
        let grant = self.provider.create_session().await?;
        self.transition(SessionEvent::SessionCreated);
        let session = Session::from_grant(grant, self.clock.utc_now(), self.settings.renew_before);

        let mut stream = self.provider.open_stream(&session).await?;

        let symbols = self.control.snapshot_for_connect(commands);
        if !symbols.is_empty() {
            stream.send(&ControlFrame::Subscribe { symbols }).await?;
        }

        Ok((session, stream))
    }

    async fn warm_cache(&self) {
        let mut symbols = self.control.desired_symbols();
        for s in &self.settings.warm_symbols {
            if !symbols.contains(s) {
                symbols.push(s.clone());
            }
        }
        if !symbols.is_empty() {
            self.cache.warm(&symbols).await;
        }
    }

    async fn read_loop(
        &self,
        mut session: Session,
        mut stream: Box<dyn UpstreamStream>,
        commands: &mut mpsc::UnboundedReceiver<ControlCommand>,
        shutdown: &mut ShutdownToken,
    ) -> StreamExit {
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + self.settings.ping_interval,
            self.settings.ping_interval,
        );
        let stale = tokio::time::sleep(self.settings.stale_timeout);
        tokio::pin!(stale);
        let renewal = tokio::time::sleep(session.until_renewal(self.clock.utc_now()));
        tokio::pin!(renewal);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    stream.close().await;
                    return StreamExit::Shutdown;
                }

                msg = stream.next_message() => match msg {
                    Some(Ok(text)) => {
                        stale.as_mut().reset(tokio::time::Instant::now() + self.settings.stale_timeout);
                        if let Err(e) = self.handle_message(&text) {
                            stream.close().await;
                            return StreamExit::Failed(e);
                        }
                    }
                    Some(Err(QuoteflowError::ProtocolParse(detail))) => {
                        self.metrics.inc_malformed();
                        warn!("Dropping malformed upstream message: {}", detail);
                    }
                    Some(Err(e)) => return StreamExit::Failed(e),
                    None => return StreamExit::Closed,
                },

                Some(cmd) = commands.recv() => {
                    let frame = match cmd {
                        ControlCommand::Subscribe(symbol) if self.control.is_desired(&symbol) => {
                            Some(ControlFrame::Subscribe { symbols: vec![symbol] })
                        }
                        ControlCommand::Unsubscribe(symbol) if !self.control.is_desired(&symbol) => {
                            Some(ControlFrame::Unsubscribe { symbols: vec![symbol] })
                        }
                        _ => None,
                    };
                    if let Some(frame) = frame {
                        debug!(?frame, "Sending control frame");
                        if let Err(e) = stream.send(&frame).await {
                            return StreamExit::Failed(e);
                        }
                    }
                }

                _ = ping.tick() => {
                    if let Err(e) = stream.ping().await {
                        return StreamExit::Failed(e);
                    }
                }

                _ = &mut stale => {
                    self.metrics
                        .stale_stream_disconnects
                        .fetch_add(1, Ordering::Relaxed);
                    stream.close().await;
                    return StreamExit::Failed(QuoteflowError::TransientUpstream(format!(
                        "no upstream data for {:?}",
                        self.settings.stale_timeout
                    )));
                }

                _ = &mut renewal => {
                    match self.renew(&session, stream.as_mut()).await {
                        Ok(renewed) => {
                            session = renewed;
                            renewal.as_mut().reset(
                                tokio::time::Instant::now() + session.until_renewal(self.clock.utc_now()),
                            );
                        }
                        Err(e) => {
                            stream.close().await;
                            return StreamExit::Failed(e);
                        }
                    }
                }
            }
        }
    }

    /// Connected → Renewing → Connected, re-authenticating on the live socket
    async fn renew(&self, current: &Session, stream: &mut dyn UpstreamStream) -> Result<Session> {
        self.transition(SessionEvent::RenewalDue);
        let grant = self.provider.refresh_session(current).await?;
        let session = Session::from_grant(grant, self.clock.utc_now(), self.settings.renew_before);
        stream
            .send(&ControlFrame::Auth {
                token: session.token.clone(),
            })
            .await?;

        self.set_session(session.clone());
        self.transition(SessionEvent::Renewed);
        self.metrics
            .session_renewals
            .fetch_add(1, Ordering::Relaxed);
        info!(expires_at = %session.expires_at, "Upstream session renewed");
        Ok(session)
    }

    /// Parse one upstream message. Parse errors are dropped per frame; an
    /// authentication error from the provider ends the connection.
    fn handle_message(&self, text: &str) -> Result<()> {
        for frame in protocol::decode(text) {
            match frame {
                Ok(UpstreamFrame::Error(e)) => {
                    if e.is_auth_error() {
                        return Err(QuoteflowError::Authentication(e.message));
                    }
                    warn!(code = ?e.code, "Upstream reported error: {}", e.message);
                }
                Ok(frame) => self.process_frame(frame),
                Err(e) => {
                    self.metrics.inc_malformed();
                    warn!("Dropping malformed upstream frame: {}", e);
                }
            }
        }
        Ok(())
    }

    fn process_frame(&self, frame: UpstreamFrame) {
        let Some(symbol) = frame.symbol().map(str::to_string) else {
            return;
        };
        match &frame {
            UpstreamFrame::Quote(_) => self.metrics.inc_quotes(),
            UpstreamFrame::Trade(_) => {
                self.metrics.trades_received.fetch_add(1, Ordering::Relaxed);
            }
            UpstreamFrame::Summary(_) => {
                self.metrics
                    .summaries_received
                    .fetch_add(1, Ordering::Relaxed);
            }
            UpstreamFrame::Error(_) => {}
        }

        let previous = self.cache.peek(&symbol).map(|(q, _)| q);
        let Some(quote) = frame.merge_into(previous.as_ref(), self.clock.utc_now()) else {
            return;
        };

        self.cache.set_local(&symbol, quote.clone());
        self.fanout.publish(&symbol, &quote);

        let callbacks: Vec<QuoteCallback> = self
            .callbacks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for callback in callbacks {
            callback(&quote);
        }

        self.cache.persist_in_background(&symbol, quote);
    }
}
