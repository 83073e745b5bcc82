//! The gate controller decides, once per fetch cycle, whether the app shows
//! the web destination, the notification prompt in front of it, or falls
//! back to the native experience.
//!
//! All state lives in a single worker task. Triggers arrive over a command
//! channel, the worker runs at most one fetch cycle at a time and publishes
//! every change on a watch channel.

use crate::client::{DeviceContext, RemoteConfigResponse, RoutingSource};
use crate::config::{DeviceProfile, GateTimings};
use crate::errors::FetchError;
use crate::metrics_defs::{CONFIG_FETCH_DURATION, CONFIG_FETCH_OUTCOME, GATE_ROUTE, GATE_TRIGGERS};
use crate::policy::{NotificationGatePolicy, PermissionStatus};
use crate::push_token::PushTokenStore;
use attribution::{AttributionAggregator, AttributionEvent};
use shared::{counter, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use url::Url;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateState {
    Loading,
    /// Show the notification prompt, then the destination.
    NotificationPrompt(Url),
    /// Terminal for the process lifetime.
    Web(Url),
    Native,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Loading => "loading",
            GateState::NotificationPrompt(_) => "notification_prompt",
            GateState::Web(_) => "web",
            GateState::Native => "native",
        }
    }

    pub fn is_web(&self) -> bool {
        matches!(self, GateState::Web(_))
    }

    pub fn destination(&self) -> Option<&Url> {
        match self {
            GateState::NotificationPrompt(url) | GateState::Web(url) => Some(url),
            GateState::Loading | GateState::Native => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateStatus {
    pub state: GateState,
    /// Set when the last fetch failed on connectivity. Cleared when the next
    /// cycle starts.
    pub loading_error: bool,
}

impl Default for GateStatus {
    fn default() -> Self {
        GateStatus {
            state: GateState::Loading,
            loading_error: false,
        }
    }
}

impl GateStatus {
    /// A route was decided or the gate is waiting for a connectivity retry.
    pub fn is_settled(&self) -> bool {
        self.loading_error || self.state != GateState::Loading
    }
}

/// Everything the controller needs from the rest of the app.
pub struct GateDeps {
    pub routing: Arc<dyn RoutingSource>,
    pub policy: Arc<NotificationGatePolicy>,
    pub device: DeviceProfile,
    pub push_tokens: PushTokenStore,
    /// Attribution updates re-trigger the gate when present.
    pub attribution: Option<AttributionAggregator>,
}

#[derive(Debug)]
enum Command {
    Start,
    AttributionChanged,
    Foreground,
    Restart,
    AcceptPrompt(oneshot::Sender<Option<PermissionStatus>>),
    DeclinePrompt(oneshot::Sender<bool>),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::AttributionChanged => "attribution_changed",
            Command::Foreground => "foreground",
            Command::Restart => "restart",
            Command::AcceptPrompt(_) => "accept_prompt",
            Command::DeclinePrompt(_) => "decline_prompt",
        }
    }
}

struct ControllerInner {
    tx: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<GateStatus>,
    worker: JoinHandle<()>,
    bridge: Option<JoinHandle<()>>,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        self.worker.abort();
        if let Some(bridge) = &self.bridge {
            bridge.abort();
        }
    }
}

/// Handle to the gate worker. Cheap to clone; the worker stops when the last
/// handle is dropped.
#[derive(Clone)]
pub struct GateController {
    inner: Arc<ControllerInner>,
}

impl GateController {
    /// Spawns the worker onto the current tokio runtime.
    pub fn spawn(deps: GateDeps, timings: GateTimings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(GateStatus::default());

        let bridge = deps
            .attribution
            .as_ref()
            .map(|aggregator| tokio::spawn(forward_attribution_events(aggregator.subscribe(), tx.clone())));

        let worker = Worker {
            routing: deps.routing,
            policy: deps.policy,
            device: deps.device,
            push_tokens: deps.push_tokens,
            timings,
            status: status_tx,
            started: false,
            follow_up: false,
            superseded: false,
        };
        let worker = tokio::spawn(worker.run(rx));

        GateController {
            inner: Arc::new(ControllerInner {
                tx,
                status: status_rx,
                worker,
                bridge,
            }),
        }
    }

    /// Begins the first fetch cycle. Later calls are no-ops.
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// Re-evaluates after the debounce window. Usually driven by the
    /// attribution aggregator, but can be signalled directly.
    pub fn attribution_changed(&self) {
        self.send(Command::AttributionChanged);
    }

    pub fn foreground(&self) {
        self.send(Command::Foreground);
    }

    /// Returns to loading and fetches again, unless the destination is
    /// already shown.
    pub fn restart(&self) {
        self.send(Command::Restart);
    }

    /// Shows the destination right away and requests notification
    /// permission. Resolves with the permission result, or `None` when no
    /// prompt was showing.
    pub async fn accept_prompt(&self) -> Option<PermissionStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::AcceptPrompt(tx));
        rx.await.ok().flatten()
    }

    /// Starts the prompt cooldown and shows the destination. Returns false
    /// when no prompt was showing.
    pub async fn decline_prompt(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.send(Command::DeclinePrompt(tx));
        rx.await.unwrap_or(false)
    }

    pub fn status(&self) -> GateStatus {
        self.inner.status.borrow().clone()
    }

    pub fn state(&self) -> GateState {
        self.inner.status.borrow().state.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GateStatus> {
        self.inner.status.clone()
    }

    /// Waits until the published status satisfies `predicate`.
    pub async fn wait_until(&self, mut predicate: impl FnMut(&GateStatus) -> bool) -> GateStatus {
        let mut status = self.subscribe();
        match status.wait_for(|s| predicate(s)).await {
            Ok(matched) => matched.clone(),
            // The worker is gone; nothing will change any more
            Err(_) => self.status(),
        }
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.inner.tx.send(command) {
            tracing::warn!(command = e.0.name(), "Gate worker is not running");
        }
    }
}

async fn forward_attribution_events(
    mut events: broadcast::Receiver<AttributionEvent>,
    tx: mpsc::UnboundedSender<Command>,
) {
    loop {
        match events.recv().await {
            Ok(AttributionEvent::FragmentMerged { new_keys: 0, .. }) => {}
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                if tx.send(Command::AttributionChanged).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

type Cycle = Pin<Box<dyn Future<Output = Decision> + Send>>;

#[derive(Debug)]
enum Decision {
    Route(GateState),
    /// Connectivity failure. Keep the route and wait for a retry trigger.
    Retry(FetchError),
}

enum Wakeup {
    Command(Option<Command>),
    CycleSettled(Decision),
    DebounceElapsed,
}

struct Worker {
    routing: Arc<dyn RoutingSource>,
    policy: Arc<NotificationGatePolicy>,
    device: DeviceProfile,
    push_tokens: PushTokenStore,
    timings: GateTimings,
    status: watch::Sender<GateStatus>,
    started: bool,
    /// A trigger arrived while a cycle was in flight.
    follow_up: bool,
    /// A restart arrived while a cycle was in flight; its outcome is dropped.
    superseded: bool,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut cycle: Option<Cycle> = None;
        let mut debounce: Option<Instant> = None;

        loop {
            let wakeup = tokio::select! {
                command = rx.recv() => Wakeup::Command(command),
                decision = poll_cycle(&mut cycle) => Wakeup::CycleSettled(decision),
                () = debounce_elapsed(debounce) => Wakeup::DebounceElapsed,
            };

            match wakeup {
                Wakeup::Command(None) => break,
                Wakeup::Command(Some(command)) => {
                    if self.handle(command, &mut debounce) {
                        self.request_cycle(&mut cycle);
                    }
                }
                Wakeup::CycleSettled(decision) => {
                    cycle = None;
                    if std::mem::take(&mut self.superseded) {
                        tracing::debug!(?decision, "Dropping fetch outcome superseded by restart");
                    } else {
                        self.apply(decision);
                    }
                    if std::mem::take(&mut self.follow_up) {
                        self.request_cycle(&mut cycle);
                    }
                }
                Wakeup::DebounceElapsed => {
                    debounce = None;
                    self.request_cycle(&mut cycle);
                }
            }
        }

        tracing::debug!("Gate worker stopped");
    }

    /// Returns true when the command asks for a fetch cycle.
    fn handle(&mut self, command: Command, debounce: &mut Option<Instant>) -> bool {
        let trigger = command.name();
        let web = self.state().is_web();

        let (accepted, wants_cycle) = match command {
            Command::Start => {
                let first = !self.started;
                self.started = true;
                (first, first)
            }
            Command::AttributionChanged => {
                let armed = self.started && !web;
                if armed {
                    *debounce = Some(Instant::now() + self.timings.debounce);
                }
                (armed, false)
            }
            Command::Foreground => {
                let accepted = self.started && !web;
                (accepted, accepted)
            }
            Command::Restart => {
                if !web {
                    self.started = true;
                    self.superseded = true;
                    self.status.send_modify(|status| {
                        status.state = GateState::Loading;
                        status.loading_error = false;
                    });
                }
                (!web, !web)
            }
            Command::AcceptPrompt(reply) => (self.accept_prompt(reply), false),
            Command::DeclinePrompt(reply) => (self.decline_prompt(reply), false),
        };

        let outcome = if accepted { "accepted" } else { "ignored" };
        counter!(GATE_TRIGGERS, "trigger" => trigger, "outcome" => outcome).increment(1);
        tracing::debug!(trigger, accepted, "Gate trigger");

        wants_cycle
    }

    fn request_cycle(&mut self, cycle: &mut Option<Cycle>) {
        if self.state().is_web() {
            tracing::debug!("Web destination already shown, not fetching");
            return;
        }
        if cycle.is_some() {
            tracing::debug!("Fetch in flight, coalescing trigger");
            self.follow_up = true;
            return;
        }

        self.superseded = false;
        self.status.send_if_modified(|status| std::mem::take(&mut status.loading_error));
        *cycle = Some(self.launch_cycle());
    }

    fn launch_cycle(&self) -> Cycle {
        let routing = self.routing.clone();
        let policy = self.policy.clone();
        let context = self.device.context(self.push_tokens.current());
        let min_loading = self.timings.min_loading;

        Box::pin(async move {
            let started = Instant::now();
            let result = fetch(routing.as_ref(), &context).await;
            sleep_until(started + min_loading).await;
            decide(result, &policy).await
        })
    }

    fn apply(&mut self, decision: Decision) {
        if self.state().is_web() {
            tracing::debug!(?decision, "Discarding fetch outcome, web destination already shown");
            return;
        }

        match decision {
            Decision::Route(state) => self.set_state(state),
            Decision::Retry(error) => {
                tracing::warn!(error = %error, "Config fetch failed, waiting for a retry trigger");
                self.status.send_if_modified(|status| {
                    let changed = !status.loading_error;
                    status.loading_error = true;
                    changed
                });
            }
        }
    }

    fn accept_prompt(&mut self, reply: oneshot::Sender<Option<PermissionStatus>>) -> bool {
        let GateState::NotificationPrompt(url) = self.state() else {
            let _ = reply.send(None);
            return false;
        };

        self.set_state(GateState::Web(url));

        let policy = self.policy.clone();
        tokio::spawn(async move {
            let status = policy.accept().await;
            let _ = reply.send(Some(status));
        });
        true
    }

    fn decline_prompt(&mut self, reply: oneshot::Sender<bool>) -> bool {
        let GateState::NotificationPrompt(url) = self.state() else {
            let _ = reply.send(false);
            return false;
        };

        self.policy.decline();
        self.set_state(GateState::Web(url));
        let _ = reply.send(true);
        true
    }

    fn state(&self) -> GateState {
        self.status.borrow().state.clone()
    }

    fn set_state(&self, state: GateState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            counter!(GATE_ROUTE, "route" => state.as_str()).increment(1);
            tracing::info!(
                from = status.state.as_str(),
                to = state.as_str(),
                destination = state.destination().map(Url::as_str),
                "Gate route changed"
            );
            status.state = state;
            true
        });
    }
}

async fn fetch(
    routing: &dyn RoutingSource,
    context: &DeviceContext,
) -> Result<RemoteConfigResponse, FetchError> {
    let started = Instant::now();
    let result = routing.fetch_routing(context).await;
    let elapsed = started.elapsed();

    let outcome = match &result {
        Ok(response) if response.ok => "ok",
        Ok(_) => "rejected",
        Err(e) => e.kind(),
    };
    histogram!(CONFIG_FETCH_DURATION).record(elapsed.as_secs_f64());
    counter!(CONFIG_FETCH_OUTCOME, "outcome" => outcome).increment(1);
    tracing::info!(outcome, elapsed_ms = elapsed.as_millis() as u64, "Config fetch finished");

    result
}

async fn decide(
    result: Result<RemoteConfigResponse, FetchError>,
    policy: &NotificationGatePolicy,
) -> Decision {
    let response = match result {
        Ok(response) => response,
        Err(error) if error.is_retryable() => return Decision::Retry(error),
        Err(error) => {
            tracing::warn!(error = %error, "Config fetch failed, falling back to native");
            return Decision::Route(GateState::Native);
        }
    };

    let Some(url) = response.destination() else {
        tracing::info!(
            ok = response.ok,
            message = response.message.as_deref(),
            "No web destination, falling back to native"
        );
        return Decision::Route(GateState::Native);
    };

    if let Some(expires_at) = response.expires_at() {
        tracing::debug!(expires_at = %expires_at, "Destination expiry");
    }

    if policy.should_prompt().await {
        Decision::Route(GateState::NotificationPrompt(url))
    } else {
        Decision::Route(GateState::Web(url))
    }
}

async fn poll_cycle(cycle: &mut Option<Cycle>) -> Decision {
    match cycle {
        Some(cycle) => cycle.await,
        None => std::future::pending().await,
    }
}

async fn debounce_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
