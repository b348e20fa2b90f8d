//! The agent controller: the run state machine driving
//! scan -> capture -> annotate -> decide -> act -> persist -> repeat.
//!
//! The controller is single-threaded cooperative. Each step is one async chain
//! reloading the persisted run state at entry, and the loop advances only via
//! an explicit, cancellable deferred re-entry; at most one pending continuation
//! exists at any time. Cancellation is polled: a stop request sets a flag that
//! the running step observes at its next checkpoint.

use async_trait::async_trait;
use nanoid::nanoid;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::extract;
use crate::protocol::{
    ActionCommand, ExecutionOutcome, InteractableElement, PageInfo, StartReply, StatusEvent,
    StopReply, TabId,
};
use crate::store::{RunState, RunStore};

// ========================= Errors =========================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AgentError {
    #[error("API key is not set")]
    CredentialMissing,
    #[error("could not find the active browser tab")]
    NoActiveTab,
    #[error("tab {0} no longer exists")]
    TabNotFound(TabId),
    #[error("page scan failed: {0}")]
    ScanFailed(String),
    #[error("screenshot capture failed: {0}")]
    CaptureFailed(String),
    #[error("decision client failed: {0}")]
    DecisionFailed(String),
    #[error("no JSON action found in model output")]
    NoJsonFound,
    #[error("model output is not a valid action object")]
    InvalidActionShape,
    #[error("action execution failed: {0}")]
    ExecutionFailed(String),
    #[error("invalid run state: {0}")]
    InvalidState(&'static str),
    #[error("state store failed: {0}")]
    Store(String),
    /// Control-flow sentinel for a user-initiated stop. Swallowed at the step
    /// boundary and reported only as a "stopped" status, never as an error.
    #[error("stopped by user")]
    Aborted,
}

// ========================= Pluggable Subsystems =========================

/// Tab-facing capabilities: scanner, annotator, action executor and the tab
/// plumbing around them. Payloads are validated at this boundary; callers
/// never see raw page data.
#[async_trait]
pub trait TabDriver: Send + Sync {
    async fn active_tab(&self) -> Result<Option<TabId>, AgentError>;
    async fn tab_exists(&self, tab: TabId) -> Result<bool, AgentError>;
    async fn page_info(&self, tab: TabId) -> Result<PageInfo, AgentError>;
    /// Enumerate visible interactive elements; ids are valid for this scan only.
    async fn scan(&self, tab: TabId) -> Result<Vec<InteractableElement>, AgentError>;
    /// Base64 PNG of the visible tab. `explicit_window` is the retry path that
    /// pins the capture context explicitly.
    async fn capture(&self, tab: TabId, explicit_window: bool) -> Result<String, AgentError>;
    /// Overlay numbered markers for the elements. Idempotent.
    async fn annotate(
        &self,
        tab: TabId,
        elements: &[InteractableElement],
    ) -> Result<usize, AgentError>;
    async fn clear_annotations(&self, tab: TabId) -> Result<(), AgentError>;
    async fn execute(
        &self,
        tab: TabId,
        command: &ActionCommand,
    ) -> Result<ExecutionOutcome, AgentError>;
    async fn navigate(&self, tab: TabId, url: &str) -> Result<(), AgentError>;
}

/// Vision-language completion: text prompt plus an optional PNG, free-form
/// text back. The raw text goes through `crate::extract` afterwards.
#[async_trait]
pub trait DecisionClient: Send + Sync {
    async fn decide(
        &self,
        api_key: &str,
        prompt: &str,
        image_png_b64: Option<&str>,
    ) -> Result<String, AgentError>;
}

/// One-way notification channel to the UI layer.
pub trait StatusSink: Send + Sync {
    fn notify(&self, event: StatusEvent);
}

// ========================= Controller =========================

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Delay before the next step once an action has been executed.
    pub step_delay: Duration,
    /// Settle delay before re-entering the loop after a navigation.
    pub navigation_settle: Duration,
    /// How many trailing history lines the prompt carries.
    pub history_window: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_millis(500),
            navigation_settle: Duration::from_secs(2),
            history_window: 5,
        }
    }
}

enum StepOutcome {
    /// Schedule one more step after `step_delay`.
    Continue,
    /// Navigation was commanded; re-enter after `navigation_settle`.
    AwaitNavigation,
    /// Terminal; no further step is scheduled.
    Stop,
}

pub struct Controller<D, C, S>
where
    D: TabDriver,
    C: DecisionClient,
    S: RunStore,
{
    driver: D,
    decider: C,
    store: S,
    sink: Arc<dyn StatusSink>,
    cfg: ControllerConfig,
    /// The single pending loop continuation, if any.
    pending: StdMutex<Option<JoinHandle<()>>>,
    weak: Weak<Self>,
}

impl<D, C, S> Controller<D, C, S>
where
    D: TabDriver + 'static,
    C: DecisionClient + 'static,
    S: RunStore + 'static,
{
    pub fn new(
        driver: D,
        decider: C,
        store: S,
        sink: Arc<dyn StatusSink>,
        cfg: ControllerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            driver,
            decider,
            store,
            sink,
            cfg,
            pending: StdMutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Accept a new goal, unless a run is already active.
    pub async fn start_goal(&self, goal: &str) -> Result<StartReply, AgentError> {
        let state = self.store.load().await?;
        if state.is_running {
            info!("goal rejected: a run is already active");
            return Ok(StartReply::Busy);
        }
        // A stale continuation from a just-stopped run must not race the new one.
        self.cancel_pending();

        match self.initialize(goal).await {
            Ok(()) => {
                self.schedule_next(Duration::ZERO);
                Ok(StartReply::Accepted)
            }
            Err(err) => {
                warn!(error = %err, "run initialization failed");
                self.response(&format!("Error: {err}"));
                self.status("Idle");
                Err(err)
            }
        }
    }

    async fn initialize(&self, goal: &str) -> Result<(), AgentError> {
        self.status("Fetching API key...");
        let api_key = self
            .store
            .load_api_key()
            .await?
            .ok_or(AgentError::CredentialMissing)?;
        let tab = self
            .driver
            .active_tab()
            .await?
            .ok_or(AgentError::NoActiveTab)?;

        let run_id = nanoid!();
        let seed = format!("User Goal: {goal}");
        let state = RunState {
            is_running: true,
            abort_requested: false,
            current_goal: Some(goal.to_string()),
            history: vec![seed.clone()],
            active_tab_id: Some(tab),
            api_key: Some(api_key),
            run_id: Some(run_id.clone()),
        };
        self.store.save(&state).await?;
        info!(run = %run_id, tab = %tab, "goal accepted");
        self.log_line(&seed);
        Ok(())
    }

    /// Request a cooperative stop. Takes effect at the running step's next
    /// checkpoint; in-flight external calls are not cancelled, their results
    /// are discarded.
    pub async fn request_stop(&self) -> Result<StopReply, AgentError> {
        let mut state = self.store.load().await?;
        if !state.is_running {
            return Ok(StopReply::AlreadyStopped);
        }
        state.abort_requested = true;
        self.store.save(&state).await?;
        info!("stop requested");
        self.status("Stopping...");
        Ok(StopReply::Stopping)
    }

    // ---------------- step machinery ----------------

    async fn run_step(&self) {
        // The handle stored here is the task running right now; drop it
        // without aborting.
        self.pending.lock().expect("pending lock").take();

        match self.step().await {
            Ok(StepOutcome::Continue) => self.schedule_next(self.cfg.step_delay),
            Ok(StepOutcome::AwaitNavigation) => {
                self.status("Waiting for the page to load...");
                self.schedule_next(self.cfg.navigation_settle);
            }
            Ok(StepOutcome::Stop) => {}
            Err(AgentError::Aborted) => {
                info!("run stopped by user");
                self.response("Stopped by user.");
                self.status("Idle");
            }
            Err(err) => self.fail_run(err).await,
        }
    }

    /// One iteration of the step protocol. The caller is the single failure
    /// boundary: any error short-circuits the rest of the iteration.
    async fn step(&self) -> Result<StepOutcome, AgentError> {
        let mut state = self.checkpoint().await?;

        if !state.is_running {
            return Err(AgentError::InvalidState("step entered while no run is active"));
        }
        let (Some(goal), Some(api_key), Some(tab)) = (
            state.current_goal.clone(),
            state.api_key.clone(),
            state.active_tab_id,
        ) else {
            state.is_running = false;
            self.store.save(&state).await?;
            return Err(AgentError::InvalidState(
                "active run is missing its goal, credential or tab",
            ));
        };

        if !self.driver.tab_exists(tab).await? {
            return Err(AgentError::TabNotFound(tab));
        }

        self.status("Scanning current page...");
        let elements = self.driver.scan(tab).await?;
        let image = match self.driver.capture(tab, false).await {
            Ok(image) => image,
            Err(err) => {
                // Capture context can be ambiguous across surfaces; retry once
                // pinned to the tab's window.
                warn!(error = %err, "capture failed, retrying with explicit window");
                self.driver.capture(tab, true).await?
            }
        };
        let observed = format!("Page scanned. {} elements found.", elements.len());
        state.history.push(observed.clone());
        self.store.save(&state).await?;
        self.log_line(&observed);

        state = self.checkpoint().await?;

        // Best-effort visual aid; the element list is the ground truth.
        if let Err(err) = self.driver.annotate(tab, &elements).await {
            warn!(error = %err, "annotation failed");
        }
        let page = self.driver.page_info(tab).await?;
        let prompt =
            build_prompt(&goal, &state.history, self.cfg.history_window, &page, &elements);

        // The decision call is the longest-latency step; check right before
        // and right after it.
        self.checkpoint().await?;
        self.status("Asking the model for the next action...");
        let raw = self.decider.decide(&api_key, &prompt, Some(&image)).await?;
        state = self.checkpoint().await?;

        let command = extract::parse_action(&raw)?;
        let action_line = format!("Action: {}", command.to_json());
        state.history.push(action_line.clone());
        self.store.save(&state).await?;
        self.log_line(&action_line);
        info!(action = %command.verb(), "model decided");

        let _ = self.driver.clear_annotations(tab).await;

        match &command {
            ActionCommand::Finish => {
                state.is_running = false;
                self.store.save(&state).await?;
                self.response("Task finished.");
                self.status("Idle");
                Ok(StepOutcome::Stop)
            }
            ActionCommand::Navigate { url } => {
                if !self.driver.tab_exists(tab).await? {
                    return Err(AgentError::TabNotFound(tab));
                }
                self.status(&format!("Navigating to {url}..."));
                self.driver.navigate(tab, url).await?;
                Ok(StepOutcome::AwaitNavigation)
            }
            _ => {
                if !self.driver.tab_exists(tab).await? {
                    return Err(AgentError::TabNotFound(tab));
                }
                self.status(&format!("Executing action: {}...", command.verb()));
                let outcome = self.driver.execute(tab, &command).await?;
                let result_line = format!("Result: {}", outcome.message);
                state.history.push(result_line.clone());
                self.store.save(&state).await?;
                self.log_line(&result_line);
                if !outcome.success {
                    return Err(AgentError::ExecutionFailed(outcome.message));
                }
                let state = self.checkpoint().await?;
                Ok(if state.is_running { StepOutcome::Continue } else { StepOutcome::Stop })
            }
        }
    }

    /// Abort checkpoint: reload the state and, if a stop was requested,
    /// consume the request, mark the run stopped, persist, and bail out with
    /// the abort sentinel.
    async fn checkpoint(&self) -> Result<RunState, AgentError> {
        let mut state = self.store.load().await?;
        if state.abort_requested {
            state.abort_requested = false;
            state.is_running = false;
            self.store.save(&state).await?;
            return Err(AgentError::Aborted);
        }
        Ok(state)
    }

    /// Terminal error path: mark the run stopped, report the cause, flag that
    /// the user has to take over. Failed steps are never retried.
    async fn fail_run(&self, err: AgentError) {
        warn!(error = %err, "step failed, stopping run");
        match self.store.load().await {
            Ok(mut state) => {
                if state.is_running || state.abort_requested {
                    state.is_running = false;
                    state.abort_requested = false;
                    if let Err(save_err) = self.store.save(&state).await {
                        warn!(error = %save_err, "could not persist stopped state");
                    }
                }
            }
            Err(load_err) => warn!(error = %load_err, "could not reload state after failure"),
        }
        self.response(&format!("Error: {err}"));
        self.intervention(&err.to_string());
        self.status("Idle");
    }

    /// Replace the pending continuation with a new one. The previous handle,
    /// if any, is aborted so duplicate loops cannot race each other.
    fn schedule_next(&self, delay: Duration) {
        let Some(ctrl) = self.weak.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            ctrl.run_step().await;
        });
        if let Some(previous) = self.pending.lock().expect("pending lock").replace(handle) {
            previous.abort();
        }
    }

    fn cancel_pending(&self) {
        if let Some(previous) = self.pending.lock().expect("pending lock").take() {
            previous.abort();
        }
    }

    // ---------------- notifications ----------------

    fn status(&self, text: &str) {
        self.sink.notify(StatusEvent::Status(text.to_string()));
    }

    fn log_line(&self, text: &str) {
        self.sink.notify(StatusEvent::LogLine(text.to_string()));
    }

    fn response(&self, text: &str) {
        self.sink.notify(StatusEvent::Response(text.to_string()));
    }

    fn intervention(&self, text: &str) {
        self.sink.notify(StatusEvent::InterventionNeeded(text.to_string()));
    }
}

/// Prompt carrying the goal, the trailing history window, the page identity
/// and the full element list as structured text.
fn build_prompt(
    goal: &str,
    history: &[String],
    window: usize,
    page: &PageInfo,
    elements: &[InteractableElement],
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("User goal: {goal}\n\n"));
    prompt.push_str(&format!("Current page: {} ({})\n\n", page.title, page.url));
    prompt.push_str("Recent history:\n");
    let skip = history.len().saturating_sub(window);
    for line in &history[skip..] {
        prompt.push_str("- ");
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt.push_str(
        "\nInteractable elements on the current page (ids match the numbered markers):\n",
    );
    prompt.push_str(&serde_json::to_string_pretty(elements).unwrap_or_else(|_| "[]".into()));
    prompt.push_str(
        "\n\nBased on the goal, the history and the page elements, what is the next single \
         action to take? Actions can be navigate (url), click (elementId), input (elementId, \
         text), scroll (direction \"up\" or \"down\"), or finish. Respond ONLY with a JSON \
         object like {\"action\": \"...\", \"elementId\": 1, \"text\": \"...\"}.",
    );
    prompt
}

// ========================= Defaults & Helpers =========================

/// Status sink over a tokio channel; the receiving UI may be closed, in which
/// case notifications are dropped.
pub struct ChannelStatusSink {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelStatusSink {
    pub fn new(tx: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelStatusSink {
    fn notify(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }
}

pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn notify(&self, _event: StatusEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRunStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct DriverState {
        elements: Vec<InteractableElement>,
        tab_open: AtomicBool,
        no_active_tab: AtomicBool,
        fail_execute: AtomicBool,
        executed: StdMutex<Vec<ActionCommand>>,
        navigations: StdMutex<Vec<String>>,
    }

    #[derive(Clone)]
    struct ScriptedDriver(Arc<DriverState>);

    impl ScriptedDriver {
        fn new(elements: Vec<InteractableElement>) -> Self {
            Self(Arc::new(DriverState {
                elements,
                tab_open: AtomicBool::new(true),
                ..Default::default()
            }))
        }
    }

    #[async_trait]
    impl TabDriver for ScriptedDriver {
        async fn active_tab(&self) -> Result<Option<TabId>, AgentError> {
            if self.0.no_active_tab.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(TabId(7)))
        }

        async fn tab_exists(&self, _tab: TabId) -> Result<bool, AgentError> {
            Ok(self.0.tab_open.load(Ordering::SeqCst))
        }

        async fn page_info(&self, _tab: TabId) -> Result<PageInfo, AgentError> {
            Ok(PageInfo { title: "Example".into(), url: "https://example.test/".into() })
        }

        async fn scan(&self, _tab: TabId) -> Result<Vec<InteractableElement>, AgentError> {
            Ok(self.0.elements.clone())
        }

        async fn capture(&self, _tab: TabId, _explicit: bool) -> Result<String, AgentError> {
            Ok("cGl4ZWxz".into())
        }

        async fn annotate(
            &self,
            _tab: TabId,
            elements: &[InteractableElement],
        ) -> Result<usize, AgentError> {
            Ok(elements.len())
        }

        async fn clear_annotations(&self, _tab: TabId) -> Result<(), AgentError> {
            Ok(())
        }

        async fn execute(
            &self,
            _tab: TabId,
            command: &ActionCommand,
        ) -> Result<ExecutionOutcome, AgentError> {
            self.0.executed.lock().unwrap().push(command.clone());
            if self.0.fail_execute.load(Ordering::SeqCst) {
                return Ok(ExecutionOutcome {
                    success: false,
                    message: "element 1 is gone".into(),
                });
            }
            Ok(ExecutionOutcome {
                success: true,
                message: format!("Executed {}", command.verb()),
            })
        }

        async fn navigate(&self, _tab: TabId, url: &str) -> Result<(), AgentError> {
            self.0.navigations.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct ScriptedDecider {
        replies: Arc<StdMutex<VecDeque<String>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedDecider {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Arc::new(StdMutex::new(
                    replies.iter().map(|s| s.to_string()).collect(),
                )),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl DecisionClient for ScriptedDecider {
        async fn decide(
            &self,
            _api_key: &str,
            _prompt: &str,
            _image: Option<&str>,
        ) -> Result<String, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| AgentError::DecisionFailed("script exhausted".into()))
        }
    }

    /// Sets the abort flag while the model call is in flight, then answers.
    struct AbortingDecider {
        store: MemoryRunStore,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DecisionClient for AbortingDecider {
        async fn decide(
            &self,
            _api_key: &str,
            _prompt: &str,
            _image: Option<&str>,
        ) -> Result<String, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut state = self.store.load().await?;
            state.abort_requested = true;
            self.store.save(&state).await?;
            Ok(r#"{"action":"click","elementId":1}"#.into())
        }
    }

    #[derive(Clone, Default)]
    struct CollectingSink(Arc<StdMutex<Vec<StatusEvent>>>);

    impl StatusSink for CollectingSink {
        fn notify(&self, event: StatusEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl CollectingSink {
        fn responses(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    StatusEvent::Response(s) => Some(s.clone()),
                    _ => None,
                })
                .collect()
        }

        fn interventions(&self) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    StatusEvent::InterventionNeeded(s) => Some(s.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    type TestController = Arc<Controller<ScriptedDriver, ScriptedDecider, MemoryRunStore>>;

    fn controller(
        driver: ScriptedDriver,
        decider: ScriptedDecider,
        store: MemoryRunStore,
        sink: CollectingSink,
    ) -> TestController {
        Controller::new(driver, decider, store, Arc::new(sink), test_config())
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            step_delay: Duration::from_millis(1),
            navigation_settle: Duration::from_millis(1),
            history_window: 5,
        }
    }

    fn settings_link() -> Vec<InteractableElement> {
        vec![InteractableElement {
            id: 1,
            tag: "a".into(),
            text: Some("Settings".into()),
            attributes: Default::default(),
            x: 0,
            y: 0,
            width: 80,
            height: 20,
        }]
    }

    async fn seeded_running_store() -> MemoryRunStore {
        let store = MemoryRunStore::with_api_key("k");
        store
            .save(&RunState {
                is_running: true,
                abort_requested: false,
                current_goal: Some("open settings".into()),
                history: vec!["User Goal: open settings".into()],
                active_tab_id: Some(TabId(7)),
                api_key: Some("k".into()),
                run_id: Some("test-run".into()),
            })
            .await
            .unwrap();
        store
    }

    async fn wait_until_stopped(store: &MemoryRunStore) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.load().await.unwrap().is_running {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("run did not stop in time");
        // Let the final notifications land.
        sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn click_then_finish_runs_to_completion() {
        let driver = ScriptedDriver::new(settings_link());
        let decider = ScriptedDecider::new(&[
            r#"{"action":"click","elementId":1}"#,
            r#"{"action":"finish"}"#,
        ]);
        let store = MemoryRunStore::with_api_key("k");
        let sink = CollectingSink::default();
        let ctrl = controller(driver.clone(), decider.clone(), store.clone(), sink.clone());

        assert_eq!(ctrl.start_goal("open settings").await.unwrap(), StartReply::Accepted);
        wait_until_stopped(&store).await;

        let state = store.load().await.unwrap();
        assert!(!state.is_running);
        assert_eq!(state.history[0], "User Goal: open settings");
        let obs = state
            .history
            .iter()
            .position(|l| l.contains("1 elements found"))
            .expect("observation entry");
        let act = state
            .history
            .iter()
            .position(|l| l.contains(r#""elementId":1"#))
            .expect("action entry");
        let res = state
            .history
            .iter()
            .position(|l| l.starts_with("Result: ") && l.contains("Executed click"))
            .expect("result entry");
        assert!(obs < act && act < res, "history out of order: {:?}", state.history);

        // One further step was scheduled after the click: the finish decision.
        assert_eq!(decider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(driver.0.executed.lock().unwrap().len(), 1);
        assert!(sink.responses().contains(&"Task finished.".to_string()));
        assert!(sink.interventions().is_empty());
        // No pending continuation survives the finish.
        assert!(ctrl.pending.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn start_goal_rejected_while_running() {
        let store = seeded_running_store().await;
        let before = store.load().await.unwrap();
        let ctrl = controller(
            ScriptedDriver::new(vec![]),
            ScriptedDecider::new(&[]),
            store.clone(),
            CollectingSink::default(),
        );
        assert_eq!(ctrl.start_goal("another goal").await.unwrap(), StartReply::Busy);
        assert_eq!(store.load().await.unwrap(), before);
    }

    #[tokio::test]
    async fn abort_honored_before_any_external_call() {
        let store = seeded_running_store().await;
        let mut state = store.load().await.unwrap();
        state.abort_requested = true;
        store.save(&state).await.unwrap();

        let driver = ScriptedDriver::new(settings_link());
        let decider = ScriptedDecider::new(&[r#"{"action":"finish"}"#]);
        let sink = CollectingSink::default();
        let ctrl = controller(driver.clone(), decider.clone(), store.clone(), sink.clone());
        ctrl.run_step().await;

        let state = store.load().await.unwrap();
        assert!(!state.is_running);
        assert!(!state.abort_requested);
        assert_eq!(decider.calls.load(Ordering::SeqCst), 0);
        assert!(driver.0.executed.lock().unwrap().is_empty());
        assert!(sink.responses().contains(&"Stopped by user.".to_string()));
        assert!(sink.interventions().is_empty());
        assert!(ctrl.pending.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn abort_during_model_call_skips_dispatch() {
        let store = seeded_running_store().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let driver = ScriptedDriver::new(settings_link());
        let sink = CollectingSink::default();
        let ctrl = Controller::new(
            driver.clone(),
            AbortingDecider { store: store.clone(), calls: calls.clone() },
            store.clone(),
            Arc::new(sink.clone()),
            test_config(),
        );
        ctrl.run_step().await;

        // The model answered with a click, but the checkpoint right after the
        // call observed the stop request and discarded the result.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(driver.0.executed.lock().unwrap().is_empty());
        let state = store.load().await.unwrap();
        assert!(!state.is_running);
        assert!(!state.abort_requested);
        assert!(sink.responses().contains(&"Stopped by user.".to_string()));
        assert!(sink.interventions().is_empty());
    }

    #[tokio::test]
    async fn closed_tab_stops_run_without_model_call() {
        let store = seeded_running_store().await;
        let driver = ScriptedDriver::new(settings_link());
        driver.0.tab_open.store(false, Ordering::SeqCst);
        let decider = ScriptedDecider::new(&[]);
        let sink = CollectingSink::default();
        let ctrl = controller(driver, decider.clone(), store.clone(), sink.clone());
        ctrl.run_step().await;

        assert!(!store.load().await.unwrap().is_running);
        assert_eq!(decider.calls.load(Ordering::SeqCst), 0);
        let interventions = sink.interventions();
        assert_eq!(interventions.len(), 1);
        assert!(interventions[0].contains("tab 7 no longer exists"));
    }

    #[tokio::test]
    async fn unparseable_reply_reports_error_not_crash() {
        let store = seeded_running_store().await;
        let driver = ScriptedDriver::new(settings_link());
        let decider = ScriptedDecider::new(&["The best action is to click the settings link."]);
        let sink = CollectingSink::default();
        let ctrl = controller(driver.clone(), decider, store.clone(), sink.clone());
        ctrl.run_step().await;

        assert!(!store.load().await.unwrap().is_running);
        assert!(sink
            .responses()
            .iter()
            .any(|r| r.contains("no JSON action found")));
        assert_eq!(sink.interventions().len(), 1);
        assert!(driver.0.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_execution_stops_the_run() {
        let store = seeded_running_store().await;
        let driver = ScriptedDriver::new(settings_link());
        driver.0.fail_execute.store(true, Ordering::SeqCst);
        let decider = ScriptedDecider::new(&[r#"{"action":"click","elementId":1}"#]);
        let sink = CollectingSink::default();
        let ctrl = controller(driver, decider, store.clone(), sink.clone());
        ctrl.run_step().await;

        let state = store.load().await.unwrap();
        assert!(!state.is_running);
        // The failed result is still recorded before the run stops.
        assert!(state.history.iter().any(|l| l == "Result: element 1 is gone"));
        assert!(sink.interventions().iter().any(|m| m.contains("element 1 is gone")));
    }

    #[tokio::test]
    async fn navigate_defers_then_resumes() {
        let driver = ScriptedDriver::new(vec![]);
        let decider = ScriptedDecider::new(&[
            r#"{"action":"navigate","url":"https://example.com/"}"#,
            r#"{"action":"finish"}"#,
        ]);
        let store = MemoryRunStore::with_api_key("k");
        let sink = CollectingSink::default();
        let ctrl = controller(driver.clone(), decider.clone(), store.clone(), sink.clone());

        assert_eq!(ctrl.start_goal("go to example").await.unwrap(), StartReply::Accepted);
        wait_until_stopped(&store).await;

        assert_eq!(*driver.0.navigations.lock().unwrap(), vec!["https://example.com/"]);
        assert_eq!(decider.calls.load(Ordering::SeqCst), 2);
        assert!(sink.responses().contains(&"Task finished.".to_string()));
    }

    #[tokio::test]
    async fn missing_credential_mid_run_is_fatal() {
        let store = seeded_running_store().await;
        let mut state = store.load().await.unwrap();
        state.api_key = None;
        store.save(&state).await.unwrap();

        let decider = ScriptedDecider::new(&[]);
        let sink = CollectingSink::default();
        let ctrl = controller(
            ScriptedDriver::new(vec![]),
            decider.clone(),
            store.clone(),
            sink.clone(),
        );
        ctrl.run_step().await;

        assert!(!store.load().await.unwrap().is_running);
        assert_eq!(decider.calls.load(Ordering::SeqCst), 0);
        assert!(sink.responses().iter().any(|r| r.contains("invalid run state")));
    }

    #[tokio::test]
    async fn stop_request_flags_the_run() {
        let idle_store = MemoryRunStore::with_api_key("k");
        let ctrl = controller(
            ScriptedDriver::new(vec![]),
            ScriptedDecider::new(&[]),
            idle_store,
            CollectingSink::default(),
        );
        assert_eq!(ctrl.request_stop().await.unwrap(), StopReply::AlreadyStopped);

        let store = seeded_running_store().await;
        let ctrl = controller(
            ScriptedDriver::new(vec![]),
            ScriptedDecider::new(&[]),
            store.clone(),
            CollectingSink::default(),
        );
        assert_eq!(ctrl.request_stop().await.unwrap(), StopReply::Stopping);
        let state = store.load().await.unwrap();
        // Consumed by the next checkpoint, not here.
        assert!(state.abort_requested);
        assert!(state.is_running);
    }

    #[tokio::test]
    async fn start_without_api_key_reports_cause() {
        let store = MemoryRunStore::new();
        let sink = CollectingSink::default();
        let ctrl = controller(
            ScriptedDriver::new(vec![]),
            ScriptedDecider::new(&[]),
            store.clone(),
            sink.clone(),
        );
        let err = ctrl.start_goal("goal").await.unwrap_err();
        assert_eq!(err, AgentError::CredentialMissing);
        assert!(!store.load().await.unwrap().is_running);
        assert!(sink.responses().iter().any(|r| r.contains("API key")));
    }

    #[tokio::test]
    async fn start_without_active_tab_reports_cause() {
        let store = MemoryRunStore::with_api_key("k");
        let driver = ScriptedDriver::new(vec![]);
        driver.0.no_active_tab.store(true, Ordering::SeqCst);
        let sink = CollectingSink::default();
        let ctrl = controller(driver, ScriptedDecider::new(&[]), store.clone(), sink.clone());
        let err = ctrl.start_goal("goal").await.unwrap_err();
        assert_eq!(err, AgentError::NoActiveTab);
        assert!(!store.load().await.unwrap().is_running);
        assert!(sink.responses().iter().any(|r| r.contains("active browser tab")));
    }

    #[tokio::test]
    async fn at_most_one_pending_continuation() {
        let ctrl = controller(
            ScriptedDriver::new(vec![]),
            ScriptedDecider::new(&[]),
            MemoryRunStore::new(),
            CollectingSink::default(),
        );
        ctrl.schedule_next(Duration::from_secs(60));
        ctrl.schedule_next(Duration::from_secs(60));
        let handle = ctrl.pending.lock().unwrap().take().expect("one pending handle");
        handle.abort();
        assert!(ctrl.pending.lock().unwrap().is_none());
    }

    #[test]
    fn prompt_carries_only_the_trailing_history_window() {
        let history: Vec<String> = (1..=8).map(|i| format!("history line {i}")).collect();
        let page = PageInfo { title: "T".into(), url: "https://t.test/".into() };
        let prompt = build_prompt("my goal", &history, 5, &page, &[]);
        assert!(prompt.contains("User goal: my goal"));
        assert!(prompt.contains("https://t.test/"));
        assert!(!prompt.contains("history line 3"));
        assert!(prompt.contains("history line 4"));
        assert!(prompt.contains("history line 8"));
    }
}
