//! ---
//! mlw_section: "01-core-functionality"
//! mlw_subsection: "module"
//! mlw_type: "source"
//! mlw_scope: "code"
//! mlw_description: "Reaction cycle orchestration and tool lifecycle."
//! mlw_version: "v0.0.0-prealpha"
//! mlw_owner: "tbd"
//! ---
//! Reaction cycle: classify an inbound trigger, check the tool's reaction
//! policy, run the tool, publish its result.
//!
//! Every failure of a single message is contained. It is logged with its
//! taxonomy name, counted, and flips the tool state to `error`. Policy
//! rejections are never re-raised; every other failure is handed back to
//! the caller of [`ReactionCycle::react`] only when `raise_exceptions` is
//! configured.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use mlw_common::config::{ConfigError, WrapperConfig};
use mlw_common::time::{Clock, SystemClock};
use mlw_msg::{
    is_result_topic, log_message, InboundMessage, IncomingMessage, MessageCallback,
    MessageDirection, MessagingError, OutgoingMessage, Routing, Transport, WrapperMetrics,
};
use mlw_schema::SchemaCatalog;
use parking_lot::Mutex;
use prometheus::Registry;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::state::{StateReporter, ToolState};
use crate::tool::{AnalysisTool, ToolOptions};

/// Failures of the reaction cycle.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    /// The configuration is unusable; fatal at start-up.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Classification, extraction, assembly or transport failed.
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    /// The analysis tool returned an error.
    #[error("analysis tool failed: {0:#}")]
    Tool(anyhow::Error),
    /// The analysis tool panicked.
    #[error("analysis tool panicked: {0}")]
    Panicked(String),
    /// Metrics could not be registered.
    #[error("failed to register metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    /// Start-up was not driven by a tokio runtime.
    #[error("reaction cycle requires a tokio runtime: {0}")]
    NoRuntime(#[from] TryCurrentError),
    /// The transport never reported a connection.
    #[error("transport '{transport}' not connected after {attempts} checks")]
    NotConnected {
        /// Transport name.
        transport: &'static str,
        /// Number of connection checks made.
        attempts: u32,
    },
}

impl CycleError {
    /// Taxonomy name used when logging.
    pub fn name(&self) -> &'static str {
        match self {
            CycleError::Config(ConfigError::ConfigNotValid { .. }) => "ConfigNotValid",
            CycleError::Config(ConfigError::InvalidTopic(_)) => "InvalidTopic",
            CycleError::Config(ConfigError::InvalidQos(_)) => "InvalidQos",
            CycleError::Messaging(err) => err.name(),
            CycleError::Tool(_) => "ToolError",
            CycleError::Panicked(_) => "Panic",
            CycleError::Metrics(_) => "MetricsError",
            CycleError::NoRuntime(_) => "NoRuntime",
            CycleError::NotConnected { .. } => "NotConnected",
        }
    }

    /// Whether the message was turned away by the tool's reaction policy.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            CycleError::Messaging(MessagingError::WrongMessageType(_))
        )
    }

    fn from_tool(err: anyhow::Error) -> Self {
        match err.downcast::<MessagingError>() {
            Ok(messaging) => CycleError::Messaging(messaging),
            Err(other) => CycleError::Tool(other),
        }
    }
}

struct Inner {
    config: WrapperConfig,
    options: ToolOptions,
    tool: Arc<dyn AnalysisTool>,
    transport: Arc<dyn Transport>,
    catalog: Arc<SchemaCatalog>,
    clock: Arc<dyn Clock>,
    reporter: StateReporter,
    metrics: Option<WrapperMetrics>,
    runtime: Mutex<Option<Handle>>,
    reactions: Mutex<Reactions>,
}

/// Admission flag and in-flight tasks, guarded together so a task is
/// either tracked before shutdown takes the list or never spawned.
#[derive(Default)]
struct Reactions {
    accepting: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// Builder for [`ReactionCycle`].
pub struct ReactionCycleBuilder {
    config: WrapperConfig,
    options: ToolOptions,
    tool: Arc<dyn AnalysisTool>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    registry: Option<Registry>,
}

impl ReactionCycleBuilder {
    /// Clock used to stamp messages.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register wrapper metrics with `registry`.
    pub fn metrics(mut self, registry: &Registry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    /// Validate the configuration and assemble the cycle.
    pub fn build(self) -> Result<ReactionCycle, CycleError> {
        self.config.validate()?;
        let catalog = SchemaCatalog::shared().map_err(MessagingError::from)?;
        let metrics = match &self.registry {
            Some(registry) => Some(WrapperMetrics::register(registry)?),
            None => None,
        };
        let mut reporter = StateReporter::new(
            self.transport.clone(),
            self.config.status_topic.clone(),
            self.config.model.from.clone(),
        );
        if let Some(metrics) = &metrics {
            reporter = reporter.with_metrics(metrics.clone());
        }
        Ok(ReactionCycle {
            inner: Arc::new(Inner {
                config: self.config,
                options: self.options,
                tool: self.tool,
                transport: self.transport,
                catalog,
                clock: self.clock,
                reporter,
                metrics,
                runtime: Mutex::new(None),
                reactions: Mutex::new(Reactions::default()),
            }),
        })
    }
}

/// Handle to a running reaction cycle. Clones share the same cycle.
#[derive(Clone)]
pub struct ReactionCycle {
    inner: Arc<Inner>,
}

impl fmt::Debug for ReactionCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionCycle")
            .field("tool", &self.inner.config.model.from)
            .field("transport", &self.inner.transport.name())
            .field("state", &self.inner.reporter.state())
            .field("accepting", &self.inner.reactions.lock().accepting)
            .finish()
    }
}

impl ReactionCycle {
    /// Start building a cycle with the system clock and no metrics.
    pub fn builder(
        config: WrapperConfig,
        options: ToolOptions,
        tool: Arc<dyn AnalysisTool>,
        transport: Arc<dyn Transport>,
    ) -> ReactionCycleBuilder {
        ReactionCycleBuilder {
            config,
            options,
            tool,
            transport,
            clock: Arc::new(SystemClock),
            registry: None,
        }
    }

    /// Build a cycle with defaults, failing with `ConfigNotValid` when the
    /// model identity is incomplete.
    pub fn new(
        config: WrapperConfig,
        options: ToolOptions,
        tool: Arc<dyn AnalysisTool>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CycleError> {
        Self::builder(config, options, tool, transport).build()
    }

    /// Resolved configuration.
    pub fn config(&self) -> &WrapperConfig {
        &self.inner.config
    }

    /// Last recorded tool state.
    pub fn state(&self) -> Option<ToolState> {
        self.inner.reporter.state()
    }

    /// Number of dispatched reactions that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.inner
            .reactions
            .lock()
            .tasks
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Connect, subscribe and report the tool alive.
    pub async fn start_up(&self) -> Result<(), CycleError> {
        let inner = &self.inner;
        info!(
            tool = %inner.config.model.from,
            transport = inner.transport.name(),
            "starting reaction cycle"
        );
        *inner.runtime.lock() = Some(Handle::try_current()?);

        let cycle = Arc::downgrade(&self.inner);
        let callback: MessageCallback = Arc::new(move |message: InboundMessage| {
            if let Some(inner) = cycle.upgrade() {
                ReactionCycle { inner }.dispatch(message);
            }
        });
        inner.transport.set_on_message(callback);

        if let Err(err) = self.establish().await {
            error!(error_name = err.name(), error = %err, "reaction cycle failed to start");
            inner.reporter.set(ToolState::Error);
            return Err(err);
        }
        inner.reactions.lock().accepting = true;
        inner.reporter.set(ToolState::Alive);
        info!(tool = %inner.config.model.from, "reaction cycle alive");
        Ok(())
    }

    async fn establish(&self) -> Result<(), CycleError> {
        let inner = &self.inner;
        inner.transport.connect()?;
        inner.reporter.set(ToolState::Starting);
        self.wait_for_connection().await?;
        let qos = inner.config.messaging.qos;
        for topic in inner.config.subscription_topics()? {
            inner.transport.subscribe(&topic, qos)?;
            info!(topic = %topic, qos, "subscribed");
        }
        Ok(())
    }

    async fn wait_for_connection(&self) -> Result<(), CycleError> {
        let mqtt = &self.inner.config.mqtt;
        let mut checks: u32 = 0;
        while !self.inner.transport.is_connected() {
            checks += 1;
            if mqtt.connect_attempts != 0 && checks >= mqtt.connect_attempts {
                return Err(CycleError::NotConnected {
                    transport: self.inner.transport.name(),
                    attempts: checks,
                });
            }
            debug!(attempt = checks, "waiting for transport connection");
            tokio::time::sleep(mqtt.connect_retry_interval).await;
        }
        Ok(())
    }

    /// Hand an inbound message to the runtime. Messages arriving before
    /// start-up or after shutdown began are dropped.
    pub fn dispatch(&self, message: InboundMessage) {
        let Some(runtime) = self.inner.runtime.lock().clone() else {
            warn!(topic = %message.topic, "no runtime captured, dropping message");
            return;
        };
        let mut reactions = self.inner.reactions.lock();
        if !reactions.accepting {
            warn!(topic = %message.topic, "reaction cycle not accepting messages, dropping");
            return;
        }
        let cycle = self.clone();
        let task = runtime.spawn(async move {
            let payload = message.payload_text();
            if let Err(err) = cycle.react(&message.topic, &payload).await {
                error!(
                    error_name = err.name(),
                    error = %err,
                    topic = %message.topic,
                    "reaction raised after containment"
                );
            }
        });
        reactions.tasks.retain(|task| !task.is_finished());
        reactions.tasks.push(task);
    }

    /// Process one inbound message end to end.
    ///
    /// Returns the published message, `None` when the message was
    /// contained, or the failure when the policy asks to re-raise it.
    pub async fn react(
        &self,
        topic: &str,
        payload: &str,
    ) -> Result<Option<OutgoingMessage>, CycleError> {
        let inner = &self.inner;
        log_message(MessageDirection::Inbound, topic, payload);
        let incoming = match IncomingMessage::from_wire(
            topic,
            payload,
            &inner.catalog,
            inner.clock.as_ref(),
        ) {
            Ok(incoming) => incoming,
            Err(err) => {
                if let Some(metrics) = &inner.metrics {
                    metrics.observe_message_issue();
                }
                return self.contain(err.into());
            }
        };
        debug!(
            message_id = %incoming.id(),
            kind = ?incoming.kind(),
            result_kind = ?incoming.result_kind(),
            "message retrieved"
        );
        if let Err(err) = inner.options.check(&incoming) {
            return self.contain(err.into());
        }

        match AssertUnwindSafe(self.handle(incoming)).catch_unwind().await {
            Ok(Ok(published)) => Ok(Some(published)),
            Ok(Err(err)) => self.contain(err),
            Err(panic) => self.contain(CycleError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    async fn handle(&self, incoming: IncomingMessage) -> Result<OutgoingMessage, CycleError> {
        let inner = &self.inner;
        let message_id = incoming.id();
        let incoming = inner
            .tool
            .retrieve_payload_data(incoming)
            .await
            .map_err(CycleError::from_tool)?;
        let outgoing = OutgoingMessage::new(
            incoming,
            inner.config.model.clone(),
            Routing::from_config(&inner.config.messaging, inner.options.outgoing_is_temporary),
            inner.catalog.clone(),
            inner.clock.clone(),
        );

        debug!(message_id = %message_id, "running analysis tool");
        let output = inner.tool.run(&outgoing).await.map_err(CycleError::from_tool)?;
        let outgoing = inner
            .tool
            .resolve_result_data(output, outgoing, inner.options.result_kind)
            .await
            .map_err(CycleError::from_tool)?;

        let payload = outgoing.payload().map_err(|err| {
            if matches!(err, MessagingError::NotInitialized(_)) {
                error!(
                    message_id = %message_id,
                    "no result body set; an overridden resolve_result_data has to set it"
                );
            }
            err
        })?;
        let topic = outgoing.topic()?;
        let base = &inner.config.messaging.base_result_topic;
        if !is_result_topic(&topic, base) {
            warn!(
                topic = %topic,
                base = %base,
                "publishing to a topic outside <base result topic>/<contract>"
            );
        }
        inner
            .transport
            .publish(&topic, &payload, inner.config.messaging.qos)?;
        log_message(MessageDirection::Outbound, &topic, &payload);
        info!(message_id = %message_id, topic = %topic, "result published");
        Ok(outgoing)
    }

    fn contain(&self, err: CycleError) -> Result<Option<OutgoingMessage>, CycleError> {
        let raise = self.inner.config.raise_exceptions && !err.is_policy_rejection();
        if err.is_policy_rejection() {
            warn!(error_name = err.name(), error = %err, "message rejected by reaction policy");
        } else {
            error!(error_name = err.name(), error = %err, raise, "message handling failed");
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.observe_error();
        }
        self.inner.reporter.set(ToolState::Error);
        if raise {
            Err(err)
        } else {
            Ok(None)
        }
    }

    /// Report shutdown, wait for in-flight reactions, then disconnect.
    pub async fn shut_down(&self) -> Result<(), CycleError> {
        info!("tearing down reaction cycle");
        let tasks = {
            let mut reactions = self.inner.reactions.lock();
            reactions.accepting = false;
            std::mem::take(&mut reactions.tasks)
        };
        self.inner.reporter.set(ToolState::ShuttingDown);
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "reaction task join error");
            }
        }
        self.inner.transport.disconnect()?;
        info!("reaction cycle shut down");
        Ok(())
    }

    /// Start up, react until `shutdown` resolves, then shut down.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), CycleError>
    where
        F: Future<Output = ()>,
    {
        self.start_up().await?;
        shutdown.await;
        info!("shutdown requested");
        self.shut_down().await
    }
}

/// Resolve on ctrl-c or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
