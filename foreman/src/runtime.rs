//! Assembly of the full system from one [`ForemanConfig`].

use crate::config::{AuditConfig, ForemanConfig};
use foreman_budget::{BudgetEnforcer, BudgetPeriod};
use foreman_core::{
    AuditError, AuditLog, Clock, ConfigError, DecisionError, Payload, SupervisorError,
    SystemClock, WorkerDefinition, WorkerId,
};
use foreman_supervisor::{DispatcherHandle, PayloadRegistry, Supervisor};
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "anomaly")]
use foreman_anomaly::{AlertStream, AnomalyMonitor};
#[cfg(feature = "anomaly")]
use foreman_core::AlertSink;
#[cfg(feature = "decision")]
use foreman_core::WorkerControl;
#[cfg(feature = "decision")]
use foreman_decision::{DecisionEngine, EngineHandle};

/// Errors from building or starting a [`Foreman`].
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ForemanError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The audit log could not be read during recovery.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// A supervisor command failed.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// Decision state could not be restored.
    #[error(transparent)]
    Decision(#[from] DecisionError),
}

/// Builder for [`Foreman`].
pub struct ForemanBuilder {
    config: ForemanConfig,
    registry: PayloadRegistry,
    workers: Vec<WorkerDefinition>,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditLog>>,
    #[cfg(feature = "anomaly")]
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl std::fmt::Debug for ForemanBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForemanBuilder")
            .field("config", &self.config)
            .field("payloads", &self.registry.kinds())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl ForemanBuilder {
    /// Make `payload` available to workers whose type is `kind`.
    pub fn payload(mut self, kind: impl Into<String>, payload: Arc<dyn Payload>) -> Self {
        self.registry.register(kind, payload);
        self
    }

    /// Register a worker in addition to the configured ones.
    pub fn worker(mut self, definition: WorkerDefinition) -> Self {
        self.workers.push(definition);
        self
    }

    /// Use a custom time source for every component.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use this audit log instead of the configured backend.
    pub fn audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Deliver anomalies to `sink` once started.
    #[cfg(feature = "anomaly")]
    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Wire every component together, register the workers and recover
    /// today's spend and any pending decisions from the audit log.
    pub async fn build(self) -> Result<Foreman, ForemanError> {
        let ForemanBuilder {
            config,
            registry,
            workers,
            clock,
            audit,
            #[cfg(feature = "anomaly")]
            sinks,
        } = self;
        config.validate()?;
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let audit = match audit {
            Some(audit) => Some(audit),
            None => open_audit(&config.audit)?,
        };

        #[cfg(feature = "anomaly")]
        let (monitor, alerts) = {
            let (monitor, alerts) = AnomalyMonitor::new(config.anomaly.clone())?;
            (Arc::new(monitor), alerts)
        };

        let enforcer = BudgetEnforcer::with_clock(config.budget.clone(), Arc::clone(&clock))?;
        #[cfg(feature = "anomaly")]
        let enforcer = enforcer.with_observer(monitor.clone());
        let enforcer = Arc::new(enforcer);

        let mut supervisor = Supervisor::builder(Arc::clone(&enforcer), registry)
            .config(config.supervisor.clone())
            .clock(Arc::clone(&clock));
        if let Some(audit) = &audit {
            supervisor = supervisor.audit(Arc::clone(audit));
        }
        #[cfg(feature = "anomaly")]
        {
            supervisor = supervisor.observer(monitor.clone());
        }
        let supervisor = supervisor.build()?;

        for definition in config.workers.iter().cloned().chain(workers) {
            supervisor.register(definition)?;
        }

        if let Some(audit) = &audit {
            let since = BudgetPeriod::Daily.start_of(clock.now());
            let entries = audit.ledger_since(since).await?;
            let applied = enforcer.restore(&entries);
            tracing::info!(entries = entries.len(), applied, "foreman.restore.ledger");
        }

        #[cfg(feature = "decision")]
        let engine = {
            let control: Arc<dyn WorkerControl> = Arc::new(supervisor.clone());
            let mut engine = DecisionEngine::builder(control, Arc::clone(&enforcer))
                .config(config.decision.clone())
                .clock(Arc::clone(&clock));
            if let Some(audit) = &audit {
                engine = engine.audit(Arc::clone(audit));
            }
            let engine = engine.build()?;
            engine.restore().await?;
            engine
        };

        Ok(Foreman {
            config,
            enforcer,
            supervisor,
            audit,
            #[cfg(feature = "anomaly")]
            monitor,
            #[cfg(feature = "anomaly")]
            alerts: Some(alerts),
            #[cfg(feature = "anomaly")]
            sinks,
            #[cfg(feature = "decision")]
            engine,
            running: None,
        })
    }
}

fn open_audit(config: &AuditConfig) -> Result<Option<Arc<dyn AuditLog>>, ConfigError> {
    match config {
        AuditConfig::None => Ok(None),
        #[cfg(feature = "audit-memory")]
        AuditConfig::Memory => Ok(Some(Arc::new(foreman_audit_memory::MemoryAuditLog::new()))),
        #[cfg(not(feature = "audit-memory"))]
        AuditConfig::Memory => Err(ConfigError::invalid(
            "audit.backend",
            "memory backend requires the `audit-memory` feature",
        )),
        #[cfg(feature = "audit-fs")]
        AuditConfig::Fs { dir } => Ok(Some(Arc::new(foreman_audit_fs::FsAuditLog::new(dir)))),
        #[cfg(not(feature = "audit-fs"))]
        AuditConfig::Fs { .. } => Err(ConfigError::invalid(
            "audit.backend",
            "fs backend requires the `audit-fs` feature",
        )),
    }
}

struct Running {
    dispatcher: DispatcherHandle,
    #[cfg(feature = "decision")]
    engine: Option<EngineHandle>,
    #[cfg(feature = "anomaly")]
    alerts: Option<tokio::task::JoinHandle<()>>,
}

/// A supervisor with its budget, monitor and decision engine.
///
/// Build with [`Foreman::builder`], then [`Foreman::start`] to spawn the
/// background loops and [`Foreman::shutdown`] to stop them.
pub struct Foreman {
    config: ForemanConfig,
    enforcer: Arc<BudgetEnforcer>,
    supervisor: Supervisor,
    audit: Option<Arc<dyn AuditLog>>,
    #[cfg(feature = "anomaly")]
    monitor: Arc<AnomalyMonitor>,
    #[cfg(feature = "anomaly")]
    alerts: Option<AlertStream>,
    #[cfg(feature = "anomaly")]
    sinks: Vec<Arc<dyn AlertSink>>,
    #[cfg(feature = "decision")]
    engine: DecisionEngine,
    running: Option<Running>,
}

impl std::fmt::Debug for Foreman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Foreman")
            .field("supervisor", &self.supervisor)
            .field("audit", &self.audit.is_some())
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl Foreman {
    /// Start building from `config`.
    pub fn builder(config: ForemanConfig) -> ForemanBuilder {
        ForemanBuilder {
            config,
            registry: PayloadRegistry::new(),
            workers: Vec::new(),
            clock: None,
            audit: None,
            #[cfg(feature = "anomaly")]
            sinks: Vec::new(),
        }
    }

    /// The configuration the system was built from.
    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    /// The budget enforcer shared by every component.
    pub fn enforcer(&self) -> &Arc<BudgetEnforcer> {
        &self.enforcer
    }

    /// The supervisor.
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// The audit log, if one is configured.
    pub fn audit(&self) -> Option<&Arc<dyn AuditLog>> {
        self.audit.as_ref()
    }

    /// The anomaly monitor.
    #[cfg(feature = "anomaly")]
    pub fn monitor(&self) -> &Arc<AnomalyMonitor> {
        &self.monitor
    }

    /// Take the alert stream to consume anomalies directly. Once taken,
    /// [`Foreman::start`] no longer fans out to the configured sinks.
    #[cfg(feature = "anomaly")]
    pub fn take_alerts(&mut self) -> Option<AlertStream> {
        self.alerts.take()
    }

    /// The decision engine.
    #[cfg(feature = "decision")]
    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    /// Whether [`Foreman::start`] has been called without a matching
    /// [`Foreman::shutdown`].
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Register and start a worker while running.
    pub fn deploy(&self, definition: WorkerDefinition) -> Result<WorkerId, ForemanError> {
        let id = self.supervisor.register(definition)?;
        self.supervisor.start(&id)?;
        Ok(id)
    }

    /// Start every worker and spawn the dispatcher, the decision loop and
    /// alert delivery. Must be called from within a tokio runtime. Calling
    /// it again while running does nothing.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        self.supervisor.start_all();
        let dispatcher = self.supervisor.spawn_dispatcher();

        #[cfg(feature = "decision")]
        let engine = self
            .engine
            .config()
            .enabled
            .then(|| self.engine.spawn());

        #[cfg(feature = "anomaly")]
        let alerts = self
            .alerts
            .take()
            .map(|stream| stream.spawn(self.sinks.clone()));

        tracing::info!(
            workers = self.supervisor.list().len(),
            "foreman.started"
        );
        self.running = Some(Running {
            dispatcher,
            #[cfg(feature = "decision")]
            engine,
            #[cfg(feature = "anomaly")]
            alerts,
        });
    }

    /// Stop the loops and every worker. In-flight runs finish and settle
    /// before the dispatcher handle resolves.
    pub async fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        #[cfg(feature = "decision")]
        if let Some(engine) = running.engine {
            engine.shutdown().await;
        }
        self.supervisor.stop_all();
        running.dispatcher.shutdown().await;
        // The monitor outlives the stream task, so the task never ends
        // on its own.
        #[cfg(feature = "anomaly")]
        if let Some(alerts) = running.alerts {
            alerts.abort();
        }
        tracing::info!("foreman.stopped");
    }
}
