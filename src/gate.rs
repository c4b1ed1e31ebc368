//! Gate runtime: wires the engine together and dispatches inbound events.

use crate::audit::{AuditSink, JsonlAuditLog};
use crate::config::GateConfig;
use crate::error::{Error, Result};
use crate::event::{create_event_channel, GateEvent, GateEventsChannel, OperatorLog};
use crate::gateway::{CredentialSink, InboundEvent, Notifier};
use crate::retry::{Retrier, RetryBudget};
use crate::roster::{source_from_config, RosterCache, RosterPolicy, RosterSource};
use crate::verify::{Collaborators, EscalationNotifier, LabelFormat, Verifier, VerifierConfig};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Inbound events buffered before `submit` starts waiting.
const INBOUND_CAPACITY: usize = 1024;

/// Builder for a gate.
///
/// The credential sink and notifier come from the chat gateway adapter and
/// are required. The roster source and audit sink default to what the
/// configuration describes.
pub struct GateBuilder {
    config: GateConfig,
    roster_source: Option<Arc<dyn RosterSource>>,
    credentials: Option<Arc<dyn CredentialSink>>,
    notifier: Option<Arc<dyn Notifier>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl GateBuilder {
    /// Create a new builder with the given configuration.
    #[must_use]
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            roster_source: None,
            credentials: None,
            notifier: None,
            audit: None,
        }
    }

    /// Use this roster source instead of the configured one.
    #[must_use]
    pub fn with_roster_source(mut self, source: Arc<dyn RosterSource>) -> Self {
        self.roster_source = Some(source);
        self
    }

    /// Credential store of the chat provider.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialSink>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Channel poster of the chat provider.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use this audit sink instead of the JSON-lines file.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Build the gate.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a required
    /// collaborator is missing, or the audit file cannot be opened.
    pub async fn build(self) -> Result<RunningGate> {
        self.config.validate()?;
        debug!("Building admission-gate with config: {:?}", self.config);

        let credentials = self
            .credentials
            .ok_or_else(|| Error::Config("a credential sink is required".to_string()))?;
        let notifier = self
            .notifier
            .ok_or_else(|| Error::Config("a notifier is required".to_string()))?;
        let audit: Arc<dyn AuditSink> = match self.audit {
            Some(audit) => audit,
            None => Arc::new(JsonlAuditLog::open(&self.config.audit_path()).await?),
        };
        let source = match self.roster_source {
            Some(source) => source,
            None => source_from_config(&self.config.roster)?,
        };

        let (events_tx, events_rx) = create_event_channel();
        let ops = OperatorLog::new(events_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let roster = RosterCache::new(
            source,
            RosterPolicy::from(&self.config.roster),
            ops.clone(),
        );
        let deps = Collaborators {
            credentials,
            notifier: Arc::clone(&notifier),
            audit,
            retrier: Retrier::new(RetryBudget {
                max_wait: self.config.max_retry_wait(),
            }),
            ops: ops.clone(),
        };
        let verifier = Verifier::new(
            LabelFormat::from_config(&self.config.format)?,
            roster.clone(),
            deps.clone(),
            VerifierConfig {
                ack_budget: self.config.ack_budget(),
                welcome_channel: self.config.welcome_channel,
            },
        );
        let escalation = EscalationNotifier::new(
            deps,
            self.config.escalation.clone(),
            self.config.ack_budget(),
        );

        Ok(RunningGate {
            config: self.config,
            verifier: Arc::new(verifier),
            escalation: Arc::new(escalation),
            roster,
            notifier,
            ops,
            events_rx: Some(events_rx),
            handle: GateHandle {
                inbound: inbound_tx,
                shutdown: Arc::new(shutdown_tx),
            },
            inbound_rx,
            shutdown_rx,
        })
    }
}

/// Cloneable handle used by gateway adapters to feed a running gate.
#[derive(Clone)]
pub struct GateHandle {
    inbound: mpsc::Sender<InboundEvent>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl GateHandle {
    /// Hand an event to the gate.
    ///
    /// # Errors
    ///
    /// Returns an error if the gate has stopped.
    pub async fn submit(&self, event: InboundEvent) -> Result<()> {
        self.inbound
            .send(event)
            .await
            .map_err(|_| Error::Internal("gate is not running".to_string()))
    }

    /// Request the gate to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// A gate ready to run.
pub struct RunningGate {
    config: GateConfig,
    verifier: Arc<Verifier>,
    escalation: Arc<EscalationNotifier>,
    roster: RosterCache,
    notifier: Arc<dyn Notifier>,
    ops: OperatorLog,
    events_rx: Option<GateEventsChannel>,
    handle: GateHandle,
    inbound_rx: mpsc::Receiver<InboundEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RunningGate {
    /// Handle for submitting events and requesting shutdown.
    #[must_use]
    pub fn handle(&self) -> GateHandle {
        self.handle.clone()
    }

    /// The verifier, for operator actions such as revoking a credential.
    #[must_use]
    pub fn verifier(&self) -> &Arc<Verifier> {
        &self.verifier
    }

    /// The roster cache.
    #[must_use]
    pub fn roster(&self) -> &RosterCache {
        &self.roster
    }

    /// Get a receiver for gate events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<GateEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to gate events.
    #[must_use]
    pub fn subscribe_events(&self) -> GateEventsChannel {
        self.ops.subscribe()
    }

    /// Run the gate until shutdown is requested.
    ///
    /// Each inbound event runs in its own task. On shutdown the roster is
    /// torn down first, so attempts waiting on a refetch finish with a
    /// roster error instead of hanging, then running attempts are drained.
    ///
    /// # Errors
    ///
    /// No error is raised today; event faults are handled per task.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting admission-gate");
        self.ops.emit(GateEvent::Started);

        // A failed first fetch is not fatal: lookups refetch on demand.
        match self.roster.init().await {
            Ok(entries) => info!("Roster ready with {entries} entries"),
            Err(e) => warn!("Initial roster fetch failed: {e}"),
        }

        let forwarder = self.config.log_channel.map(|channel| {
            info!("Forwarding operator log to channel {}", channel.0);
            self.ops.forward_to(Arc::clone(&self.notifier), channel)
        });

        let mut tasks = JoinSet::new();
        info!("Gate running, waiting for events");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, initiating shutdown");
                    self.shutdown();
                    break;
                }
                event = self.inbound_rx.recv() => {
                    let Some(event) = event else {
                        info!("Inbound channel closed");
                        break;
                    };
                    self.dispatch(&mut tasks, event);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Event task failed: {e}");
                    }
                }
            }
        }

        self.ops.emit(GateEvent::ShuttingDown);
        self.roster.teardown();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Event task failed: {e}");
            }
        }
        // The verifier still holds event senders, so the forwarder would
        // otherwise outlive the gate.
        if let Some(forwarder) = forwarder {
            forwarder.abort();
            let _ = forwarder.await;
        }
        info!("Gate shutdown complete");
        Ok(())
    }

    /// Request the gate to shut down.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    fn dispatch(&self, tasks: &mut JoinSet<()>, event: InboundEvent) {
        debug!("Dispatching {event:?}");
        match event {
            InboundEvent::VerifyRequested { claimant, handle } => {
                let verifier = Arc::clone(&self.verifier);
                tasks.spawn(async move {
                    verifier.handle_verify(claimant, handle).await;
                });
            }
            InboundEvent::EscalationRequested { claimant, handle } => {
                let escalation = Arc::clone(&self.escalation);
                tasks.spawn(async move {
                    escalation.escalate(claimant, handle).await;
                });
            }
        }
    }
}
