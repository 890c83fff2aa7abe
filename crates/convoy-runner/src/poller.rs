//! Job acquisition loop
//!
//! A pure state machine models the poll/claim/dispatch cycle with no I/O:
//! `transition(state, event) -> (state, actions)`. All transitions are
//! deterministic; invalid combinations leave the state unchanged and
//! produce no actions (never panic). The async [`JobPoller`] drives the
//! machine against the real service.
//!
//! One job at a time, by design: the machine never emits a `Claim` action
//! while a job is dispatched or draining. Horizontal scale comes from
//! running more agent processes, not from an internal queue.

use crate::executor::JobExecutor;
use crate::stream::OutputChunk;
use convoy_api::wire::{ClaimRequest, FinishRequest};
use convoy_api::ApiClient;
use convoy_core::{AgentConfig, AgentError, AgentIdentity, ExitStatus, Job, JobState, Result};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Poller state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerState {
    /// Between cycles; nothing in flight
    Idle,
    /// Asking the service for work
    Polling,
    /// A job was offered; claiming it
    Claiming { job_id: String },
    /// A claimed job is running to completion
    Dispatched { job_id: String },
    /// Shutdown requested; waiting for in-flight work
    Draining { job_id: Option<String> },
    /// Terminal
    Stopped,
}

/// Events that drive the poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerEvent {
    /// Start a poll cycle
    Tick,
    /// The service had no work for us
    NoJob,
    /// The poll call failed (transient; never fatal)
    PollFailed,
    /// The service offered a job
    JobOffered { job_id: String },
    /// Our conditional claim won
    ClaimAccepted,
    /// Another agent won the claim, or the job was canceled
    ClaimRejected,
    /// The dispatched job ran to completion and was reported
    JobFinished,
    /// External shutdown signal
    ShutdownRequested,
    /// Nothing left in flight
    DrainComplete,
}

/// Side effects the loop must execute for a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerAction {
    /// Ask the service for the next job
    Poll,
    /// Sleep one poll interval
    Sleep,
    /// Claim the offered job
    Claim { job_id: String },
    /// Run the claimed job to completion and report it
    Run { job_id: String },
    /// Wait for the running job before stopping
    WaitForJob { job_id: String },
    /// Terminate the loop
    Stop,
}

/// Pure state transition function.
///
/// Invalid transitions return the state unchanged with no actions; the
/// function never panics.
pub fn transition(state: PollerState, event: PollerEvent) -> (PollerState, Vec<PollerAction>) {
    match (state, event) {
        (PollerState::Idle, PollerEvent::Tick) => (PollerState::Polling, vec![PollerAction::Poll]),

        (PollerState::Polling, PollerEvent::NoJob) => (PollerState::Idle, vec![PollerAction::Sleep]),
        (PollerState::Polling, PollerEvent::PollFailed) => {
            (PollerState::Idle, vec![PollerAction::Sleep])
        }
        (PollerState::Polling, PollerEvent::JobOffered { job_id }) => (
            PollerState::Claiming {
                job_id: job_id.clone(),
            },
            vec![PollerAction::Claim { job_id }],
        ),

        (PollerState::Claiming { job_id }, PollerEvent::ClaimAccepted) => (
            PollerState::Dispatched {
                job_id: job_id.clone(),
            },
            vec![PollerAction::Run { job_id }],
        ),
        // discard the offer and go straight back to polling
        (PollerState::Claiming { .. }, PollerEvent::ClaimRejected) => (PollerState::Idle, vec![]),

        (PollerState::Dispatched { .. }, PollerEvent::JobFinished) => (PollerState::Idle, vec![]),

        // shutdown: drain whatever is in flight, then stop
        (PollerState::Dispatched { job_id }, PollerEvent::ShutdownRequested) => (
            PollerState::Draining {
                job_id: Some(job_id.clone()),
            },
            vec![PollerAction::WaitForJob { job_id }],
        ),
        (PollerState::Idle | PollerState::Polling | PollerState::Claiming { .. }, PollerEvent::ShutdownRequested) => {
            (PollerState::Draining { job_id: None }, vec![])
        }
        (PollerState::Draining { job_id: Some(_) }, PollerEvent::JobFinished) => {
            (PollerState::Draining { job_id: None }, vec![])
        }
        (PollerState::Draining { job_id: None }, PollerEvent::DrainComplete) => {
            (PollerState::Stopped, vec![PollerAction::Stop])
        }

        // everything else is invalid: hold position, do nothing
        (state, _) => (state, vec![]),
    }
}

/// The top-level agent loop
pub struct JobPoller {
    client: ApiClient,
    config: AgentConfig,
    identity: AgentIdentity,
    poll_interval: Duration,
}

impl JobPoller {
    pub fn new(client: ApiClient, config: AgentConfig, identity: AgentIdentity) -> Self {
        Self {
            client,
            config,
            identity,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run until `shutdown` fires. Poll failures are logged and retried
    /// next cycle; only auth failures (revoked token) are fatal.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
        log_tx: mpsc::Sender<OutputChunk>,
    ) -> Result<()> {
        let mut state = PollerState::Idle;
        let mut current: Option<Job> = None;

        tracing::info!(
            "Agent {} polling {} every {:?}",
            self.identity.name,
            self.client.base_url(),
            self.poll_interval
        );

        loop {
            if *shutdown.borrow() && !matches!(state, PollerState::Draining { .. } | PollerState::Stopped) {
                (state, _) = transition(state, PollerEvent::ShutdownRequested);
            }

            state = match state {
                PollerState::Stopped => break,
                // A claimed job outlives the shutdown signal: if the claim
                // was accepted while shutdown fired, the job is still run
                // and reported before the agent stops.
                PollerState::Draining { job_id: Some(id) } => {
                    match current.take() {
                        Some(job) => {
                            let status = self.dispatch(&job, log_tx.clone()).await;
                            self.finish(&job, status).await;
                        }
                        None => tracing::error!("No job payload for draining job {}", id),
                    }
                    transition(
                        PollerState::Draining { job_id: Some(id) },
                        PollerEvent::JobFinished,
                    )
                    .0
                }
                PollerState::Draining { job_id: None } => {
                    transition(PollerState::Draining { job_id: None }, PollerEvent::DrainComplete).0
                }
                PollerState::Idle => transition(PollerState::Idle, PollerEvent::Tick).0,
                PollerState::Polling => match self.poll_next().await {
                    Ok(Some(job)) => {
                        tracing::info!("Offered job {} (build {})", job.id, job.build_id);
                        let event = PollerEvent::JobOffered {
                            job_id: job.id.clone(),
                        };
                        current = Some(job);
                        transition(PollerState::Polling, event).0
                    }
                    Ok(None) => {
                        let next = transition(PollerState::Polling, PollerEvent::NoJob).0;
                        self.sleep(&mut shutdown).await;
                        next
                    }
                    Err(e @ AgentError::Auth(_)) => return Err(e),
                    Err(e) => {
                        tracing::warn!("Poll failed, retrying next cycle: {}", e);
                        let next = transition(PollerState::Polling, PollerEvent::PollFailed).0;
                        self.sleep(&mut shutdown).await;
                        next
                    }
                },
                PollerState::Claiming { job_id } => match self.claim(&job_id).await {
                    Ok(Some(job)) => {
                        current = Some(job);
                        transition(PollerState::Claiming { job_id }, PollerEvent::ClaimAccepted).0
                    }
                    Ok(None) => {
                        tracing::info!("Lost the claim on job {}, resuming polling", job_id);
                        current = None;
                        transition(PollerState::Claiming { job_id }, PollerEvent::ClaimRejected).0
                    }
                    Err(e @ AgentError::Auth(_)) => return Err(e),
                    Err(e) => {
                        tracing::warn!("Claim on job {} failed: {}", job_id, e);
                        current = None;
                        transition(PollerState::Claiming { job_id }, PollerEvent::ClaimRejected).0
                    }
                },
                PollerState::Dispatched { job_id } => {
                    match current.take() {
                        Some(job) => {
                            let status = self.dispatch(&job, log_tx.clone()).await;
                            self.finish(&job, status).await;
                        }
                        // claim succeeded but we lost the payload; treat as done
                        None => tracing::error!("No job payload for dispatched job {}", job_id),
                    }
                    transition(PollerState::Dispatched { job_id }, PollerEvent::JobFinished).0
                }
            };
        }

        tracing::info!("Agent {} stopped", self.identity.name);
        Ok(())
    }

    async fn poll_next(&self) -> Result<Option<Job>> {
        self.client
            .get_optional(&format!("/jobs/next?agent_id={}", self.identity.id))
            .await
    }

    async fn claim(&self, job_id: &str) -> Result<Option<Job>> {
        let request = ClaimRequest {
            job_id: job_id.to_string(),
            agent_id: self.identity.id.clone(),
        };
        self.client.post_conditional("/jobs/next", &request).await
    }

    /// Run one claimed job with a live cancellation watcher.
    async fn dispatch(&self, job: &Job, log_tx: mpsc::Sender<OutputChunk>) -> ExitStatus {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let watcher = tokio::spawn(watch_for_cancellation(
            self.client.clone(),
            job.id.clone(),
            self.poll_interval,
            cancel_tx,
        ));

        let executor = JobExecutor::new(&self.config, &self.identity);
        let result = executor.run(job, cancel_rx, log_tx).await;
        watcher.abort();

        match result {
            Ok(status) => status,
            Err(e) => {
                // a bootstrap that could not run is a job failure, never success
                tracing::error!("Job {} did not run: {}", job.id, e);
                ExitStatus::Failure(-1)
            }
        }
    }

    /// Report the terminal status. By this point every artifact upload the
    /// job performed has been acknowledged (they run inside the bootstrap,
    /// which has exited), so consumers of "job finished" can trust
    /// artifact availability.
    async fn finish(&self, job: &Job, status: ExitStatus) {
        let request = FinishRequest::from(status);
        if let Err(e) = self
            .client
            .post_unit(&format!("/jobs/{}/finish", job.id), &request)
            .await
        {
            tracing::error!("Failed to report job {} as finished: {}", job.id, e);
        }
    }

    async fn sleep(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Poll the job resource until it reports cancellation, then fire the
/// cancel signal. Aborted by the dispatcher when the job finishes first.
async fn watch_for_cancellation(
    client: ApiClient,
    job_id: String,
    interval: Duration,
    cancel_tx: watch::Sender<bool>,
) {
    loop {
        tokio::time::sleep(interval).await;
        match client.get_optional::<Job>(&format!("/jobs/{}", job_id)).await {
            Ok(Some(job)) if job.state == JobState::Canceled => {
                tracing::info!("Service canceled job {}", job_id);
                let _ = cancel_tx.send(true);
                break;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Cancellation poll for job {} failed: {}", job_id, e),
        }
    }
}
