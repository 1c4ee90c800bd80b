//! Runs network operations that may stop for credentials, asking the user and
//! retrying until the operation settles.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use git::{ProgressMonitor, RemoteCredentials, RemoteOperationResult, ResultCode};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use ts_rs::TS;

use super::{
    credentials::{CredentialRecord, CredentialStore},
    progress::{ProgressRelay, ProgressUpdate},
};

pub const CANCELLED_MESSAGE: &str = "User cancelled operation";
pub const BUSY_MESSAGE: &str = "another remote operation is already running";

/// What a second caller gets while an operation is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(rename_all = "snake_case")]
pub enum FlightPolicy {
    /// Wait for the running operation to finish, then run.
    #[default]
    Queue,
    /// Fail straight away.
    Reject,
}

/// Handed to the front-end when an operation needs credentials.
#[derive(Debug, Clone)]
pub struct CredentialRequest {
    pub header: String,
    pub code: ResultCode,
    pub message: String,
    /// What was used last round, secret removed.
    pub previous: RemoteCredentials,
}

impl CredentialRequest {
    pub fn new(result: &RemoteOperationResult, previous: &RemoteCredentials) -> Self {
        let mut previous = previous.clone();
        previous.secret = None;
        Self {
            header: prompt_header(result),
            code: result.code,
            message: result.message.clone(),
            previous,
        }
    }
}

/// Heading shown above the credential prompt.
pub fn prompt_header(result: &RemoteOperationResult) -> String {
    match result.code {
        ResultCode::VcsAuthRequired => "needs VCS login".to_string(),
        ResultCode::AuthRequired => "needs login".to_string(),
        ResultCode::NotAuthorized => "invalid credentials".to_string(),
        _ => result.message.clone(),
    }
}

#[derive(Debug, Clone)]
pub enum CredentialResponse {
    Provided(RemoteCredentials),
    Cancelled,
}

#[async_trait]
pub trait CredentialPrompter: Send + Sync {
    async fn prompt(&self, request: CredentialRequest) -> CredentialResponse;
}

/// A request in flight to the front-end, answered exactly once.
#[derive(Debug)]
pub struct PendingPrompt {
    pub request: CredentialRequest,
    responder: oneshot::Sender<CredentialResponse>,
}

impl PendingPrompt {
    pub fn respond(self, response: CredentialResponse) {
        if self.responder.send(response).is_err() {
            tracing::debug!("Credential prompt answered after the operation gave up");
        }
    }
}

/// Prompter that forwards requests over a channel to whoever renders them.
/// If the receiving side drops a request unanswered, that counts as cancel.
#[derive(Clone)]
pub struct ChannelPrompter {
    tx: mpsc::UnboundedSender<PendingPrompt>,
}

impl ChannelPrompter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingPrompt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CredentialPrompter for ChannelPrompter {
    async fn prompt(&self, request: CredentialRequest) -> CredentialResponse {
        let (responder, gate) = oneshot::channel();
        if self.tx.send(PendingPrompt { request, responder }).is_err() {
            tracing::warn!("No front-end is listening for credential prompts");
            return CredentialResponse::Cancelled;
        }
        gate.await.unwrap_or(CredentialResponse::Cancelled)
    }
}

pub struct RemoteOperationCoordinator {
    store: Arc<dyn CredentialStore>,
    policy: FlightPolicy,
    flight: Mutex<()>,
    relay: Arc<ProgressRelay>,
}

impl RemoteOperationCoordinator {
    pub fn new(store: Arc<dyn CredentialStore>, policy: FlightPolicy) -> Self {
        Self::with_relay(store, policy, ProgressRelay::new())
    }

    pub fn with_relay(
        store: Arc<dyn CredentialStore>,
        policy: FlightPolicy,
        relay: ProgressRelay,
    ) -> Self {
        Self {
            store,
            policy,
            flight: Mutex::new(()),
            relay: Arc::new(relay),
        }
    }

    pub fn progress(&self) -> watch::Receiver<ProgressUpdate> {
        self.relay.subscribe()
    }

    /// Credentials for a first attempt, filled from a saved record if any.
    pub async fn initial_credentials(
        &self,
        remote_url: &str,
        repo_path: &Path,
    ) -> RemoteCredentials {
        let mut credentials = RemoteCredentials::new(remote_url, repo_path);
        match self.store.lookup(remote_url, repo_path).await {
            Ok(Some(record)) => {
                tracing::debug!(%remote_url, "Using saved credentials");
                record.apply_to(&mut credentials);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read saved credentials: {e}"),
        }
        credentials
    }

    /// Run `op` until it succeeds, fails, or the user cancels. Authentication
    /// failures ask `prompter` once per round and retry with the answer.
    pub async fn run<F>(
        &self,
        op: F,
        credentials: RemoteCredentials,
        prompter: &dyn CredentialPrompter,
    ) -> RemoteOperationResult
    where
        F: Fn(&RemoteCredentials, &dyn ProgressMonitor) -> RemoteOperationResult
            + Send
            + Sync
            + 'static,
    {
        let _flight = match self.policy {
            FlightPolicy::Queue => self.flight.lock().await,
            FlightPolicy::Reject => match self.flight.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    tracing::warn!("Rejected remote operation: {BUSY_MESSAGE}");
                    return RemoteOperationResult::error(BUSY_MESSAGE);
                }
            },
        };

        let op = Arc::new(op);
        let mut credentials = credentials;
        let mut round = 0u32;
        loop {
            round += 1;
            let result = self.attempt(op.clone(), credentials.clone(), round).await;
            match result.code {
                ResultCode::Ok | ResultCode::Cancel => return result,
                ResultCode::Error => {
                    tracing::error!(round, "Remote operation failed: {}", result.message);
                    return result;
                }
                ResultCode::AuthRequired
                | ResultCode::VcsAuthRequired
                | ResultCode::NotAuthorized => {
                    let request = CredentialRequest::new(&result, &credentials);
                    tracing::info!(round, code = ?result.code, "Remote operation needs credentials");
                    match prompter.prompt(request).await {
                        CredentialResponse::Cancelled => {
                            tracing::info!(round, "Credential prompt cancelled");
                            return RemoteOperationResult::cancel(CANCELLED_MESSAGE);
                        }
                        CredentialResponse::Provided(answer) => {
                            credentials = merge_answer(&credentials, answer);
                            self.remember(&credentials).await;
                        }
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip(self, op, credentials))]
    async fn attempt<F>(
        &self,
        op: Arc<F>,
        credentials: RemoteCredentials,
        round: u32,
    ) -> RemoteOperationResult
    where
        F: Fn(&RemoteCredentials, &dyn ProgressMonitor) -> RemoteOperationResult
            + Send
            + Sync
            + 'static,
    {
        let relay = self.relay.clone();
        match tokio::task::spawn_blocking(move || (*op)(&credentials, &*relay)).await {
            Ok(result) => {
                tracing::debug!(code = ?result.code, "Remote operation attempt finished");
                result
            }
            Err(e) => {
                tracing::error!("Remote operation worker failed: {e}");
                RemoteOperationResult::error(format!("remote operation worker failed: {e}"))
            }
        }
    }

    async fn remember(&self, credentials: &RemoteCredentials) {
        let record = CredentialRecord::from_credentials(credentials);
        if let Err(e) = self.store.save(record).await {
            tracing::warn!("Failed to save credentials: {e}");
        }
    }
}

/// The front-end may leave the identifying fields blank.
fn merge_answer(previous: &RemoteCredentials, mut answer: RemoteCredentials) -> RemoteCredentials {
    if answer.remote_url.is_empty() {
        answer.remote_url = previous.remote_url.clone();
    }
    if answer.repo_path.as_os_str().is_empty() {
        answer.repo_path = previous.repo_path.clone();
    }
    answer
}
