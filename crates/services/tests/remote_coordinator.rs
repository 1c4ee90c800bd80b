use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use git::{ProgressMonitor, RemoteCredentials, RemoteOperationResult, ResultCode};
use services::services::{
    credentials::{CredentialRecord, CredentialStore, MemoryCredentialStore},
    remote_operation::{
        BUSY_MESSAGE, CANCELLED_MESSAGE, ChannelPrompter, CredentialPrompter, CredentialRequest,
        CredentialResponse, FlightPolicy, RemoteOperationCoordinator,
    },
};

const URL: &str = "https://example.com/team/repo.git";

/// Answers every prompt the same way and remembers what it was asked.
struct ScriptedPrompter {
    answer: Option<RemoteCredentials>,
    requests: Mutex<Vec<CredentialRequest>>,
}

impl ScriptedPrompter {
    fn cancelling() -> Self {
        Self {
            answer: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn providing(username: &str, secret: &str, remember: bool) -> Self {
        let mut answer = RemoteCredentials::default();
        answer.username = Some(username.to_string());
        answer.secret = Some(secret.to_string());
        answer.remember = remember;
        Self {
            answer: Some(answer),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn prompts(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CredentialPrompter for ScriptedPrompter {
    async fn prompt(&self, request: CredentialRequest) -> CredentialResponse {
        self.requests.lock().unwrap().push(request);
        match &self.answer {
            Some(answer) => CredentialResponse::Provided(answer.clone()),
            None => CredentialResponse::Cancelled,
        }
    }
}

fn coordinator(policy: FlightPolicy) -> (RemoteOperationCoordinator, Arc<MemoryCredentialStore>) {
    let store = Arc::new(MemoryCredentialStore::new());
    (
        RemoteOperationCoordinator::new(store.clone(), policy),
        store,
    )
}

fn start() -> RemoteCredentials {
    RemoteCredentials::new(URL, "/work/repo")
}

#[tokio::test]
async fn cancelling_the_prompt_ends_the_operation() {
    let (coord, store) = coordinator(FlightPolicy::Queue);
    let prompter = ScriptedPrompter::cancelling();
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    let result = coord
        .run(
            move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                RemoteOperationResult::new(ResultCode::AuthRequired, "authentication required")
            },
            start(),
            &prompter,
        )
        .await;

    assert_eq!(result.code, ResultCode::Cancel);
    assert_eq!(result.message, CANCELLED_MESSAGE);
    assert_eq!(prompter.prompts(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn rejected_credentials_are_asked_for_again_then_saved_once() {
    let (coord, store) = coordinator(FlightPolicy::Queue);
    let prompter = ScriptedPrompter::providing("alice", "hunter2", true);
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    let result = coord
        .run(
            move |creds, _| {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    return RemoteOperationResult::new(ResultCode::NotAuthorized, "denied");
                }
                assert_eq!(creds.username.as_deref(), Some("alice"));
                assert_eq!(creds.remote_url, URL);
                RemoteOperationResult::ok("Pushed refs/heads/main")
            },
            start(),
            &prompter,
        )
        .await;

    assert_eq!(result.code, ResultCode::Ok);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.save_count(), 1);

    let requests = prompter.requests.lock().unwrap().clone();
    assert_eq!(requests[0].header, "invalid credentials");
    assert_eq!(requests[0].previous.remote_url, URL);

    let saved = store.records().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].username.as_deref(), Some("alice"));
    assert_eq!(saved[0].secret.as_deref(), Some("hunter2"));
}

#[tokio::test]
async fn secret_is_not_saved_without_remember() {
    let (coord, store) = coordinator(FlightPolicy::Queue);
    let prompter = ScriptedPrompter::providing("alice", "hunter2", false);
    let calls = Arc::new(AtomicUsize::new(0));

    let counted = calls.clone();
    let result = coord
        .run(
            move |_, _| {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    RemoteOperationResult::new(ResultCode::VcsAuthRequired, "ssh auth")
                } else {
                    RemoteOperationResult::ok("done")
                }
            },
            start(),
            &prompter,
        )
        .await;

    assert_eq!(result.code, ResultCode::Ok);
    let saved = store.records().await;
    assert_eq!(saved[0].username.as_deref(), Some("alice"));
    assert_eq!(saved[0].secret, None);
}

#[tokio::test]
async fn errors_end_the_operation_without_prompting() {
    let (coord, _store) = coordinator(FlightPolicy::Queue);
    let prompter = ScriptedPrompter::cancelling();

    let result = coord
        .run(
            |_, _| RemoteOperationResult::error("could not resolve host"),
            start(),
            &prompter,
        )
        .await;

    assert_eq!(result.code, ResultCode::Error);
    assert_eq!(result.message, "could not resolve host");
    assert_eq!(prompter.prompts(), 0);
}

#[tokio::test]
async fn saved_credentials_seed_the_first_attempt() {
    let store = Arc::new(MemoryCredentialStore::new());
    let mut remembered = start();
    remembered.username = Some("bob".to_string());
    remembered.secret = Some("pw".to_string());
    remembered.remember = true;
    store
        .save(CredentialRecord::from_credentials(&remembered))
        .await
        .unwrap();

    let coord = RemoteOperationCoordinator::new(store, FlightPolicy::Queue);
    let creds = coord
        .initial_credentials(URL, Path::new("/work/repo"))
        .await;
    assert_eq!(creds.username.as_deref(), Some("bob"));
    assert!(creds.has_secret());

    let fresh = coord
        .initial_credentials("https://example.com/other.git", Path::new("/work/repo"))
        .await;
    assert_eq!(fresh.username, None);
}

#[tokio::test]
async fn progress_reaches_subscribers() {
    let (coord, _store) = coordinator(FlightPolicy::Queue);
    let rx = coord.progress();
    let prompter = ScriptedPrompter::cancelling();

    let result = coord
        .run(
            |_, monitor: &dyn ProgressMonitor| {
                monitor.begin_task("Receiving objects", 10);
                monitor.update(5);
                monitor.end_task();
                RemoteOperationResult::ok("Nothing changed")
            },
            start(),
            &prompter,
        )
        .await;

    assert_eq!(result.code, ResultCode::Ok);
    let latest = rx.borrow().clone();
    assert_eq!(latest.label, "Receiving objects");
    assert_eq!(latest.fraction, 1.0);
}

#[tokio::test]
async fn channel_prompter_relays_answers() {
    let (coord, store) = coordinator(FlightPolicy::Queue);
    let (prompter, mut pending) = ChannelPrompter::new();
    let front_end = tokio::spawn(async move {
        let prompt = pending.recv().await.unwrap();
        assert_eq!(prompt.request.code, ResultCode::AuthRequired);
        let mut answer = RemoteCredentials::default();
        answer.username = Some("carol".to_string());
        prompt.respond(CredentialResponse::Provided(answer));
    });

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let result = coord
        .run(
            move |creds, _| {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    RemoteOperationResult::new(ResultCode::AuthRequired, "auth")
                } else {
                    RemoteOperationResult::ok(creds.username.clone().unwrap_or_default())
                }
            },
            start(),
            &prompter,
        )
        .await;

    front_end.await.unwrap();
    assert_eq!(result.code, ResultCode::Ok);
    assert_eq!(result.message, "carol");
    assert_eq!(store.save_count(), 1);
}

/// Blocks the operation running on the blocking pool until released.
#[derive(Clone, Default)]
struct Gate {
    started: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
}

impl Gate {
    fn wait(&self) {
        self.started.store(true, Ordering::SeqCst);
        while !self.released.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    async fn until_started(&self) {
        while !self.started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reject_policy_turns_away_a_second_operation() {
    let (coord, _store) = coordinator(FlightPolicy::Reject);
    let coord = Arc::new(coord);
    let gate = Gate::default();

    let first = {
        let coord = coord.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            let prompter = ScriptedPrompter::cancelling();
            coord
                .run(
                    move |_, _| {
                        gate.wait();
                        RemoteOperationResult::ok("first")
                    },
                    start(),
                    &prompter,
                )
                .await
        })
    };
    gate.until_started().await;

    let prompter = ScriptedPrompter::cancelling();
    let second = coord
        .run(|_, _| RemoteOperationResult::ok("second"), start(), &prompter)
        .await;
    assert_eq!(second.code, ResultCode::Error);
    assert_eq!(second.message, BUSY_MESSAGE);

    gate.release();
    assert_eq!(first.await.unwrap().message, "first");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_policy_runs_operations_one_after_another() {
    let (coord, _store) = coordinator(FlightPolicy::Queue);
    let coord = Arc::new(coord);
    let gate = Gate::default();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let coord = coord.clone();
        let gate = gate.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let prompter = ScriptedPrompter::cancelling();
            coord
                .run(
                    move |_, _| {
                        order.lock().unwrap().push("first:start");
                        gate.wait();
                        order.lock().unwrap().push("first:end");
                        RemoteOperationResult::ok("first")
                    },
                    start(),
                    &prompter,
                )
                .await
        })
    };
    gate.until_started().await;

    let second = {
        let coord = coord.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let prompter = ScriptedPrompter::cancelling();
            coord
                .run(
                    move |_, _| {
                        order.lock().unwrap().push("second");
                        RemoteOperationResult::ok("second")
                    },
                    start(),
                    &prompter,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*order.lock().unwrap(), vec!["first:start"]);

    gate.release();
    assert_eq!(first.await.unwrap().code, ResultCode::Ok);
    assert_eq!(second.await.unwrap().code, ResultCode::Ok);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["first:start", "first:end", "second"]
    );
}
