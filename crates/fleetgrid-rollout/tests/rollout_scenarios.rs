//! End-to-end rollout scenarios.
//!
//! Drives the orchestrator and the event processor together against an
//! in-memory store, with hand-written collaborators standing in for the
//! repo builder, script publisher, dispatcher, and event bus.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetgrid_rollout::*;
use fleetgrid_state::*;
use tokio_util::sync::CancellationToken;

const GRACE: Duration = Duration::from_millis(30);

// ── Fakes ─────────────────────────────────────────────────────────

struct FakeBuilder {
    fail: bool,
}

#[async_trait]
impl RepoBuilder for FakeBuilder {
    async fn build(&self, rollout_id: RolloutId) -> anyhow::Result<String> {
        if self.fail {
            anyhow::bail!("image builder exited with status 1");
        }
        Ok(format!("https://repo.example/{rollout_id}"))
    }
}

#[derive(Default)]
struct FakePublisher {
    scripts: Mutex<HashMap<RolloutId, String>>,
}

#[async_trait]
impl ScriptPublisher for FakePublisher {
    async fn publish(&self, remote: &RemoteInfo, account: &str) -> anyhow::Result<String> {
        let body = format!("remote: {} {}", remote.remote_name, remote.remote_url);
        self.scripts.lock().unwrap().insert(remote.rollout_id, body);
        Ok(format!(
            "https://fleet.example/{account}/{}/update.yml",
            remote.rollout_id
        ))
    }

    async fn fetch(&self, _account: &str, rollout_id: RolloutId) -> anyhow::Result<Vec<u8>> {
        self.scripts
            .lock()
            .unwrap()
            .get(&rollout_id)
            .map(|s| s.clone().into_bytes())
            .ok_or_else(|| anyhow::anyhow!("no script for rollout {rollout_id}"))
    }
}

/// How the fake dispatcher answers a given recipient.
#[derive(Clone, Copy)]
enum Answer {
    Accept,
    Refuse,
    Unreachable,
}

#[derive(Default)]
struct FakeDispatcher {
    answers: HashMap<String, Answer>,
    requests: Mutex<Vec<DispatchRequest>>,
}

impl FakeDispatcher {
    fn answering(answers: &[(&str, Answer)]) -> Self {
        Self {
            answers: answers
                .iter()
                .map(|(recipient, answer)| (recipient.to_string(), *answer))
                .collect(),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn execute(&self, request: &DispatchRequest) -> anyhow::Result<Vec<DispatchResponse>> {
        self.requests.lock().unwrap().push(request.clone());
        match self.answers.get(&request.recipient).copied().unwrap_or(Answer::Accept) {
            Answer::Accept => Ok(vec![DispatchResponse {
                status_code: 201,
                correlation_id: Some(format!("run-{}", request.recipient)),
            }]),
            Answer::Refuse => Ok(vec![DispatchResponse {
                status_code: 400,
                correlation_id: None,
            }]),
            Answer::Unreachable => anyhow::bail!("connection refused"),
        }
    }
}

#[derive(Default)]
struct RecordingBus {
    published: Mutex<Vec<RolloutNotification>>,
}

#[async_trait]
impl EventBus for RecordingBus {
    async fn publish(&self, notification: &RolloutNotification) -> anyhow::Result<()> {
        self.published.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────────

struct Harness {
    store: StateStore,
    orchestrator: UpdateOrchestrator,
    processor: Arc<DispatchEventProcessor>,
    dispatcher: Arc<FakeDispatcher>,
    bus: Arc<RecordingBus>,
    shutdown: CancellationToken,
}

fn harness(builder_fails: bool, dispatcher: FakeDispatcher) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    for (id, account) in [(1, "acct"), (2, "acct"), (3, "acct"), (4, "other")] {
        store
            .put_device(&Device {
                id,
                account: account.to_string(),
                uuid: format!("uuid-{id}"),
                remote_client_id: format!("rhc-{id}"),
                image_id: None,
                update_available: false,
                connected: false,
                current_hash: "old".to_string(),
                available_hash: "new".to_string(),
                updated_at: 0,
            })
            .unwrap();
    }
    for (id, set, created_at) in [(1, 100, 10), (2, 100, 20), (3, 200, 30)] {
        store
            .put_image(&Image {
                id,
                account: "acct".to_string(),
                name: format!("edge-{id}"),
                image_set_id: set,
                commit: Commit {
                    id,
                    os_tree_commit: format!("commit-{id}"),
                },
                status: ImageStatus::Success,
                created_at,
            })
            .unwrap();
    }

    let dispatcher = Arc::new(dispatcher);
    let bus = Arc::new(RecordingBus::default());
    let notifier = Notifier::new(bus.clone(), NotificationSettings::default());
    let shutdown = CancellationToken::new();
    let supervisor = Arc::new(RolloutSupervisor::new(store.clone(), shutdown.clone()));
    let orchestrator = UpdateOrchestrator::new(
        store.clone(),
        Collaborators {
            builder: Arc::new(FakeBuilder {
                fail: builder_fails,
            }),
            publisher: Arc::new(FakePublisher::default()),
            dispatcher: dispatcher.clone(),
        },
        notifier.clone(),
        supervisor.clone(),
        "rhel-edge",
    );
    let processor = Arc::new(DispatchEventProcessor::new(
        store.clone(),
        notifier,
        supervisor,
        GRACE,
    ));

    Harness {
        store,
        orchestrator,
        processor,
        dispatcher,
        bus,
        shutdown,
    }
}

fn completion(correlation_id: &str, status: &str) -> Vec<u8> {
    serde_json::json!({
        "event_type": "update",
        "payload": {
            "id": correlation_id,
            "account": "acct",
            "status": status,
            "created_at": "2026-05-01T12:00:00Z",
        }
    })
    .to_string()
    .into_bytes()
}

fn plan(h: &Harness, image_id: ImageId, device_ids: Vec<DeviceId>) -> Rollout {
    h.orchestrator
        .plan_update(UpdateRequest {
            account: "acct".to_string(),
            image_id,
            device_ids,
        })
        .unwrap()
}

// ── Scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn one_failed_device_fails_the_rollout() {
    let h = harness(false, FakeDispatcher::default());
    let planned = plan(&h, 1, vec![1, 2, 3]);

    let rollout = h.orchestrator.create_update(planned.id).await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::Building);
    let records = h.store.list_dispatch_records(rollout.id).unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == DispatchStatus::Created));

    h.processor
        .process_completion_event(&completion("run-rhc-1", "success"))
        .await
        .unwrap();
    h.processor
        .process_completion_event(&completion("run-rhc-2", "success"))
        .await
        .unwrap();
    let last = h
        .processor
        .process_completion_event(&completion("run-rhc-3", "failure"))
        .await
        .unwrap();
    assert_eq!(last.rollout_status, Some(RolloutStatus::Error));

    let rollout = h.store.get_rollout(rollout.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Error);
    let statuses: Vec<_> = h
        .store
        .list_dispatch_records(rollout.id)
        .unwrap()
        .into_iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            DispatchStatus::Complete,
            DispatchStatus::Complete,
            DispatchStatus::Error
        ]
    );
    // No fleet sync for a failed rollout.
    assert_eq!(h.store.get_device(1).unwrap().unwrap().image_id, None);
}

#[tokio::test]
async fn all_devices_succeeding_syncs_the_fleet() {
    let h = harness(false, FakeDispatcher::default());
    let planned = plan(&h, 1, vec![1, 2]);
    let rollout = h.orchestrator.create_update(planned.id).await.unwrap();

    // Both completions wait out their grace windows concurrently.
    let ev1 = completion("run-rhc-1", "success");
    let ev2 = completion("run-rhc-2", "success");
    let (a, b) = tokio::join!(
        h.processor.process_completion_event(&ev1),
        h.processor.process_completion_event(&ev2),
    );
    a.unwrap();
    b.unwrap();

    let rollout = h.store.get_rollout(rollout.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Success);
    for id in [1, 2] {
        let device = h.store.get_device(id).unwrap().unwrap();
        assert_eq!(device.image_id, Some(1));
        // Image 2 is a newer successful build of the same set.
        assert!(device.update_available);
        assert_eq!(device.current_hash, "new");
        assert!(device.connected);
    }
    let untouched = h.store.get_device(3).unwrap().unwrap();
    assert_eq!(untouched.image_id, None);
    let foreign = h.store.get_device(4).unwrap().unwrap();
    assert_eq!(foreign.image_id, None);

    let published = h.bus.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);
    assert_eq!(
        published[0].events[0].payload,
        format!(r#"{{"UpdateID":"{}"}}"#, rollout.id)
    );
}

#[tokio::test]
async fn shutdown_while_building_leaves_rollout_failed() {
    let h = harness(false, FakeDispatcher::default());
    let planned = plan(&h, 2, vec![1, 2]);
    let rollout = h.orchestrator.create_update(planned.id).await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::Building);

    // Fan-out has returned; the rollout is still watched until it settles.
    let supervisor = h.orchestrator.supervisor().clone();
    h.shutdown.cancel();
    assert!(supervisor.wait_watchers(Duration::from_secs(1)).await);

    let rollout = h.store.get_rollout(rollout.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Error);
    assert_eq!(rollout.failure.as_deref(), Some(INTERRUPTED_REASON));
    assert!(h.orchestrator.recover_interrupted_rollouts().unwrap().is_empty());

    // A late success cannot revive it.
    h.processor
        .process_completion_event(&completion("run-rhc-1", "success"))
        .await
        .unwrap();
    let rollout = h.store.get_rollout(rollout.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Error);
}

#[tokio::test]
async fn unclean_exit_is_recovered_at_startup() {
    let h = harness(false, FakeDispatcher::default());
    let planned = plan(&h, 2, vec![1]);
    let rollout = h.orchestrator.create_update(planned.id).await.unwrap();

    // No shutdown signal: the next process's sweep finds it Building.
    let recovered = h.orchestrator.recover_interrupted_rollouts().unwrap();
    assert_eq!(recovered, vec![rollout.id]);
    let rollout = h.store.get_rollout(rollout.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Error);
    assert!(rollout.failure.is_some());
}

#[tokio::test]
async fn shutdown_signal_fails_tracked_rollout() {
    let h = harness(false, FakeDispatcher::default());
    let planned = plan(&h, 2, vec![1, 2]);
    h.store
        .modify_rollout(planned.id, |r| {
            r.status = RolloutStatus::Building;
            true
        })
        .unwrap();

    let supervisor = h.orchestrator.supervisor().clone();
    let guard = supervisor.track(planned.id);
    h.shutdown.cancel();
    assert!(supervisor.wait_watchers(Duration::from_secs(1)).await);

    let rollout = h.store.get_rollout(planned.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Error);
    drop(guard);
    assert!(supervisor.wait_drained(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn unknown_correlation_id_is_dropped() {
    let h = harness(false, FakeDispatcher::default());
    let planned = plan(&h, 1, vec![1]);
    let rollout = h.orchestrator.create_update(planned.id).await.unwrap();
    let before = h.store.get_rollout(rollout.id).unwrap().unwrap();

    let err = h
        .processor
        .process_completion_event(&completion("run-somewhere-else", "failure"))
        .await
        .unwrap_err();
    assert!(matches!(err, RolloutError::NotFound(_)));
    assert_eq!(h.store.get_rollout(rollout.id).unwrap().unwrap(), before);
}

#[tokio::test]
async fn failure_during_grace_window_dominates() {
    let h = harness(false, FakeDispatcher::default());
    let planned = plan(&h, 1, vec![1]);
    let rollout = h.orchestrator.create_update(planned.id).await.unwrap();

    let processor = h.processor.clone();
    let late_success = tokio::spawn(async move {
        processor
            .process_completion_event(&completion("run-rhc-1", "success"))
            .await
    });
    tokio::time::sleep(GRACE / 3).await;
    h.processor
        .process_completion_event(&completion("run-rhc-1", "timeout"))
        .await
        .unwrap();
    let outcome = late_success.await.unwrap().unwrap();
    assert!(!outcome.applied);

    let rollout = h.store.get_rollout(rollout.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Error);
    assert_eq!(h.store.get_device(1).unwrap().unwrap().current_hash, "old");
}

#[tokio::test]
async fn build_failure_contacts_no_device() {
    let h = harness(true, FakeDispatcher::default());
    let planned = plan(&h, 1, vec![1, 2]);

    let err = h.orchestrator.create_update(planned.id).await.unwrap_err();
    assert!(matches!(
        err,
        RolloutError::Collaborator {
            kind: Collaborator::RepoBuilder,
            ..
        }
    ));
    assert!(h.dispatcher.requests().is_empty());
    let rollout = h.store.get_rollout(planned.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Error);
    assert_eq!(h.bus.published.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn transport_failure_keeps_earlier_dispatches() {
    let h = harness(
        false,
        FakeDispatcher::answering(&[("rhc-2", Answer::Unreachable)]),
    );
    let planned = plan(&h, 1, vec![1, 2, 3]);

    let err = h.orchestrator.create_update(planned.id).await.unwrap_err();
    assert!(matches!(
        err,
        RolloutError::Collaborator {
            kind: Collaborator::Dispatcher,
            ..
        }
    ));
    // Device 3 was never contacted.
    let recipients: Vec<_> = h
        .dispatcher
        .requests()
        .into_iter()
        .map(|r| r.recipient)
        .collect();
    assert_eq!(recipients, vec!["rhc-1", "rhc-2"]);

    let records = h.store.list_dispatch_records(planned.id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].device_id, 1);
    assert_eq!(records[0].status, DispatchStatus::Created);
    let rollout = h.store.get_rollout(planned.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Error);

    // The device that was dispatched still reports, but the rollout stays failed.
    h.processor
        .process_completion_event(&completion("run-rhc-1", "success"))
        .await
        .unwrap();
    let rollout = h.store.get_rollout(planned.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Error);
}

#[tokio::test]
async fn refused_dispatch_marks_device_disconnected() {
    let h = harness(
        false,
        FakeDispatcher::answering(&[("rhc-2", Answer::Refuse)]),
    );
    let planned = plan(&h, 1, vec![1, 2, 3]);

    let rollout = h.orchestrator.create_update(planned.id).await.unwrap();
    assert_eq!(rollout.status, RolloutStatus::Error);
    let records = h.store.list_dispatch_records(rollout.id).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].status, DispatchStatus::Error);
    assert_eq!(records[1].correlation_id, None);
    // Sibling devices were still dispatched.
    assert_eq!(records[2].status, DispatchStatus::Created);
    assert!(!h.store.get_device(2).unwrap().unwrap().connected);
    assert!(h.store.get_device(3).unwrap().unwrap().connected);
}

#[tokio::test]
async fn running_events_keep_rollout_building() {
    let h = harness(false, FakeDispatcher::default());
    let planned = plan(&h, 1, vec![1, 2]);
    let rollout = h.orchestrator.create_update(planned.id).await.unwrap();

    let outcome = h
        .processor
        .process_completion_event(&completion("run-rhc-1", "running"))
        .await
        .unwrap();
    assert_eq!(outcome.record.status, DispatchStatus::Running);
    h.processor
        .process_completion_event(&completion("run-rhc-2", "success"))
        .await
        .unwrap();

    let rollout = h.store.get_rollout(rollout.id).unwrap().unwrap();
    assert_eq!(rollout.status, RolloutStatus::Building);
}

#[tokio::test]
async fn selection_must_share_one_image_set() {
    let h = harness(false, FakeDispatcher::default());
    assert!(h.orchestrator.validate_update_selection("acct", &[1, 2]).unwrap());
    assert!(!h.orchestrator.validate_update_selection("acct", &[1, 3]).unwrap());
}

#[tokio::test]
async fn published_script_is_served_back() {
    let h = harness(false, FakeDispatcher::default());
    let planned = plan(&h, 1, vec![1]);
    h.orchestrator.create_update(planned.id).await.unwrap();

    let script = h.orchestrator.update_script(planned.id).await.unwrap();
    let text = String::from_utf8(script).unwrap();
    assert!(text.contains("rhel-edge"));
    assert!(text.contains(&format!("https://repo.example/{}", planned.id)));

    let records = h.store.list_dispatch_records(planned.id).unwrap();
    assert_eq!(
        records[0].script_url,
        format!("https://fleet.example/acct/{}/update.yml", planned.id)
    );
}
