//! End-to-end scheduler scenarios against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use dagflow_types::config::EngineConfig;
use dagflow_types::error::RepositoryError;
use dagflow_types::workflow::{
    ContextMap, FailurePolicy, InstanceStatus, StepStatus, WorkflowInstance,
};
use serde_json::{Value, json};
use tokio::sync::Barrier;
use uuid::Uuid;

use crate::repository::instance::InstanceStore;
use crate::repository::memory::InMemoryInstanceStore;

use super::action::{ActionError, BoxStepAction, StepOutput, action_fn};
use super::definition::StepDefinition;
use super::executor::{ExecutorError, Scheduler};
use super::registry::StepRegistry;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const TEMPLATE: &str = "test-flow";

fn scheduler_with<S: InstanceStore>(
    store: S,
    config: EngineConfig,
    steps: Vec<StepDefinition>,
) -> Scheduler<S> {
    let registry = Arc::new(StepRegistry::new());
    registry.define(TEMPLATE, steps).unwrap();
    Scheduler::with_config(registry, store, config)
}

fn scheduler(steps: Vec<StepDefinition>) -> Scheduler<InMemoryInstanceStore> {
    scheduler_with(InMemoryInstanceStore::new(), EngineConfig::default(), steps)
}

fn output(key: &str, value: Value) -> StepOutput {
    let mut out = StepOutput::new();
    out.insert(key.to_string(), value);
    out
}

/// Action that writes `key = value` into the context.
fn emit(key: &'static str, value: Value) -> BoxStepAction {
    action_fn(move |_| {
        let value = value.clone();
        async move { Ok(output(key, value)) }
    })
}

/// Action that always fails and counts its invocations.
fn always_fail(calls: Arc<AtomicU32>) -> BoxStepAction {
    action_fn(move |_| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ActionError::failed("downstream unavailable"))
        }
    })
}

fn ctx(pairs: &[(&str, Value)]) -> ContextMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Store whose writes can be switched off to simulate an outage.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryInstanceStore,
    fail_saves: AtomicBool,
    /// 1-based number of a single save to reject (0 = none).
    fail_nth_save: AtomicU32,
    saves: AtomicU32,
}

impl InstanceStore for FlakyStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<Uuid, RepositoryError> {
        self.inner.create(instance).await
    }

    async fn load(&self, id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        self.inner.load(id).await
    }

    async fn save(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let nth = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_saves.load(Ordering::SeqCst)
            || nth == self.fail_nth_save.load(Ordering::SeqCst)
        {
            return Err(RepositoryError::Connection);
        }
        self.inner.save(instance).await
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.inner.list_by_status(status).await
    }
}

// ---------------------------------------------------------------------------
// Ordering and completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_diamond_completes_in_dependency_order() {
    let sum = action_fn(|input| async move {
        let b: i64 = input.get_as("b")?;
        let c: i64 = input.get_as("c")?;
        Ok::<_, ActionError>(output("d", json!(b + c)))
    });
    let scheduler = scheduler(vec![
        StepDefinition::automated("a", emit("a", json!(1))),
        StepDefinition::automated("b", emit("b", json!(2))).depends_on(["a"]),
        StepDefinition::automated("c", emit("c", json!(3))).depends_on(["a"]),
        StepDefinition::automated("d", sum).depends_on(["b", "c"]),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.context["d"], json!(5));

    let completed = |name: &str| instance.step(name).unwrap().completed_at.unwrap();
    let started = |name: &str| instance.step(name).unwrap().started_at.unwrap();
    assert!(completed("a") <= started("b"));
    assert!(completed("a") <= started("c"));
    assert!(completed("b") <= started("d"));
    assert!(completed("c") <= started("d"));
    assert!(instance.steps.values().all(|s| s.attempts == 1 && s.last_error.is_none()));
}

#[tokio::test]
async fn test_independent_steps_run_concurrently() {
    // Each step blocks until both are running; sequential dispatch would time out
    let barrier = Arc::new(Barrier::new(2));
    let meet = |key: &'static str| {
        let barrier = Arc::clone(&barrier);
        action_fn(move |_| {
            let barrier = Arc::clone(&barrier);
            async move {
                barrier.wait().await;
                Ok(output(key, json!(true)))
            }
        })
    };
    let scheduler = scheduler(vec![
        StepDefinition::automated("left", meet("left"))
            .timeout(Duration::from_secs(5))
            .on_failure(FailurePolicy::Abort),
        StepDefinition::automated("right", meet("right"))
            .timeout(Duration::from_secs(5))
            .on_failure(FailurePolicy::Abort),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_initial_context_reaches_actions() {
    let scheduler = scheduler(vec![StepDefinition::automated(
        "greet",
        action_fn(|input| async move {
            let name: String = input.get_as("name")?;
            Ok::<_, ActionError>(output("greeting", json!(format!("hello {name}"))))
        }),
    )]);

    let id = scheduler
        .start(TEMPLATE, ctx(&[("name", json!("ada"))]))
        .await
        .unwrap();
    let instance = scheduler.instance(id).await.unwrap();
    assert_eq!(instance.context["greeting"], json!("hello ada"));
}

// ---------------------------------------------------------------------------
// Human tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_human_task_pauses_until_resumed() {
    let scheduler = scheduler(vec![StepDefinition::human_task("a")]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let paused = scheduler.instance(id).await.unwrap();
    assert_eq!(paused.status, InstanceStatus::Paused);
    assert_eq!(paused.step_status("a"), Some(StepStatus::WaitingOnHuman));

    let done = scheduler.resume(id, "a", StepOutput::new()).await.unwrap();
    assert_eq!(done.step_status("a"), Some(StepStatus::Completed));
    assert_eq!(done.status, InstanceStatus::Completed);
    assert_eq!(scheduler.instance(id).await.unwrap(), done);
}

#[tokio::test]
async fn test_parallel_branch_runs_while_paused() {
    let scheduler = scheduler(vec![
        StepDefinition::human_task("approve"),
        StepDefinition::automated("prepare", emit("prepared", json!(true))),
        StepDefinition::automated("ship", emit("shipped", json!(true)))
            .depends_on(["approve", "prepare"]),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Paused);
    assert_eq!(instance.step_status("prepare"), Some(StepStatus::Completed));
    assert_eq!(instance.step_status("ship"), Some(StepStatus::Pending));

    let instance = scheduler
        .resume(id, "approve", output("approved_by", json!("lee")))
        .await
        .unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.context["approved_by"], json!("lee"));
    assert_eq!(instance.context["shipped"], json!(true));
}

#[tokio::test]
async fn test_resume_step_not_waiting_leaves_state_unchanged() {
    let scheduler = scheduler(vec![
        StepDefinition::automated("a", emit("a", json!(1))),
        StepDefinition::human_task("b").depends_on(["a"]),
    ]);
    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let before = scheduler.instance(id).await.unwrap();

    let err = scheduler
        .resume(id, "a", output("x", json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::StepNotWaiting {
            status: StepStatus::Completed,
            ..
        }
    ));
    assert_eq!(scheduler.instance(id).await.unwrap(), before);
}

#[tokio::test]
async fn test_resume_unknown_step() {
    let scheduler = scheduler(vec![StepDefinition::human_task("a")]);
    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();

    let err = scheduler
        .resume(id, "nope", StepOutput::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::UnknownStep { ref step, .. } if step == "nope"));
}

#[tokio::test]
async fn test_resume_with_colliding_output_is_rejected() {
    let scheduler = scheduler(vec![StepDefinition::human_task("a")]);
    let id = scheduler
        .start(TEMPLATE, ctx(&[("order_id", json!(7))]))
        .await
        .unwrap();
    let before = scheduler.instance(id).await.unwrap();

    let err = scheduler
        .resume(id, "a", output("order_id", json!(8)))
        .await
        .unwrap_err();
    match err {
        ExecutorError::ContextKeyCollision { step, keys } => {
            assert_eq!(step, "a");
            assert_eq!(keys, vec!["order_id"]);
        }
        other => panic!("expected ContextKeyCollision, got {other:?}"),
    }
    assert_eq!(scheduler.instance(id).await.unwrap(), before);
}

#[tokio::test]
async fn test_resume_on_aborted_instance_is_rejected() {
    let calls = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(vec![
        StepDefinition::human_task("approve"),
        StepDefinition::automated("charge", always_fail(Arc::clone(&calls)))
            .on_failure(FailurePolicy::Abort),
    ]);
    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.step_status("approve"), Some(StepStatus::WaitingOnHuman));

    let err = scheduler
        .resume(id, "approve", StepOutput::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecutorError::InstanceTerminal {
            status: InstanceStatus::Failed,
            ..
        }
    ));
}

// ---------------------------------------------------------------------------
// Failure policies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_retry_exhaustion_fails_instance() {
    let calls = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(vec![
        StepDefinition::automated("a", always_fail(Arc::clone(&calls)))
            .on_failure(FailurePolicy::Retry)
            .max_retries(2),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    let state = instance.step("a").unwrap();
    assert_eq!(state.attempts, 3);
    assert_eq!(state.status, StepStatus::Failed);
    assert_eq!(state.last_error.as_deref(), Some("downstream unavailable"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(
        instance.error.as_deref(),
        Some("step 'a' failed: downstream unavailable")
    );
}

#[tokio::test]
async fn test_retry_succeeds_on_later_attempt() {
    let flaky = action_fn(|input| async move {
        if input.attempt < 3 {
            return Err(ActionError::failed(format!("attempt {} failed", input.attempt)));
        }
        Ok(output("charged", json!(true)))
    });
    let scheduler = scheduler(vec![StepDefinition::automated("charge", flaky).max_retries(2)]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    let state = instance.step("charge").unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(state.attempts, 3);
    assert!(state.last_error.is_none(), "success clears the last error");
}

#[tokio::test]
async fn test_skip_policy_completes_failed_step() {
    let calls = Arc::new(AtomicU32::new(0));
    let scheduler = scheduler(vec![
        StepDefinition::automated("notify", always_fail(Arc::clone(&calls)))
            .on_failure(FailurePolicy::Skip)
            .max_retries(5),
        StepDefinition::automated("archive", emit("archived", json!(true))).depends_on(["notify"]),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    let state = instance.step("notify").unwrap();
    assert_eq!(state.status, StepStatus::Completed);
    assert_eq!(state.last_error.as_deref(), Some("downstream unavailable"));
    assert!(state.completed_at.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1, "skip never retries");
    assert_eq!(instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_abort_leaves_pending_steps_and_lets_siblings_finish() {
    let calls = Arc::new(AtomicU32::new(0));
    let slow = action_fn(|_| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(output("slow", json!(true)))
    });
    let scheduler = scheduler(vec![
        StepDefinition::automated("fail", always_fail(Arc::clone(&calls)))
            .on_failure(FailurePolicy::Abort)
            .max_retries(3),
        StepDefinition::automated("slow", slow),
        StepDefinition::automated("after", emit("after", json!(true))).depends_on(["slow"]),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.step_status("fail"), Some(StepStatus::Failed));
    assert_eq!(instance.step_status("slow"), Some(StepStatus::Completed));
    assert_eq!(instance.step_status("after"), Some(StepStatus::Pending));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "abort never retries");
}

#[tokio::test]
async fn test_context_collision_fails_step_and_keeps_value() {
    let scheduler = scheduler(vec![
        StepDefinition::automated("overwrite", emit("order_id", json!(99))).max_retries(3),
    ]);

    let id = scheduler
        .start(TEMPLATE, ctx(&[("order_id", json!(7))]))
        .await
        .unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    let state = instance.step("overwrite").unwrap();
    assert_eq!(state.status, StepStatus::Failed);
    assert_eq!(state.attempts, 1, "collisions are not retried");
    assert!(state.last_error.as_deref().unwrap().contains("collision"));
    assert_eq!(instance.context["order_id"], json!(7));
    assert_eq!(instance.status, InstanceStatus::Failed);
}

#[tokio::test]
async fn test_context_collision_with_skip_completes() {
    let scheduler = scheduler(vec![
        StepDefinition::automated("overwrite", emit("order_id", json!(99)))
            .on_failure(FailurePolicy::Skip),
    ]);

    let id = scheduler
        .start(TEMPLATE, ctx(&[("order_id", json!(7))]))
        .await
        .unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.step_status("overwrite"), Some(StepStatus::Completed));
    assert_eq!(instance.context["order_id"], json!(7));
}

#[tokio::test]
async fn test_sibling_key_collision_resolved_in_declaration_order() {
    let scheduler = scheduler(vec![
        StepDefinition::automated("first", emit("k", json!("first"))),
        StepDefinition::automated("second", emit("k", json!("second"))),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    assert_eq!(instance.context["k"], json!("first"));
    assert_eq!(instance.step_status("first"), Some(StepStatus::Completed));
    let second = instance.step("second").unwrap();
    assert_eq!(second.status, StepStatus::Failed);
    assert_eq!(second.attempts, 1);
    assert_eq!(
        second.last_error.as_deref(),
        Some("context key collision: [k]")
    );
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(
        instance.error.as_deref(),
        Some("step 'second' failed: context key collision: [k]")
    );
}

#[tokio::test]
async fn test_oversized_output_is_step_failure() {
    let config = EngineConfig {
        max_step_output_bytes: 32,
        ..EngineConfig::default()
    };
    let scheduler = scheduler_with(
        InMemoryInstanceStore::new(),
        config,
        vec![
            StepDefinition::automated("blob", emit("blob", json!("x".repeat(100))))
                .max_retries(2),
        ],
    );

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    let state = instance.step("blob").unwrap();
    assert_eq!(state.status, StepStatus::Failed);
    assert_eq!(state.attempts, 1);
    assert!(!instance.context.contains_key("blob"));
}

#[tokio::test]
async fn test_timeout_is_step_failure() {
    let saw_deadline = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saw_deadline);
    let hang = action_fn(move |input| {
        let flag = Arc::clone(&flag);
        async move {
            flag.store(input.deadline.is_some(), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StepOutput::new())
        }
    });
    let scheduler = scheduler(vec![
        StepDefinition::automated("hang", hang)
            .timeout(Duration::from_millis(50))
            .on_failure(FailurePolicy::Abort),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    let state = instance.step("hang").unwrap();
    assert_eq!(state.status, StepStatus::Failed);
    assert_eq!(state.last_error.as_deref(), Some("step timeout"));
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(saw_deadline.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_timeout_fires_token_while_action_is_still_polled() {
    let observed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&observed);
    let watcher = action_fn(move |input| {
        let flag = Arc::clone(&flag);
        async move {
            input.cancellation.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Err(ActionError::DeadlineExceeded)
        }
    });
    let scheduler = scheduler(vec![
        StepDefinition::automated("watch", watcher)
            .timeout(Duration::from_millis(20))
            .on_failure(FailurePolicy::Skip),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    assert!(observed.load(Ordering::SeqCst), "action saw its token cancelled");
    assert_eq!(
        instance.step("watch").unwrap().last_error.as_deref(),
        Some("step timeout")
    );
    assert_eq!(scheduler.live_attempts(), 0);
}

#[tokio::test]
async fn test_default_step_timeout_applies_to_steps_without_one() {
    let config = EngineConfig {
        default_step_timeout_secs: Some(1),
        ..EngineConfig::default()
    };
    let saw_deadline = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saw_deadline);
    let hang = action_fn(move |input| {
        let flag = Arc::clone(&flag);
        async move {
            flag.store(input.deadline.is_some(), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StepOutput::new())
        }
    });
    let scheduler = scheduler_with(
        InMemoryInstanceStore::new(),
        config,
        vec![StepDefinition::automated("hang", hang).on_failure(FailurePolicy::Abort)],
    );

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(
        instance.step("hang").unwrap().last_error.as_deref(),
        Some("step timeout")
    );
    assert!(saw_deadline.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_action_deadline_exceeded_counts_as_timeout() {
    let scheduler = scheduler(vec![
        StepDefinition::automated(
            "poll",
            action_fn(|_| async { Err(ActionError::DeadlineExceeded) }),
        )
        .on_failure(FailurePolicy::Skip),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();
    assert_eq!(
        instance.step("poll").unwrap().last_error.as_deref(),
        Some("step timeout")
    );
}

#[tokio::test]
async fn test_panicking_action_is_step_failure() {
    let scheduler = scheduler(vec![
        StepDefinition::automated(
            "explode",
            action_fn(|_| async {
                if true {
                    panic!("boom");
                }
                Ok(StepOutput::new())
            }),
        )
        .on_failure(FailurePolicy::Abort),
    ]);

    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let instance = scheduler.instance(id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(
        instance.step("explode").unwrap().last_error.as_deref(),
        Some("action panicked: boom")
    );
}

// ---------------------------------------------------------------------------
// Idempotence, errors, and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_advance_is_idempotent() {
    let scheduler = scheduler(vec![
        StepDefinition::automated("a", emit("a", json!(1))),
        StepDefinition::human_task("b").depends_on(["a"]),
    ]);
    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();

    let first = scheduler.advance(id).await.unwrap();
    let persisted = scheduler.instance(id).await.unwrap();
    let second = scheduler.advance(id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(scheduler.instance(id).await.unwrap(), persisted);
}

#[tokio::test]
async fn test_advance_on_completed_instance_is_noop() {
    let scheduler = scheduler(vec![StepDefinition::automated("a", emit("a", json!(1)))]);
    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();
    let done = scheduler.instance(id).await.unwrap();

    assert_eq!(scheduler.advance(id).await.unwrap(), done);
    assert_eq!(scheduler.instance(id).await.unwrap().updated_at, done.updated_at);
}

#[tokio::test]
async fn test_unknown_instance_and_template() {
    let scheduler = scheduler(vec![StepDefinition::human_task("a")]);
    let missing = Uuid::now_v7();

    let err = scheduler.advance(missing).await.unwrap_err();
    assert!(matches!(err, ExecutorError::InstanceNotFound(id) if id == missing));

    let err = scheduler
        .resume(missing, "a", StepOutput::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::InstanceNotFound(_)));

    let err = scheduler
        .start("no-such-template", ContextMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::TemplateNotFound(ref name) if name == "no-such-template"));
}

#[tokio::test]
async fn test_store_outage_propagates_and_advance_recovers() {
    let scheduler = scheduler_with(
        FlakyStore::default(),
        EngineConfig::default(),
        vec![StepDefinition::automated("a", emit("a", json!(1)))],
    );
    scheduler.store().fail_saves.store(true, Ordering::SeqCst);

    let err = scheduler
        .start(TEMPLATE, ContextMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Checkpoint(_)));

    // The instance was created before the outage hit the first save
    let stuck = scheduler
        .store()
        .list_by_status(InstanceStatus::Running)
        .await
        .unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].step_status("a"), Some(StepStatus::Pending));

    scheduler.store().fail_saves.store(false, Ordering::SeqCst);
    let instance = scheduler.advance(stuck[0].id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_lost_settlement_checkpoint_is_reclaimed_by_advance() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let charge = action_fn(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(output("charged", json!(true)))
        }
    });
    let scheduler = scheduler_with(
        FlakyStore::default(),
        EngineConfig::default(),
        vec![StepDefinition::automated("charge", charge).max_retries(1)],
    );
    // Save 1 records the dispatch, save 2 would record the result
    scheduler.store().fail_nth_save.store(2, Ordering::SeqCst);

    let err = scheduler
        .start(TEMPLATE, ContextMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Checkpoint(_)));

    let stuck = scheduler
        .store()
        .list_by_status(InstanceStatus::Running)
        .await
        .unwrap();
    assert_eq!(stuck[0].step_status("charge"), Some(StepStatus::Running));

    let instance = scheduler.advance(stuck[0].id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    let state = instance.step("charge").unwrap();
    assert_eq!(state.attempts, 2);
    assert!(state.last_error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.live_attempts(), 0);
}

#[tokio::test]
async fn test_lost_settlement_without_budget_fails_on_advance() {
    let scheduler = scheduler_with(
        FlakyStore::default(),
        EngineConfig::default(),
        vec![StepDefinition::automated("charge", emit("charged", json!(true)))],
    );
    scheduler.store().fail_nth_save.store(2, Ordering::SeqCst);
    scheduler
        .start(TEMPLATE, ContextMap::new())
        .await
        .unwrap_err();

    let stuck = scheduler
        .store()
        .list_by_status(InstanceStatus::Running)
        .await
        .unwrap();
    let instance = scheduler.advance(stuck[0].id).await.unwrap();

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(
        instance.step("charge").unwrap().last_error.as_deref(),
        Some("step interrupted")
    );
    // The failure is persisted, not just returned
    assert_eq!(scheduler.instance(instance.id).await.unwrap(), instance);
}

#[tokio::test]
async fn test_concurrent_passes_run_each_step_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let count_once = action_fn(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(output("counted", json!(true)))
        }
    });
    let scheduler = Arc::new(scheduler(vec![
        StepDefinition::human_task("gate"),
        StepDefinition::automated("work", count_once).depends_on(["gate"]),
    ]));
    let id = scheduler.start(TEMPLATE, ContextMap::new()).await.unwrap();

    let (resumed, advanced) = tokio::join!(
        scheduler.resume(id, "gate", StepOutput::new()),
        scheduler.advance(id),
    );
    resumed.unwrap();
    advanced.unwrap();

    let instance = scheduler.instance(id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.active_locks(), 0, "lock table is cleaned up");
}

#[tokio::test]
async fn test_recover_reruns_interrupted_steps() {
    let store = InMemoryInstanceStore::new();

    // A process crashed while "charge" was running
    let mut crashed = WorkflowInstance::new(TEMPLATE, ["charge", "ship"], ContextMap::new());
    let charge = crashed.steps.get_mut("charge").unwrap();
    charge.status = StepStatus::Running;
    charge.attempts = 1;
    store.create(&crashed).await.unwrap();

    let mut done = WorkflowInstance::new(TEMPLATE, ["charge", "ship"], ContextMap::new());
    done.status = InstanceStatus::Completed;
    store.create(&done).await.unwrap();

    let scheduler = scheduler_with(
        store,
        EngineConfig::default(),
        vec![
            StepDefinition::automated("charge", emit("charged", json!(true))).max_retries(1),
            StepDefinition::automated("ship", emit("shipped", json!(true))).depends_on(["charge"]),
        ],
    );

    let recovered = scheduler.recover().await.unwrap();
    assert_eq!(recovered.len(), 1);
    let instance = &recovered[0];
    assert_eq!(instance.id, crashed.id);
    assert_eq!(instance.status, InstanceStatus::Completed);
    let charge = instance.step("charge").unwrap();
    assert_eq!(charge.attempts, 2);
    assert!(charge.last_error.is_none());
    assert_eq!(instance.context["shipped"], json!(true));
}

#[tokio::test]
async fn test_recover_without_retry_budget_fails_instance() {
    let store = InMemoryInstanceStore::new();
    let mut crashed = WorkflowInstance::new(TEMPLATE, ["charge"], ContextMap::new());
    let charge = crashed.steps.get_mut("charge").unwrap();
    charge.status = StepStatus::Running;
    charge.attempts = 1;
    store.create(&crashed).await.unwrap();

    let scheduler = scheduler_with(
        store,
        EngineConfig::default(),
        vec![StepDefinition::automated("charge", emit("charged", json!(true)))],
    );

    let recovered = scheduler.recover().await.unwrap();
    assert_eq!(recovered[0].status, InstanceStatus::Failed);
    assert_eq!(
        recovered[0].step("charge").unwrap().last_error.as_deref(),
        Some("step interrupted")
    );
}
