//! End-to-end tests for the recovery wrapper.
//!
//! - calls and casts proxy transparently to the worker
//! - worker death preserves the last snapshot under a long TTL and reaches
//!   the supervisor as a failure report
//! - five consecutive forwarding failures terminate the wrapper

use async_trait::async_trait;
use parking_lot::Mutex;
use recovery_kernel::context::{ContextBlob, ContextManager, InMemoryContextStore};
use recovery_kernel::health::StaticHealthProbe;
use recovery_kernel::learner::{spawn_learner, LearnerConfig};
use recovery_kernel::supervisor::{
    spawn_supervisor, RestartBackend, SupervisorConfig, SupervisorDeps, SupervisorHandle,
};
use recovery_kernel::telemetry::MemorySink;
use recovery_kernel::types::{ChildId, ChildSpec};
use recovery_kernel::wrapper::{
    spawn_wrapper, spawn_worker_task, SpawnedWorker, Worker, WorkerFactory, WorkerHandle,
    WrapperConfig, WrapperDeps, WrapperExit,
};
use recovery_kernel::WrapperError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Worker that counts calls, crashes on a "die" cast, and snapshots its count
struct CountingWorker {
    calls: u64,
}

#[async_trait]
impl Worker for CountingWorker {
    async fn handle_call(&mut self, payload: ContextBlob) -> Result<ContextBlob, String> {
        self.calls += 1;
        Ok(json!({"echo": payload, "calls": self.calls}))
    }

    async fn handle_cast(&mut self, payload: ContextBlob) -> Result<(), String> {
        if payload == json!("die") {
            return Err("poison pill".to_string());
        }
        Ok(())
    }

    async fn get_state(&mut self) -> Option<ContextBlob> {
        Some(json!({"calls": self.calls}))
    }

    async fn restore_context(&mut self, ctx: ContextBlob) {
        if let Some(calls) = ctx.get("calls").and_then(|v| v.as_u64()) {
            self.calls = calls;
        }
    }
}

struct CountingFactory;

#[async_trait]
impl WorkerFactory for CountingFactory {
    async fn spawn_worker(&self) -> SpawnedWorker {
        spawn_worker_task(CountingWorker { calls: 0 }, 16)
    }
}

/// Factory whose workers are already unreachable; the exit sender is parked
/// so the wrapper only ever sees forwarding failures
#[derive(Default)]
struct DeadWorkerFactory {
    parked: Mutex<Vec<oneshot::Sender<String>>>,
}

#[async_trait]
impl WorkerFactory for DeadWorkerFactory {
    async fn spawn_worker(&self) -> SpawnedWorker {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (exit_tx, exited) = oneshot::channel();
        self.parked.lock().push(exit_tx);
        SpawnedWorker {
            handle: WorkerHandle::new(tx),
            exited,
        }
    }
}

#[derive(Default)]
struct NoopBackend {
    restarts: Mutex<Vec<ChildId>>,
}

#[async_trait]
impl RestartBackend for NoopBackend {
    async fn restart_child(&self, id: &ChildId) -> Result<(), String> {
        self.restarts.lock().push(id.clone());
        Ok(())
    }

    async fn is_running(&self, _id: &ChildId) -> bool {
        true
    }

    async fn deliver_context(&self, _id: &ChildId, _ctx: ContextBlob) {}

    async fn start_fallback(&self, _id: &ChildId, _tag: &str) -> Result<(), String> {
        Ok(())
    }

    async fn escalate(&self, _id: &ChildId, _reason: &str) {}
}

fn start_supervisor(context: Arc<InMemoryContextStore>) -> SupervisorHandle {
    let (learner, _task) = spawn_learner(LearnerConfig::new());
    let (supervisor, _task) = spawn_supervisor(
        &[ChildSpec::new("counter")],
        SupervisorConfig::default(),
        SupervisorDeps {
            learner,
            context,
            health: Arc::new(StaticHealthProbe::healthy()),
            telemetry: Arc::new(MemorySink::new()),
            backend: Arc::new(NoopBackend::default()),
        },
    );
    supervisor
}

fn deps(
    factory: Arc<dyn WorkerFactory>,
    context: Arc<InMemoryContextStore>,
    supervisor: SupervisorHandle,
) -> WrapperDeps {
    let (learner, _task) = spawn_learner(LearnerConfig::new());
    WrapperDeps {
        factory,
        context,
        supervisor,
        learner,
    }
}

#[tokio::test]
async fn calls_proxy_transparently() {
    let context = Arc::new(InMemoryContextStore::new());
    let supervisor = start_supervisor(Arc::clone(&context));
    let (wrapper, _task) = spawn_wrapper(
        WrapperConfig::new("counter"),
        deps(Arc::new(CountingFactory), context, supervisor),
    )
    .await;

    let reply = wrapper.call(json!({"n": 1})).await.unwrap();
    assert_eq!(reply, json!({"echo": {"n": 1}, "calls": 1}));
    let reply = wrapper.call(json!({"n": 2})).await.unwrap();
    assert_eq!(reply["calls"], json!(2));
}

#[tokio::test]
async fn periodic_snapshot_lands_in_the_context_store() {
    let context = Arc::new(InMemoryContextStore::new());
    let supervisor = start_supervisor(Arc::clone(&context));
    let (wrapper, _task) = spawn_wrapper(
        WrapperConfig::new("counter").with_snapshot_interval(Duration::from_millis(10)),
        deps(Arc::new(CountingFactory), Arc::clone(&context), supervisor),
    )
    .await;

    wrapper.call(json!(null)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(context.get_context("counter").await, Some(json!({"calls": 1})));
}

#[tokio::test]
async fn restored_context_survives_a_worker_generation() {
    let context = Arc::new(InMemoryContextStore::new());
    let supervisor = start_supervisor(Arc::clone(&context));
    context
        .store_context(
            "counter",
            json!({"calls": 40}),
            Duration::from_secs(60),
        )
        .await;

    let (wrapper, _task) = spawn_wrapper(
        WrapperConfig::new("counter"),
        deps(Arc::new(CountingFactory), context, supervisor),
    )
    .await;

    let reply = wrapper.call(json!(null)).await.unwrap();
    assert_eq!(reply["calls"], json!(41));
}

#[tokio::test]
async fn worker_death_preserves_context_and_reports_upward() {
    let context = Arc::new(InMemoryContextStore::new());
    let supervisor = start_supervisor(Arc::clone(&context));
    let (wrapper, task) = spawn_wrapper(
        WrapperConfig::new("counter").with_snapshot_interval(Duration::from_millis(10)),
        deps(
            Arc::new(CountingFactory),
            Arc::clone(&context),
            supervisor.clone(),
        ),
    )
    .await;

    wrapper.call(json!(null)).await.unwrap();
    // let at least one periodic snapshot land before the crash
    tokio::time::sleep(Duration::from_millis(50)).await;
    wrapper.cast(json!("die")).unwrap();

    assert_eq!(
        task.await.unwrap(),
        WrapperExit::WorkerFailure("poison pill".to_string())
    );
    assert_eq!(context.get_context("counter").await, Some(json!({"calls": 1})));

    // the supervisor saw the failure and ran its recovery path
    let mut exits = 0;
    for _ in 0..50 {
        exits = supervisor.get_recovery_stats().await.unwrap().total_exits;
        if exits > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(exits, 1);
}

#[tokio::test]
async fn five_consecutive_failures_terminate_the_wrapper() {
    let context = Arc::new(InMemoryContextStore::new());
    let supervisor = start_supervisor(Arc::clone(&context));
    let (wrapper, task) = spawn_wrapper(
        WrapperConfig::new("counter").with_io_timeout(Duration::from_millis(50)),
        deps(Arc::new(DeadWorkerFactory::default()), context, supervisor),
    )
    .await;

    for _ in 0..4 {
        assert_eq!(
            wrapper.call(json!(null)).await,
            Err(WrapperError::WorkerUnavailable)
        );
    }
    assert_eq!(
        wrapper.call(json!(null)).await,
        Err(WrapperError::WorkerUnavailable)
    );
    assert_eq!(task.await.unwrap(), WrapperExit::TooManyErrors);
}

#[tokio::test]
async fn successful_forward_resets_the_error_streak() {
    struct FlakyWorker {
        failures_left: u32,
    }

    #[async_trait]
    impl Worker for FlakyWorker {
        async fn handle_call(&mut self, _payload: ContextBlob) -> Result<ContextBlob, String> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                // stall past the wrapper's IO bound instead of crashing
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(json!("ok"))
        }
    }

    struct FlakyFactory;

    #[async_trait]
    impl WorkerFactory for FlakyFactory {
        async fn spawn_worker(&self) -> SpawnedWorker {
            spawn_worker_task(FlakyWorker { failures_left: 3 }, 16)
        }
    }

    let context = Arc::new(InMemoryContextStore::new());
    let supervisor = start_supervisor(Arc::clone(&context));
    let (wrapper, task) = spawn_wrapper(
        WrapperConfig::new("counter").with_io_timeout(Duration::from_millis(50)),
        deps(Arc::new(FlakyFactory), context, supervisor),
    )
    .await;

    for _ in 0..3 {
        assert_eq!(wrapper.call(json!(null)).await, Err(WrapperError::Timeout));
        // drain the stalled call before sending the next one
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert_eq!(wrapper.call(json!(null)).await, Ok(json!("ok")));
    assert_eq!(wrapper.call(json!(null)).await, Ok(json!("ok")));

    wrapper.shutdown();
    assert_eq!(task.await.unwrap(), WrapperExit::Shutdown);
}
