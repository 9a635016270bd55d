// Parallel target scheduler

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::{Connection, ConnectionFactory};
use crate::config::MAX_PARALLEL;
use crate::inventory::Target;
use crate::modules::{ModuleExecutor, PackageManagerSetting, StepIo};
use crate::output::errors::{short_message, PfError, StepError};
use crate::output::multiplex::{HostSink, MarkerKind, OutputMultiplexer};
use crate::output::terminal::{RunReport, StepResult, TargetReport, TargetStatus};
use crate::parser::ast::TaskDefinition;
use crate::runtime::{resolve_task, ResolvedStep, ResolvedTask};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrent targets (never more than 32)
    pub max_parallel: usize,
    /// Per-step timeout; none by default
    pub step_timeout: Option<Duration>,
    /// Enable sudo for all steps (CLI override)
    pub sudo: bool,
    pub sudo_user: Option<String>,
    pub package_manager: PackageManagerSetting,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_parallel: MAX_PARALLEL,
            step_timeout: None,
            sudo: false,
            sudo_user: None,
            package_manager: PackageManagerSetting::default(),
        }
    }
}

/// One task requested on the command line with its parameters
#[derive(Debug, Clone)]
pub struct Invocation {
    pub task: TaskDefinition,
    pub params: HashMap<String, String>,
}

impl Invocation {
    pub fn new(task: TaskDefinition, params: HashMap<String, String>) -> Self {
        Invocation { task, params }
    }
}

/// Runs invocations across targets: targets in parallel, steps in order
pub struct Scheduler {
    config: SchedulerConfig,
    connector: Arc<dyn ConnectionFactory>,
    modules: Arc<ModuleExecutor>,
    process_env: HashMap<String, String>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, connector: Arc<dyn ConnectionFactory>) -> Self {
        let modules = Arc::new(ModuleExecutor::new(config.package_manager));
        Scheduler {
            config,
            connector,
            modules,
            process_env: std::env::vars().collect(),
        }
    }

    /// Replace the process environment used as the lowest interpolation scope
    pub fn with_process_env(mut self, env: HashMap<String, String>) -> Self {
        self.process_env = env;
        self
    }

    /// Number of targets allowed to run at once for a run over `targets`
    pub fn concurrency(&self, targets: usize) -> usize {
        self.config
            .max_parallel
            .clamp(1, MAX_PARALLEL)
            .min(targets.max(1))
    }

    /// Run every invocation on every target
    ///
    /// A failing step stops only its own target. The report lists every
    /// target in the order given, after all of them have finished.
    pub async fn run(
        &self,
        invocations: &[Invocation],
        targets: &[Target],
        output: &OutputMultiplexer,
        cancel: &CancellationToken,
    ) -> RunReport {
        let start = Instant::now();

        let tasks: Arc<Vec<ResolvedTask>> = Arc::new(
            invocations
                .iter()
                .map(|inv| resolve_task(&inv.task, &inv.params, &self.process_env))
                .collect(),
        );

        // Semaphore to limit concurrent targets
        let semaphore = Arc::new(Semaphore::new(self.concurrency(targets.len())));
        info!(
            targets = targets.len(),
            concurrency = self.concurrency(targets.len()),
            "starting run"
        );

        let futures: Vec<_> = targets
            .iter()
            .map(|target| {
                let runner = TargetRunner {
                    target: target.clone(),
                    tasks: tasks.clone(),
                    sink: output.sink(target),
                    connector: self.connector.clone(),
                    modules: self.modules.clone(),
                    config: self.config.clone(),
                    cancel: cancel.clone(),
                };
                let sem = semaphore.clone();

                async move {
                    let permit = tokio::select! {
                        permit = sem.acquire_owned() => permit.ok(),
                        _ = runner.cancel.cancelled() => None,
                    };
                    let Some(_permit) = permit else {
                        return runner.cancelled_before_start();
                    };
                    if runner.cancel.is_cancelled() {
                        return runner.cancelled_before_start();
                    }
                    runner.run().await
                }
            })
            .collect();

        let results = join_all(futures).await;

        RunReport {
            targets: results,
            duration: start.elapsed(),
        }
    }
}

/// Everything one target's sequential execution owns
struct TargetRunner {
    target: Target,
    tasks: Arc<Vec<ResolvedTask>>,
    sink: HostSink,
    connector: Arc<dyn ConnectionFactory>,
    modules: Arc<ModuleExecutor>,
    config: SchedulerConfig,
    cancel: CancellationToken,
}

enum StepEnd {
    Ok,
    Failed(String),
    Cancelled,
}

impl TargetRunner {
    fn cancelled_before_start(&self) -> TargetReport {
        TargetReport {
            target: self.target.clone(),
            steps: Vec::new(),
            status: TargetStatus::Cancelled,
        }
    }

    async fn run(self) -> TargetReport {
        let connected = tokio::select! {
            conn = self.connector.connect(&self.target) => Some(conn),
            _ = self.cancel.cancelled() => None,
        };

        let conn = match connected {
            None => return self.cancelled_before_start(),
            Some(Ok(conn)) => conn,
            Some(Err(e)) => return self.connect_failed(e),
        };

        let mut ctx = ExecutionContext::new(self.target.clone())
            .with_sudo(self.config.sudo, self.config.sudo_user.clone())
            .with_package_manager(self.modules.configured_package_manager());

        let mut steps = Vec::new();

        for task in self.tasks.iter() {
            self.sink.marker(MarkerKind::Task, task.name.as_str());

            for resolved in task.steps.iter().filter(|s| !s.step.kind.is_directive()) {
                if self.cancel.is_cancelled() {
                    return self.finish(steps, TargetStatus::Cancelled);
                }

                let (result, end) = self
                    .run_step(&task.name, resolved, &mut ctx, conn.as_ref())
                    .await;
                let exit_code = result.exit_code;
                steps.push(result);

                match end {
                    StepEnd::Ok => {}
                    StepEnd::Cancelled => return self.finish(steps, TargetStatus::Cancelled),
                    StepEnd::Failed(reason) => {
                        self.sink.marker(MarkerKind::Failure, reason.as_str());
                        let error = self.step_error(
                            &task.name,
                            resolved.step.line,
                            resolved.step.kind.label(),
                            exit_code,
                            reason,
                        );
                        return self.finish(steps, TargetStatus::Failed(error));
                    }
                }
            }
        }

        self.finish(steps, TargetStatus::Succeeded)
    }

    async fn run_step(
        &self,
        task: &str,
        resolved: &ResolvedStep,
        ctx: &mut ExecutionContext,
        conn: &dyn Connection,
    ) -> (StepResult, StepEnd) {
        let label = resolved.step.kind.label();
        let step_token = self.cancel.child_token();

        // The timer only cancels this step's token, never the run's
        let timer = self.config.step_timeout.map(|limit| {
            let token = step_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        });

        let io = StepIo {
            conn,
            sink: &self.sink,
            cancel: &step_token,
        };

        let start = Instant::now();
        let outcome = self.modules.execute(resolved, ctx, io).await;
        let duration = start.elapsed();

        if let Some(timer) = timer {
            timer.abort();
        }

        let outcome = match outcome {
            Err(PfError::Cancelled { .. }) if !self.cancel.is_cancelled() => {
                Err(PfError::Timeout {
                    operation: label.clone(),
                    duration_secs: self.config.step_timeout.map_or(0, |d| d.as_secs()),
                })
            }
            other => other,
        };

        let (exit_code, error, end) = match outcome {
            Ok(0) => (Some(0), None, StepEnd::Ok),
            Ok(code) => {
                let reason = format!("exit code {}", code);
                (Some(code), Some(reason.clone()), StepEnd::Failed(reason))
            }
            Err(PfError::Cancelled { .. }) => {
                debug!(target = %self.target, step = %label, "step cancelled");
                (None, Some("cancelled".to_string()), StepEnd::Cancelled)
            }
            Err(e) => {
                let reason = short_message(&e);
                warn!(target = %self.target, step = %label, error = %reason, "step failed");
                (None, Some(reason.clone()), StepEnd::Failed(reason))
            }
        };

        let result = StepResult {
            task: task.to_string(),
            line: resolved.step.line,
            label,
            exit_code,
            duration,
            error,
        };

        (result, end)
    }

    /// A transport failure counts as a failure of the target's first step
    fn connect_failed(&self, error: PfError) -> TargetReport {
        let reason = short_message(&error);
        warn!(target = %self.target, error = %reason, "connection failed");
        self.sink.marker(MarkerKind::Failure, reason.as_str());

        let first = self.tasks.iter().find_map(|task| {
            task.steps
                .iter()
                .find(|s| !s.step.kind.is_directive())
                .map(|s| (task.name.clone(), s.step.line, s.step.kind.label()))
        });
        let (task, line, label) = first.unwrap_or_else(|| {
            let name = self
                .tasks
                .first()
                .map(|t| t.name.clone())
                .unwrap_or_default();
            (name, 0, "connect".to_string())
        });

        let step = StepResult {
            task: task.clone(),
            line,
            label: label.clone(),
            exit_code: None,
            duration: Duration::ZERO,
            error: Some(reason.clone()),
        };

        TargetReport {
            target: self.target.clone(),
            steps: vec![step],
            status: TargetStatus::Failed(self.step_error(&task, line, label, None, reason)),
        }
    }

    fn step_error(
        &self,
        task: &str,
        line: usize,
        step: String,
        exit_code: Option<i32>,
        message: String,
    ) -> StepError {
        StepError {
            target: self.target.label(),
            task: task.to_string(),
            line,
            step,
            exit_code,
            message,
        }
    }

    fn finish(&self, steps: Vec<StepResult>, status: TargetStatus) -> TargetReport {
        debug!(target = %self.target, status = ?status, "target finished");
        TargetReport {
            target: self.target.clone(),
            steps,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandResult, DefaultConnector, RenderedCommand};
    use crate::parser::parse_document;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Shared record of what the fake connections saw
    #[derive(Default)]
    struct Recorder {
        commands: Mutex<HashMap<String, Vec<String>>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Recorder {
        fn commands_for(&self, target: &Target) -> Vec<String> {
            self.commands
                .lock()
                .get(&target.label())
                .cloned()
                .unwrap_or_default()
        }
    }

    /// Commands containing `fail-on-<host>` exit 1 on that host only, `hang`
    /// waits for cancellation, everything else sleeps briefly and exits 0
    struct FakeConnection {
        target: Target,
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn exec(&self, _cmd: &str) -> Result<CommandResult, PfError> {
            Ok(CommandResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        async fn exec_streaming(
            &self,
            cmd: &RenderedCommand,
            sink: &HostSink,
            cancel: &CancellationToken,
        ) -> Result<i32, PfError> {
            self.recorder
                .commands
                .lock()
                .entry(self.target.label())
                .or_default()
                .push(cmd.command.clone());

            let now = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.recorder.peak.fetch_max(now, Ordering::SeqCst);

            let result = if cmd.command.contains("hang") {
                cancel.cancelled().await;
                Err(PfError::Cancelled {
                    operation: cmd.display.clone(),
                })
            } else {
                tokio::time::sleep(Duration::from_millis(20)).await;
                sink.line(crate::output::Stream::Stdout, "done");
                let fails_here = match &self.target {
                    Target::Remote { host, .. } => {
                        cmd.command.contains(&format!("fail-on-{}", host))
                    }
                    Target::Local => cmd.command.contains("fail-on-local"),
                };
                Ok(if fails_here { 1 } else { 0 })
            };

            self.recorder.active.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn upload_file(
            &self,
            _local: &Path,
            _remote: &str,
            _cancel: &CancellationToken,
        ) -> Result<(), PfError> {
            Ok(())
        }

        fn target(&self) -> &Target {
            &self.target
        }
    }

    /// Hosts named `down` refuse connections
    struct FakeFactory {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        async fn connect(&self, target: &Target) -> Result<Arc<dyn Connection>, PfError> {
            if let Target::Remote { host, .. } = target {
                if host == "down" {
                    return Err(PfError::Ssh {
                        host: target.label(),
                        message: "Connection failed: refused".to_string(),
                        suggestion: None,
                    });
                }
            }
            Ok(Arc::new(FakeConnection {
                target: target.clone(),
                recorder: self.recorder.clone(),
            }))
        }
    }

    fn scheduler(config: SchedulerConfig) -> (Scheduler, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let factory = Arc::new(FakeFactory {
            recorder: recorder.clone(),
        });
        let scheduler = Scheduler::new(config, factory).with_process_env(HashMap::new());
        (scheduler, recorder)
    }

    fn invocation(src: &str) -> Invocation {
        let task = parse_document(src).unwrap().tasks.remove(0);
        Invocation::new(task, HashMap::new())
    }

    fn quiet_output() -> OutputMultiplexer {
        OutputMultiplexer::spawn(std::io::sink(), true)
    }

    #[tokio::test]
    async fn test_failure_stops_only_that_target() {
        let (scheduler, recorder) = scheduler(SchedulerConfig::default());
        let h1 = Target::remote("ops", "h1", 22);
        let h2 = Target::remote("ops", "h2", 22);

        let inv = invocation(
            "task deploy\n  describe roll out\n  shell step-one\n  shell step-two fail-on-h1\n  shell step-three\nend\n",
        );

        let output = quiet_output();
        let report = scheduler
            .run(&[inv], &[h1.clone(), h2.clone()], &output, &CancellationToken::new())
            .await;
        output.finish().await;

        assert!(!report.success());
        assert_eq!(
            recorder.commands_for(&h1),
            vec!["step-one".to_string(), "step-two fail-on-h1".to_string()]
        );
        assert_eq!(
            recorder.commands_for(&h2),
            vec![
                "step-one".to_string(),
                "step-two fail-on-h1".to_string(),
                "step-three".to_string()
            ]
        );

        let h1_report = report.get(&h1).unwrap();
        match &h1_report.status {
            TargetStatus::Failed(err) => {
                assert_eq!(err.target, "ops@h1:22");
                assert_eq!(err.task, "deploy");
                assert_eq!(err.line, 4);
                assert_eq!(err.exit_code, Some(1));
                assert_eq!(err.message, "exit code 1");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(h1_report.steps.len(), 2);

        let h2_report = report.get(&h2).unwrap();
        assert!(h2_report.succeeded());
        assert_eq!(h2_report.steps.len(), 3);
        assert_eq!(report.failed_targets().count(), 1);
    }

    #[tokio::test]
    async fn test_mixed_run_reports_every_target() {
        let (scheduler, recorder) = scheduler(SchedulerConfig::default());
        let good = Target::remote("ops", "good", 22);
        let bad = Target::remote("ops", "down", 22);

        let output = quiet_output();
        let report = scheduler
            .run(
                &[invocation("task t\n  env A=1\n  shell one\n  shell two\nend\n")],
                &[bad.clone(), good.clone()],
                &output,
                &CancellationToken::new(),
            )
            .await;
        output.finish().await;

        assert!(!report.success());
        assert_eq!(report.targets[0].target, bad);
        assert_eq!(report.targets[1].target, good);
        assert!(report.get(&good).unwrap().succeeded());

        let bad_report = report.get(&bad).unwrap();
        assert!(recorder.commands_for(&bad).is_empty());
        match &bad_report.status {
            TargetStatus::Failed(err) => {
                assert_eq!(err.line, 3);
                assert_eq!(err.exit_code, None);
                assert!(err.message.contains("refused"));
            }
            other => panic!("expected failure, got {:?}", other),
        }

        // Remote commands carry the task env as exports
        assert_eq!(
            recorder.commands_for(&good)[0],
            "export A='1'; one".to_string()
        );
    }

    #[tokio::test]
    async fn test_concurrency_is_capped_at_32() {
        let (scheduler, recorder) = scheduler(SchedulerConfig::default());
        let targets: Vec<Target> = (0..40)
            .map(|i| Target::remote("ops", format!("h{}", i), 22))
            .collect();
        assert_eq!(scheduler.concurrency(targets.len()), 32);

        let output = quiet_output();
        let report = scheduler
            .run(
                &[invocation("task t\n  shell a\n  shell b\nend\n")],
                &targets,
                &output,
                &CancellationToken::new(),
            )
            .await;
        output.finish().await;

        assert!(report.success());
        assert_eq!(report.targets.len(), 40);
        let peak = recorder.peak.load(Ordering::SeqCst);
        assert!(peak <= 32, "peak concurrency {}", peak);
        assert!(peak > 1, "targets never overlapped");
    }

    #[tokio::test]
    async fn test_configured_parallelism_is_respected() {
        let (scheduler, recorder) = scheduler(SchedulerConfig {
            max_parallel: 3,
            ..SchedulerConfig::default()
        });
        let targets: Vec<Target> = (0..10)
            .map(|i| Target::remote("ops", format!("h{}", i), 22))
            .collect();

        let output = quiet_output();
        scheduler
            .run(
                &[invocation("task t\n  shell a\nend\n")],
                &targets,
                &output,
                &CancellationToken::new(),
            )
            .await;
        output.finish().await;

        assert!(recorder.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_steps_on_one_target_never_overlap() {
        let (scheduler, recorder) = scheduler(SchedulerConfig::default());
        let output = quiet_output();
        scheduler
            .run(
                &[invocation("task t\n  shell a\n  shell b\n  shell c\nend\n")],
                &[Target::remote("ops", "solo", 22)],
                &output,
                &CancellationToken::new(),
            )
            .await;
        output.finish().await;

        assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_step_timeout_affects_only_that_target() {
        let (scheduler, _recorder) = scheduler(SchedulerConfig {
            step_timeout: Some(Duration::from_millis(100)),
            ..SchedulerConfig::default()
        });
        let slow = Target::remote("ops", "slow", 22);
        let fast = Target::remote("ops", "fast", 22);

        let mut slow_inv = invocation("task t\n  shell run $MODE\n  shell after\nend\n");
        slow_inv.params.insert("MODE".to_string(), "hang".to_string());
        let fast_inv = invocation("task t\n  shell run $MODE\n  shell after\nend\n");

        let output = quiet_output();
        let cancel = CancellationToken::new();
        let slow_invs = [slow_inv];
        let fast_invs = [fast_inv];
        let slow_targets = [slow.clone()];
        let fast_targets = [fast.clone()];
        let (slow_report, fast_report) = tokio::join!(
            scheduler.run(&slow_invs, &slow_targets, &output, &cancel),
            scheduler.run(&fast_invs, &fast_targets, &output, &cancel),
        );
        output.finish().await;

        match &slow_report.get(&slow).unwrap().status {
            TargetStatus::Failed(err) => assert!(err.message.contains("timed out")),
            other => panic!("expected timeout failure, got {:?}", other),
        }
        assert!(fast_report.success());
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_interrupt_cancels_in_flight_and_pending_steps() {
        let (scheduler, recorder) = scheduler(SchedulerConfig::default());
        let target = Target::remote("ops", "h1", 22);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let output = quiet_output();
        let report = scheduler
            .run(
                &[invocation("task t\n  shell hang\n  shell never\nend\n")],
                &[target.clone()],
                &output,
                &cancel,
            )
            .await;
        output.finish().await;

        assert!(report.was_cancelled());
        assert!(!report.success());
        assert_eq!(recorder.commands_for(&target), vec!["hang".to_string()]);
    }

    #[tokio::test]
    async fn test_multiple_tasks_run_in_order_per_target() {
        let (scheduler, recorder) = scheduler(SchedulerConfig::default());
        let target = Target::remote("ops", "h1", 22);

        let first = invocation("task first\n  shell one\nend\n");
        let mut second = invocation("task second greeting=hi\n  shell two $greeting\nend\n");
        second.params.insert("greeting".to_string(), "hello".to_string());

        let output = quiet_output();
        let report = scheduler
            .run(&[first, second], &[target.clone()], &output, &CancellationToken::new())
            .await;
        output.finish().await;

        assert!(report.success());
        assert_eq!(
            recorder.commands_for(&target),
            vec!["one".to_string(), "two hello".to_string()]
        );
        let steps = &report.get(&target).unwrap().steps;
        assert_eq!(steps[0].task, "first");
        assert_eq!(steps[1].task, "second");
    }

    #[tokio::test]
    async fn test_local_target_end_to_end() {
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(DefaultConnector::default()),
        )
        .with_process_env(HashMap::new());

        let output = quiet_output();
        let report = scheduler
            .run(
                &[invocation(
                    "task t\n  env PF_E2E=ok\n  shell test \"$PF_E2E\" = ok\n  shell exit 5\n  shell echo unreachable\nend\n",
                )],
                &[Target::Local],
                &output,
                &CancellationToken::new(),
            )
            .await;
        output.finish().await;

        let local = report.get(&Target::Local).unwrap();
        assert_eq!(local.steps.len(), 2);
        assert_eq!(local.steps[0].exit_code, Some(0));
        assert_eq!(local.steps[1].exit_code, Some(5));
        match &local.status {
            TargetStatus::Failed(err) => {
                assert_eq!(err.line, 4);
                assert_eq!(err.exit_code, Some(5));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
