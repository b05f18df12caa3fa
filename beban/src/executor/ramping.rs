use std::{panic::AssertUnwindSafe, time::Duration};

use futures::FutureExt;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{ExecutionStats, Executor, RunContext, Schedule};
use crate::{
    error::{IterationError, IterationResult, RunError},
    metric::builtin,
    pacing::ThinkTime,
    scenario::Scenario,
    vu::{Vu, VuSlot, VuState},
};
use internals::*;

/// Executor that ramps a pool of looping VUs up and down along a [`Schedule`].
///
/// - The controller ticks every `tick` and brings the active VU count to the
///   schedule's (rounded) target.
/// - Retired VUs finish their in-flight iteration within `graceful_ramp_down`.
/// - At the end of the run every VU gets `graceful_stop` to finish.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RampingVuExecutor {
    pub schedule: Schedule,
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub graceful_stop: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub graceful_ramp_down: Duration,
    #[builder(default)]
    pub think_time: ThinkTime,
}

impl<F, Fut> Executor<F, Fut> for RampingVuExecutor
where
    F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = IterationResult> + Send + 'static,
{
    async fn exec(
        &self,
        scenario: &Scenario<F, Fut>,
        ctx: &RunContext,
    ) -> Result<ExecutionStats, RunError> {
        self.think_time.validate()?;
        tracing::info!(
            "Running scenario `{}`: {} stage(s), up to {} VUs over {}",
            scenario.name,
            self.schedule.stages().len(),
            self.schedule.max_vus(),
            humantime::format_duration(self.schedule.total_duration())
        );

        let started = Instant::now();
        let mut controller = Controller::new(self.clone(), scenario.action.clone(), ctx.clone());
        let driven = controller.drive().await;
        controller.shutdown().await;
        let interrupted = driven?;

        let stats = ExecutionStats::from_status(&ctx.status, interrupted, started.elapsed());
        tracing::info!(
            "Done running scenario `{}`: {} VUs spawned, {} aborted",
            scenario.name,
            stats.vus_spawned,
            stats.vus_aborted
        );
        Ok(stats)
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

mod internals {
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::registry::Recorder;

    pub struct VuHandle {
        pub id: u64,
        pub token: CancellationToken,
        pub task: JoinHandle<VuExit>,
        pub recorder: Recorder,
    }

    /// A VU that was told to stop and has until `deadline` to do so.
    pub struct Draining {
        pub handle: VuHandle,
        pub deadline: Instant,
        pub aborted: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VuExit {
        pub id: u64,
        pub iterations: u64,
        pub state: VuState,
    }

    /// Owns every VU task of one run.
    pub struct Controller<F> {
        config: RampingVuExecutor,
        action: F,
        ctx: RunContext,
        active: Vec<VuHandle>,
        draining: Vec<Draining>,
        next_id: u64,
    }

    impl<F, Fut> Controller<F>
    where
        F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = IterationResult> + Send + 'static,
    {
        pub fn new(config: RampingVuExecutor, action: F, ctx: RunContext) -> Self {
            Self {
                config,
                action,
                ctx,
                active: Vec::new(),
                draining: Vec::new(),
                next_id: 0,
            }
        }

        pub fn active(&self) -> usize {
            self.active.len()
        }

        pub fn draining(&self) -> usize {
            self.draining.len()
        }

        pub fn active_ids(&self) -> Vec<u64> {
            self.active.iter().map(|h| h.id).collect()
        }

        /// Follows the schedule until it ends or the run is cancelled.
        /// Returns whether the run was cancelled.
        pub async fn drive(&mut self) -> Result<bool, RunError> {
            let schedule = self.config.schedule.clone();
            let start = Instant::now();
            let end = start + schedule.total_duration();
            let mut next_tick = start;
            let mut stage = None;

            loop {
                let elapsed = start.elapsed();
                if elapsed >= schedule.total_duration() {
                    return Ok(false);
                }

                let current = schedule.stage_index_at(elapsed);
                if current != stage {
                    if let Some(i) = current {
                        let s = schedule.stages()[i];
                        tracing::info!(
                            "Stage {}/{}: {} VUs over {}",
                            i + 1,
                            schedule.stages().len(),
                            s.target,
                            humantime::format_duration(s.duration)
                        );
                    }
                    stage = current;
                }

                self.scale_to(schedule.vus_at(elapsed))?;
                self.reap();
                self.record_gauges();

                next_tick += self.config.tick;
                tokio::select! {
                    _ = tokio::time::sleep_until(next_tick.min(end)) => {}
                    _ = self.ctx.cancel.cancelled() => {
                        tracing::info!("Run cancelled, no more VUs will be spawned");
                        return Ok(true);
                    }
                }
            }
        }

        /// Spawns or retires VUs until exactly `target` are active.
        pub fn scale_to(&mut self, target: u32) -> Result<(), RunError> {
            let target = target as usize;
            while self.active.len() < target {
                self.spawn()?;
            }
            if self.active.len() > target {
                let deadline = Instant::now() + self.config.graceful_ramp_down;
                while self.active.len() > target {
                    let Some(handle) = self.active.pop() else {
                        break;
                    };
                    tracing::debug!("Retiring VU {}", handle.id);
                    handle.token.cancel();
                    self.draining.push(Draining {
                        handle,
                        deadline,
                        aborted: false,
                    });
                }
            }
            self.ctx.status.set_active(self.active.len());
            Ok(())
        }

        fn spawn(&mut self) -> Result<(), RunError> {
            let client = self
                .ctx
                .client
                .build()
                .map_err(|e| RunError::Setup(format!("failed to build HTTP client: {e}")))?;

            self.next_id += 1;
            let id = self.next_id;
            let token = self.ctx.cancel.child_token();
            let recorder = self.ctx.registry.recorder();
            let slot = VuSlot::new(
                id,
                self.ctx.seed,
                client,
                recorder.clone(),
                self.ctx.base_url.clone(),
                token.clone(),
            );
            let task = tokio::spawn(vu_loop(
                slot,
                self.action.clone(),
                self.config.think_time.clone(),
            ));

            tracing::debug!("Spawned VU {id}");
            self.ctx.status.vu_spawned();
            self.active.push(VuHandle {
                id,
                token,
                task,
                recorder,
            });
            Ok(())
        }

        /// Drops finished retirees and aborts the ones past their deadline.
        ///
        /// An aborted VU stays listed until its task is gone, so its shard is
        /// only folded once nothing can record into it.
        pub fn reap(&mut self) {
            let now = Instant::now();
            let status = &self.ctx.status;
            let registry = &self.ctx.registry;
            self.draining.retain_mut(|d| {
                if d.handle.task.is_finished() {
                    registry.retire(&d.handle.recorder);
                    return false;
                }
                if !d.aborted && now >= d.deadline {
                    tracing::warn!(
                        "VU {} did not finish within graceful_ramp_down, aborting",
                        d.handle.id
                    );
                    d.handle.task.abort();
                    d.aborted = true;
                    status.vu_aborted();
                }
                true
            });
        }

        fn record_gauges(&self) {
            let recorder = self.ctx.registry.main();
            recorder.gauge(builtin::VUS, self.active.len() as f64);
            recorder.gauge(builtin::VUS_MAX, self.ctx.status.peak() as f64);
        }

        /// Stops every VU and waits for them, up to `graceful_stop`.
        pub async fn shutdown(&mut self) {
            let deadline = Instant::now() + self.config.graceful_stop;
            for handle in self.active.drain(..) {
                handle.token.cancel();
                self.draining.push(Draining {
                    handle,
                    deadline,
                    aborted: false,
                });
            }
            self.ctx.status.set_active(0);
            self.record_gauges();

            let draining = std::mem::take(&mut self.draining);
            tracing::info!("Waiting for {} VU(s) to finish", draining.len());
            for Draining {
                handle,
                deadline: own,
                aborted,
            } in draining
            {
                let VuHandle {
                    id,
                    mut task,
                    recorder,
                    ..
                } = handle;
                if aborted {
                    let _ = task.await;
                    self.ctx.registry.retire(&recorder);
                    continue;
                }
                let joined = tokio::time::timeout_at(own.min(deadline), &mut task).await;
                match joined {
                    Ok(Ok(exit)) => {
                        tracing::debug!("VU {id} {} after {} iteration(s)", exit.state, exit.iterations);
                    }
                    Ok(Err(e)) if e.is_panic() => tracing::error!("VU {id} task panicked: {e}"),
                    Ok(Err(_)) => {}
                    Err(_) => {
                        tracing::warn!("VU {id} did not stop within the grace period, aborting");
                        task.abort();
                        let _ = task.await;
                        self.ctx.status.vu_aborted();
                    }
                }
                self.ctx.registry.retire(&recorder);
            }
        }
    }

    /// One VU: iterate, pause, repeat until told to stop.
    pub async fn vu_loop<F, Fut>(mut slot: VuSlot, action: F, think_time: ThinkTime) -> VuExit
    where
        F: Fn(Vu) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = IterationResult> + Send + 'static,
    {
        let id = slot.id();
        let token = slot.token().clone();
        let recorder = slot.recorder().clone();

        while !token.is_cancelled() {
            slot.set_state(VuState::Running);
            let started = Instant::now();
            let result = AssertUnwindSafe(action(slot.vu())).catch_unwind().await;
            let elapsed = started.elapsed();

            match result {
                Ok(Ok(())) => {
                    recorder.add(builtin::ITERATIONS, 1.0);
                    recorder.duration(builtin::ITERATION_DURATION, elapsed);
                }
                Ok(Err(IterationError::Interrupted)) => {
                    tracing::debug!("VU {id} iteration {} interrupted", slot.iteration());
                }
                Ok(Err(e)) => {
                    tracing::debug!("VU {id} iteration {} failed: {e}", slot.iteration());
                    recorder.add(builtin::ITERATIONS, 1.0);
                    recorder.duration(builtin::ITERATION_DURATION, elapsed);
                    recorder.add(builtin::ITERATION_ERRORS, 1.0);
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_owned());
                    tracing::error!("VU {id} iteration {} panicked: {message}", slot.iteration());
                    recorder.add(builtin::ITERATION_ERRORS, 1.0);
                }
            }

            let pause = think_time.pause(id, &mut slot.think_rng());
            slot.advance();
            if token.is_cancelled() {
                break;
            }

            slot.set_state(VuState::Sleeping);
            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = token.cancelled() => break,
            }
        }

        slot.set_state(VuState::Terminated);
        VuExit {
            id,
            iterations: slot.iteration(),
            state: slot.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use super::*;
    use crate::{
        aggregate::Aggregation,
        error::ConfigError,
        executor::{RampPolicy, Stage},
        http::ClientConfig,
        threshold::Threshold,
    };

    fn ctx() -> RunContext {
        RunContext::new(ClientConfig::default(), None, 7)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    async fn pause_one_second(vu: Vu) -> IterationResult {
        vu.check_that("always", true);
        vu.sleep(secs(1)).await
    }

    #[tokio::test(start_paused = true)]
    async fn ramps_up_and_down_with_passing_checks() {
        let schedule = Schedule::new(
            0,
            vec![Stage::new(secs(5), 2), Stage::new(secs(5), 0)],
            RampPolicy::Linear,
        )
        .unwrap();
        let executor = RampingVuExecutor::builder()
            .schedule(schedule)
            .graceful_ramp_down(secs(5))
            .build();
        let scenario = Scenario::builder()
            .name("ramp")
            .action(pause_one_second)
            .build();
        let ctx = ctx();

        let stats = executor.exec(&scenario, &ctx).await.unwrap();
        let snapshot = ctx.registry.snapshot();

        assert_eq!(stats.vus_peak, 2);
        assert_eq!(stats.vus_aborted, 0);
        assert!(!stats.interrupted);
        assert_eq!(snapshot.value(builtin::CHECKS, Aggregation::Rate), Some(1.0));
        assert_eq!(snapshot.value(builtin::VUS_MAX, Aggregation::Max), Some(2.0));
        assert!(Threshold::parse(builtin::CHECKS, "rate>0.9")
            .unwrap()
            .evaluate(&snapshot)
            .passed);
    }

    #[tokio::test(start_paused = true)]
    async fn active_vus_follow_the_ramp() {
        let schedule = Schedule::new(
            0,
            vec![Stage::new(secs(10), 10), Stage::new(secs(10), 0)],
            RampPolicy::Linear,
        )
        .unwrap();
        let config = RampingVuExecutor::builder().schedule(schedule.clone()).build();
        let ctx = ctx();
        let mut controller = Controller::new(config, pause_one_second, ctx.clone());

        let start = Instant::now();
        for step in 0..200u64 {
            let elapsed = start.elapsed();
            controller.scale_to(schedule.vus_at(elapsed)).unwrap();
            let expected = schedule.target_at(elapsed);
            let active = controller.active() as f64;
            assert!(
                (active - expected).abs() <= 1.0,
                "step {step}: {active} active, target {expected}"
            );
            tokio::time::advance(Duration::from_millis(100)).await;
        }
        controller.shutdown().await;
        assert_eq!(ctx.status.active(), 0);
        assert!((9..=10).contains(&ctx.status.peak()));
    }

    #[tokio::test(start_paused = true)]
    async fn retires_newest_first_and_never_reuses_ids() {
        let schedule = Schedule::constant(3, secs(60)).unwrap();
        let config = RampingVuExecutor::builder().schedule(schedule).build();
        let mut controller = Controller::new(config, pause_one_second, ctx());

        controller.scale_to(3).unwrap();
        controller.scale_to(1).unwrap();
        assert_eq!(controller.active(), 1);
        assert_eq!(controller.draining(), 2);
        controller.scale_to(2).unwrap();

        assert_eq!(controller.active_ids(), vec![1, 4]);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn vu_churn_does_not_grow_the_registry() {
        let schedule = Schedule::constant(5, secs(3600)).unwrap();
        let config = RampingVuExecutor::builder().schedule(schedule).build();
        let ctx = ctx();
        let mut controller = Controller::new(config, pause_one_second, ctx.clone());

        for _ in 0..20 {
            controller.scale_to(5).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            controller.scale_to(0).unwrap();
            tokio::time::sleep(secs(2)).await;
            controller.reap();
            assert_eq!(controller.draining(), 0);
            assert_eq!(ctx.registry.shard_count(), 2);
        }
        controller.scale_to(3).unwrap();
        assert_eq!(ctx.registry.shard_count(), 5);
        controller.shutdown().await;

        assert_eq!(ctx.status.spawned(), 103);
        assert_eq!(ctx.registry.shard_count(), 2);
        let snapshot = ctx.registry.snapshot();
        assert_eq!(snapshot.value(builtin::CHECKS, Aggregation::Rate), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_vus_are_counted_once() {
        let schedule = Schedule::constant(2, secs(3600)).unwrap();
        let config = RampingVuExecutor::builder()
            .schedule(schedule)
            .graceful_ramp_down(secs(1))
            .graceful_stop(secs(1))
            .build();
        let ctx = ctx();
        let stuck = |_vu: Vu| async {
            tokio::time::sleep(secs(3600)).await;
            Ok::<_, IterationError>(())
        };
        let mut controller = Controller::new(config, stuck, ctx.clone());

        controller.scale_to(2).unwrap();
        controller.scale_to(0).unwrap();
        tokio::time::sleep(secs(2)).await;
        controller.reap();
        assert_eq!(ctx.status.aborted(), 2);
        controller.shutdown().await;

        assert_eq!(ctx.status.aborted(), 2);
        assert_eq!(controller.draining(), 0);
        assert_eq!(ctx.registry.shard_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reversed_think_time_range_is_rejected_before_spawning() {
        let executor = RampingVuExecutor::builder()
            .schedule(Schedule::constant(2, secs(10)).unwrap())
            .think_time(ThinkTime::uniform(secs(4), secs(2)))
            .build();
        let scenario = Scenario::builder()
            .name("reversed")
            .action(pause_one_second)
            .build();
        let ctx = ctx();

        let result = executor.exec(&scenario, &ctx).await;
        assert!(matches!(
            result,
            Err(RunError::Config(ConfigError::ThinkTime(_)))
        ));
        assert_eq!(ctx.status.spawned(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_spawning_and_drains() {
        let schedule = Schedule::constant(5, secs(3600)).unwrap();
        let executor = RampingVuExecutor::builder()
            .schedule(schedule)
            .graceful_stop(secs(2))
            .build();
        let scenario = Scenario::builder()
            .name("cancel")
            .action(pause_one_second)
            .build();
        let ctx = ctx();

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(secs(3)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let stats = executor.exec(&scenario, &ctx).await.unwrap();
        assert!(stats.interrupted);
        assert_eq!(stats.vus_spawned, 5);
        assert_eq!(stats.vus_aborted, 0);
        assert!(started.elapsed() < secs(3) + secs(2) + Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_vus_are_aborted_after_grace_period() {
        let schedule = Schedule::constant(2, secs(1)).unwrap();
        let executor = RampingVuExecutor::builder()
            .schedule(schedule)
            .graceful_stop(secs(1))
            .build();
        // Ignores the stop signal: a plain sleep, not `Vu::sleep`.
        let scenario = Scenario::builder()
            .name("stuck")
            .action(|_vu: Vu| async {
                tokio::time::sleep(secs(3600)).await;
                Ok::<_, IterationError>(())
            })
            .build();
        let ctx = ctx();

        let stats = executor.exec(&scenario, &ctx).await.unwrap();
        assert_eq!(stats.vus_aborted, 2);
        assert!(stats.duration <= secs(2) + Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_and_panicking_iterations_do_not_stop_the_vu() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let scenario = Scenario::builder()
            .name("flaky")
            .action(move |vu: Vu| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::Relaxed);
                    vu.sleep(secs(1)).await?;
                    match n % 3 {
                        0 => Ok(()),
                        1 => Err(IterationError::Failed("boom".into())),
                        _ => panic!("iteration {n} panicked"),
                    }
                }
            })
            .build();
        let executor = RampingVuExecutor::builder()
            .schedule(Schedule::constant(1, Duration::from_millis(6500)).unwrap())
            .build();
        let ctx = ctx();

        executor.exec(&scenario, &ctx).await.unwrap();
        let snapshot = ctx.registry.snapshot();

        assert!(calls.load(Ordering::Relaxed) >= 6);
        assert_eq!(snapshot.value(builtin::ITERATIONS, Aggregation::Count), Some(4.0));
        assert_eq!(snapshot.value(builtin::ITERATION_ERRORS, Aggregation::Count), Some(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn think_time_cycles_by_vu_id() {
        let schedule = Schedule::constant(2, Duration::from_millis(9500)).unwrap();
        let executor = RampingVuExecutor::builder()
            .schedule(schedule)
            .think_time(ThinkTime::cycle([secs(2), secs(3)]))
            .build();
        let scenario = Scenario::builder()
            .name("think")
            .action(|vu: Vu| async move {
                vu.recorder().add(&format!("iterations_vu{}", vu.id()), 1.0);
                Ok::<_, IterationError>(())
            })
            .build();
        let ctx = ctx();

        executor.exec(&scenario, &ctx).await.unwrap();
        let snapshot = ctx.registry.snapshot();
        // VU 1 pauses 3s (1 % 2 == 1), VU 2 pauses 2s.
        assert_eq!(snapshot.value("iterations_vu1", Aggregation::Count), Some(4.0));
        assert_eq!(snapshot.value("iterations_vu2", Aggregation::Count), Some(5.0));
    }
}
