//! Per-bot supervision: event consumption, fault detection and restarts.
//!
//! A supervisor task owns one bot's [`EventStream`] and forwards every event
//! to the live runtime. When the stream yields an error or ends, or a
//! (re)launch fails with a retriable error, it reports the fault, waits out an
//! exponential backoff and asks for a relaunch:
//!
//! ```text
//!             ┌──────────── relaunch ok ─────────────┐
//!             ▼                                       │
//!  ┌─────────────────┐  stream error/end  ┌──────────┴──────┐
//!  │ consume events  │───────────────────▶│ fault + backoff │──┐
//!  └─────────────────┘                    └─────────────────┘  │ budget spent or
//!                                                  ▲           │ not retriable
//!                                   relaunch failed└───────────┤
//!                                                              ▼
//!                                                     parked in Failed
//! ```
//!
//! The failure budget is a sliding window: more than `max_attempts` failures
//! within `window` parks the bot until an explicit `start` or `reload`. Running
//! for `healthy_after` without a fault clears the window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use fleet_core::{EventStream, InboundEvent, Phase};

use crate::error::LifecycleError;

// =============================================================================
// RestartPolicy
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub window: Duration,
    pub healthy_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            window: Duration::from_secs(300),
            healthy_after: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// Backoff before restart number `attempt` (1-based):
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Failure timestamps within the policy window.
#[derive(Debug)]
pub struct FailureWindow {
    window: Duration,
    max_attempts: u32,
    failures: VecDeque<Instant>,
}

impl FailureWindow {
    pub fn new(policy: &RestartPolicy) -> Self {
        Self {
            window: policy.window,
            max_attempts: policy.max_attempts,
            failures: VecDeque::new(),
        }
    }

    /// Records a failure at `now` and returns the restart attempt it earns,
    /// or `None` once the budget is spent.
    pub fn record(&mut self, now: Instant) -> Option<u32> {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) >= self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.push_back(now);

        let count = self.failures.len() as u32;
        (count <= self.max_attempts).then_some(count)
    }

    pub fn reset(&mut self) {
        self.failures.clear();
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// The orchestrator side of a supervisor.
#[async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    fn bot_id(&self) -> &str;

    /// Hands one event to the live runtime.
    fn dispatch(&self, event: InboundEvent);

    /// Records a fault. `retry_in` is the backoff before the next relaunch,
    /// or `None` when the supervisor gives up.
    async fn fault(&self, error: LifecycleError, retry_in: Option<Duration>);

    /// Builds a fresh runtime and reconnects. A `Cancelled` error ends
    /// supervision silently.
    async fn relaunch(&self) -> Result<EventStream, LifecycleError>;
}

/// Handle to a running supervisor task.
#[derive(Debug)]
pub struct SupervisorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    #[cfg(test)]
    pub(crate) fn from_task(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { cancel, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the task and waits up to `grace` for it, aborting it after
    /// that. Returns `false` if it had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                task.abort();
                warn!(grace_ms = grace.as_millis() as u64, "Supervisor did not stop in time, aborted");
                false
            }
        }
    }
}

/// Starts supervising. `initial` is the outcome of the first launch: a
/// stream to consume, or the error it failed with.
pub fn spawn<L: Lifecycle>(
    lifecycle: Arc<L>,
    policy: RestartPolicy,
    initial: Result<EventStream, LifecycleError>,
    cancel: CancellationToken,
) -> SupervisorHandle {
    let span = info_span!("supervisor", bot_id = %lifecycle.bot_id());
    let task = tokio::spawn(supervise(lifecycle, policy, initial, cancel.clone()).instrument(span));
    SupervisorHandle { cancel, task }
}

enum Step {
    Consume(EventStream),
    Fault(LifecycleError),
}

async fn supervise<L: Lifecycle>(
    lifecycle: Arc<L>,
    policy: RestartPolicy,
    initial: Result<EventStream, LifecycleError>,
    cancel: CancellationToken,
) {
    let mut window = FailureWindow::new(&policy);
    let mut step = match initial {
        Ok(stream) => Step::Consume(stream),
        Err(e) => Step::Fault(e),
    };

    loop {
        step = match step {
            Step::Consume(stream) => {
                match consume(&*lifecycle, stream, &policy, &mut window, &cancel).await {
                    Some(error) => Step::Fault(error),
                    None => break,
                }
            }
            Step::Fault(error) => {
                let attempt = if error.is_retriable() {
                    window.record(Instant::now())
                } else {
                    None
                };

                let Some(attempt) = attempt else {
                    warn!(error = %error, failures = window.len(), "Giving up on bot");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = lifecycle.fault(error, None) => {}
                    }
                    break;
                };

                let delay = policy.delay_for(attempt);
                warn!(error = %error, attempt, delay_ms = delay.as_millis() as u64, "Bot faulted, scheduling restart");
                let proceed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    _ = async {
                        lifecycle.fault(error, Some(delay)).await;
                        tokio::time::sleep(delay).await;
                    } => true,
                };
                if !proceed {
                    break;
                }

                let relaunched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = lifecycle.relaunch() => result,
                };
                match relaunched {
                    Ok(stream) => {
                        info!(attempt, "Bot restarted");
                        Step::Consume(stream)
                    }
                    Err(LifecycleError::Cancelled { .. }) => break,
                    Err(e) => Step::Fault(e),
                }
            }
        };
    }
    debug!("Supervisor finished");
}

/// Forwards events until the stream fails (`Some`) or supervision is
/// cancelled (`None`).
async fn consume<L: Lifecycle>(
    lifecycle: &L,
    mut stream: EventStream,
    policy: &RestartPolicy,
    window: &mut FailureWindow,
    cancel: &CancellationToken,
) -> Option<LifecycleError> {
    let healthy = tokio::time::sleep(policy.healthy_after);
    tokio::pin!(healthy);
    let mut recovering = !window.is_empty();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = &mut healthy, if recovering => {
                info!(failures = window.len(), "Bot healthy again, failure budget reset");
                window.reset();
                recovering = false;
            }
            next = stream.next() => match next {
                Some(Ok(event)) => lifecycle.dispatch(event),
                Some(Err(e)) => {
                    return Some(LifecycleError::runtime(lifecycle.bot_id(), Phase::Runtime, e));
                }
                None => {
                    return Some(LifecycleError::runtime(
                        lifecycle.bot_id(),
                        Phase::Runtime,
                        "event stream ended",
                    ));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;
    use parking_lot::Mutex;

    use super::*;
    use fleet_core::{ClientError, ErrorKind};

    fn policy() -> RestartPolicy {
        RestartPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts: 5,
            window: Duration::from_secs(3600),
            healthy_after: Duration::from_secs(10),
        }
    }

    fn build_error() -> LifecycleError {
        LifecycleError::Build {
            bot_id: "bot".into(),
            phase: Phase::Start,
            message: "plugin refused to load".into(),
        }
    }

    fn event() -> InboundEvent {
        InboundEvent::message("bot", "u1", "c1", "hi")
    }

    type Relaunch = Box<dyn Fn(usize) -> Result<EventStream, LifecycleError> + Send + Sync>;

    struct FakeLifecycle {
        relaunch: Relaunch,
        relaunches: AtomicUsize,
        dispatched: AtomicUsize,
        faults: Mutex<Vec<(ErrorKind, Option<Duration>)>>,
    }

    impl FakeLifecycle {
        fn new(relaunch: impl Fn(usize) -> Result<EventStream, LifecycleError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                relaunch: Box::new(relaunch),
                relaunches: AtomicUsize::new(0),
                dispatched: AtomicUsize::new(0),
                faults: Mutex::new(Vec::new()),
            })
        }

        fn delays(&self) -> Vec<Option<Duration>> {
            self.faults.lock().iter().map(|(_, d)| *d).collect()
        }
    }

    #[async_trait]
    impl Lifecycle for FakeLifecycle {
        fn bot_id(&self) -> &str {
            "bot"
        }

        fn dispatch(&self, _event: InboundEvent) {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
        }

        async fn fault(&self, error: LifecycleError, retry_in: Option<Duration>) {
            self.faults.lock().push((error.kind(), retry_in));
        }

        async fn relaunch(&self) -> Result<EventStream, LifecycleError> {
            let n = self.relaunches.fetch_add(1, Ordering::SeqCst) + 1;
            (self.relaunch)(n)
        }
    }

    async fn wait_finished(handle: &SupervisorHandle) {
        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(400));
        assert_eq!(policy.delay_for(80), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_window_slides() {
        let mut window = FailureWindow::new(&RestartPolicy {
            max_attempts: 2,
            window: Duration::from_secs(10),
            ..policy()
        });
        let t0 = Instant::now();
        assert_eq!(window.record(t0), Some(1));
        assert_eq!(window.record(t0 + Duration::from_secs(1)), Some(2));
        assert_eq!(window.record(t0 + Duration::from_secs(2)), None);
        // The first two fell out of the window.
        assert_eq!(window.record(t0 + Duration::from_secs(12)), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_start_backs_off_then_gives_up() {
        let fake = FakeLifecycle::new(|_| Err(build_error()));
        let handle = spawn(Arc::clone(&fake), policy(), Err(build_error()), CancellationToken::new());
        wait_finished(&handle).await;

        let ms = Duration::from_millis;
        assert_eq!(
            fake.delays(),
            [Some(ms(100)), Some(ms(200)), Some(ms(400)), Some(ms(400)), Some(ms(400)), None]
        );
        assert_eq!(fake.relaunches.load(Ordering::SeqCst), 5);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fake.relaunches.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_is_not_retried() {
        let fake = FakeLifecycle::new(|_| Err(build_error()));
        let error = LifecycleError::configuration("bot", Phase::Start, "plugin cycle");
        let handle = spawn(Arc::clone(&fake), policy(), Err(error), CancellationToken::new());
        wait_finished(&handle).await;

        assert_eq!(*fake.faults.lock(), [(ErrorKind::Configuration, None)]);
        assert_eq!(fake.relaunches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_failure_relaunches_and_keeps_dispatching() {
        let fake = FakeLifecycle::new(|n| {
            if n == 1 {
                Ok(stream::iter([Ok(event()), Ok(event())]).chain(stream::pending()).boxed())
            } else {
                Err(build_error())
            }
        });
        let initial: EventStream = stream::iter([
            Ok(event()),
            Err(ClientError::Stream("connection reset".into())),
        ])
        .boxed();
        let handle = spawn(Arc::clone(&fake), policy(), Ok(initial), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fake.dispatched.load(Ordering::SeqCst), 3);
        assert_eq!(*fake.faults.lock(), [(ErrorKind::Runtime, Some(Duration::from_millis(100)))]);
        assert!(!handle.is_finished());

        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_run_resets_budget() {
        // Each stream runs for 20s, longer than `healthy_after`, then ends.
        let run_then_end = || -> EventStream {
            stream::once(tokio::time::sleep(Duration::from_secs(20)))
                .filter_map(|_| async { None })
                .boxed()
        };
        let fake = FakeLifecycle::new(move |_| Ok(run_then_end()));
        let policy = RestartPolicy {
            max_attempts: 1,
            ..policy()
        };
        let handle = spawn(Arc::clone(&fake), policy, Ok(run_then_end()), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(fake.relaunches.load(Ordering::SeqCst) >= 3);
        assert!(fake.delays().iter().all(|d| *d == Some(Duration::from_millis(100))));
        assert!(!handle.is_finished());
        assert!(handle.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_without_relaunch() {
        let fake = FakeLifecycle::new(|_| Err(build_error()));
        let policy = RestartPolicy {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            ..policy()
        };
        let handle = spawn(Arc::clone(&fake), policy, Err(build_error()), CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.shutdown(Duration::from_secs(1)).await);
        assert_eq!(fake.relaunches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_task_ignoring_cancellation() {
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let abort = task.abort_handle();
        let handle = SupervisorHandle::from_task(CancellationToken::new(), task);

        assert!(!handle.shutdown(Duration::from_secs(1)).await);
        for _ in 0..10 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(abort.is_finished());
    }
}
