//! The per-source poll loop.
//!
//! Lifecycle: `Connecting -> Running <-> Degraded`, with `Cancelled` as the
//! only terminal state. Non-transport sources pass through `Connecting`
//! without doing anything. A transient failure degrades the loop for one
//! full interval; transport-backed loops then reconnect from scratch while
//! the others resume polling directly. Fatal errors exit the loop through
//! `Err` and are the supervisor's problem.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::StatusCache;

use super::{PollError, PollWork, SourceSpec, TransportSession, local};

/// Floor for the end-of-cycle delay so a cycle that overruns its interval
/// can never turn the loop into a busy spin.
pub const MIN_CYCLE_DELAY: Duration = Duration::from_millis(50);

/// Poll loop states. `Cancelled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Connecting,
    Running,
    Degraded,
    Cancelled,
}

/// Drives one source: polls at the configured cadence, owns the remote
/// session if the work needs one, and writes every outcome to the shared
/// cache. Consumed by [`PollLoop::run`].
pub struct PollLoop {
    key: String,
    work: PollWork,
    interval: Duration,
    timeout: Duration,
    cache: Arc<StatusCache>,
    token: CancellationToken,
}

impl PollLoop {
    pub fn new(spec: SourceSpec, cache: Arc<StatusCache>, token: CancellationToken) -> Self {
        Self {
            key: spec.key,
            work: spec.work,
            interval: spec.interval,
            timeout: spec.timeout,
            cache,
            token,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// End-of-cycle delay: the wall-clock interval minus the time the cycle
    /// already spent working, floored by [`MIN_CYCLE_DELAY`].
    fn cadence_delay(interval: Duration, elapsed: Duration) -> Duration {
        interval.saturating_sub(elapsed).max(MIN_CYCLE_DELAY)
    }

    /// Run until cancelled (`Ok`) or until a fatal error (`Err`).
    ///
    /// Cache writes are atomic with respect to cancellation: a cycle whose
    /// future is dropped mid-flight writes nothing at all.
    pub async fn run(self) -> Result<(), PollError> {
        let token = self.token.clone();
        let mut session: Option<Box<dyn TransportSession>> = None;
        let mut state = LoopState::Connecting;
        info!("source '{}' ({}) poll loop starting", self.key, self.work.kind_name());

        loop {
            if token.is_cancelled() {
                state = LoopState::Cancelled;
            }
            match state {
                LoopState::Cancelled => {
                    if let Some(mut open) = session.take() {
                        open.close().await;
                    }
                    info!("source '{}' poll loop stopped", self.key);
                    return Ok(());
                }
                LoopState::Connecting => {
                    let PollWork::Remote { transport, .. } = &self.work else {
                        state = LoopState::Running;
                        continue;
                    };
                    let connected = tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            state = LoopState::Cancelled;
                            continue;
                        }
                        connected = transport.connect() => connected,
                    };
                    match connected {
                        Ok(open) => {
                            debug!("source '{}' session established", self.key);
                            session = Some(open);
                            state = LoopState::Running;
                        }
                        Err(err) if err.is_fatal() => return self.bail(err),
                        Err(err) => {
                            warn!("source '{}' connect failed: {}", self.key, err);
                            self.cache.update_failure(&self.key, err.message());
                            state = LoopState::Degraded;
                        }
                    }
                }
                LoopState::Running => {
                    let cycle_started = Instant::now();
                    let outcome = tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            state = LoopState::Cancelled;
                            continue;
                        }
                        outcome = self.run_cycle(&mut session) => outcome,
                    };
                    match outcome {
                        Ok(()) => {
                            let delay = Self::cadence_delay(self.interval, cycle_started.elapsed());
                            tokio::select! {
                                biased;
                                _ = token.cancelled() => state = LoopState::Cancelled,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        Err(err) if err.is_fatal() => return self.bail(err),
                        Err(err) => {
                            warn!("source '{}' poll failed: {}", self.key, err);
                            self.cache.update_failure(&self.key, err.message());
                            state = LoopState::Degraded;
                        }
                    }
                }
                LoopState::Degraded => {
                    if let Some(mut open) = session.take() {
                        open.close().await;
                    }
                    debug!("source '{}' degraded; retrying in {:?}", self.key, self.interval);
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => state = LoopState::Cancelled,
                        _ = tokio::time::sleep(self.interval) => {
                            state = if self.work.is_transport() {
                                LoopState::Connecting
                            } else {
                                LoopState::Running
                            };
                        }
                    }
                }
            }
        }
    }

    /// One running cycle: execute the work under the cycle timeout, decode,
    /// and write the success record. Failure handling stays in `run`.
    async fn run_cycle(
        &self,
        session: &mut Option<Box<dyn TransportSession>>,
    ) -> Result<(), PollError> {
        let payload = match &self.work {
            PollWork::Local { bundle, decoder } => {
                let raw = self.bounded(local::run_shell(&bundle.compose())).await?;
                decoder.decode(&bundle.split_output(&raw)?)?
            }
            PollWork::Remote { bundle, decoder, .. } => {
                let open = session
                    .as_mut()
                    .ok_or_else(|| PollError::transient("remote session not established"))?;
                let raw = self.bounded(open.run(&bundle.compose())).await?;
                decoder.decode(&bundle.split_output(&raw)?)?
            }
            PollWork::Function { task } => self.bounded(task.run()).await?,
        };
        self.cache.update_success(&self.key, payload);
        Ok(())
    }

    /// Bound one unit of work by the cycle timeout.
    async fn bounded<F>(&self, work: F) -> Result<String, PollError>
    where
        F: Future<Output = Result<String, PollError>>,
    {
        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(PollError::transient(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// The only fatal exit: record the failure so readers see it, log
    /// loudly, and hand the error to the supervisor.
    fn bail(&self, err: PollError) -> Result<(), PollError> {
        error!("source '{}' poll loop terminating: {}", self.key, err);
        self.cache.update_failure(&self.key, err.message());
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{DecodeError, SourceDecoder, SourceSpec, SourceTask, Transport};
    use async_trait::async_trait;
    use bundle_codec::{CommandBundle, SectionMap};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Task whose outcomes follow a script; the last entry repeats forever.
    struct ScriptedTask {
        script: Mutex<VecDeque<Result<String, PollError>>>,
        calls: AtomicUsize,
        stamps: Mutex<Vec<Instant>>,
        delay: Duration,
    }

    impl ScriptedTask {
        fn new(script: Vec<Result<String, PollError>>) -> Arc<Self> {
            Self::with_delay(script, Duration::ZERO)
        }

        fn ok(payload: &str) -> Arc<Self> {
            Self::new(vec![Ok(payload.to_owned())])
        }

        fn with_delay(script: Vec<Result<String, PollError>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                stamps: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn stamps(&self) -> Vec<Instant> {
            self.stamps.lock().clone()
        }
    }

    #[async_trait]
    impl SourceTask for ScriptedTask {
        async fn run(&self) -> Result<String, PollError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.stamps.lock().push(Instant::now());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock();
            match script.len() {
                0 => Err(PollError::transient("script exhausted")),
                1 => script.front().cloned().unwrap(),
                _ => script.pop_front().unwrap(),
            }
        }
    }

    /// Session whose command outputs follow a script; last entry repeats.
    struct ScriptedSession {
        outputs: VecDeque<Result<String, PollError>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TransportSession for ScriptedSession {
        async fn run(&mut self, _command: &str) -> Result<String, PollError> {
            match self.outputs.len() {
                0 => Err(PollError::transient("script exhausted")),
                1 => self.outputs.front().cloned().unwrap(),
                _ => self.outputs.pop_front().unwrap(),
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedTransport {
        sessions: Mutex<VecDeque<Result<ScriptedSession, PollError>>>,
        attempts: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(sessions: Vec<Result<ScriptedSession, PollError>>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                attempts: AtomicUsize::new(0),
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> Result<Box<dyn TransportSession>, PollError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().pop_front() {
                Some(Ok(session)) => Ok(Box::new(session)),
                Some(Err(err)) => Err(err),
                None => Err(PollError::transient("no scripted sessions left")),
            }
        }
    }

    /// Decoder that returns section `A` verbatim.
    struct SectionDecoder;

    impl SourceDecoder for SectionDecoder {
        fn decode(&self, sections: &SectionMap) -> Result<String, DecodeError> {
            sections
                .get("A")
                .cloned()
                .ok_or_else(|| DecodeError::new("missing section A"))
        }
    }

    fn marker_wrapped(body: &str) -> String {
        format!("<START A>\n{body}\n<END A>\n")
    }

    fn function_spec(key: &str, task: Arc<ScriptedTask>, interval: Duration) -> SourceSpec {
        SourceSpec::new(key, PollWork::Function { task }, interval, Duration::from_secs(1))
    }

    fn spawn_loop(
        spec: SourceSpec,
        cache: &Arc<StatusCache>,
        token: &CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), PollError>> {
        tokio::spawn(PollLoop::new(spec, cache.clone(), token.clone()).run())
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_record(
        cache: &StatusCache,
        key: &str,
        accept: impl Fn(&crate::cache::StatusRecord) -> bool,
    ) -> crate::cache::StatusRecord {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let record = cache.get(key);
            if accept(&record) {
                return record;
            }
            assert!(
                Instant::now() < deadline,
                "record for '{key}' never matched; last: {record:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn function_success_lands_in_cache() {
        let cache = Arc::new(StatusCache::new());
        let task = ScriptedTask::ok("all good");
        let token = CancellationToken::new();
        let handle = spawn_loop(
            function_spec("src", task.clone(), Duration::from_millis(20)),
            &cache,
            &token,
        );

        let record = wait_for_record(&cache, "src", |r| r.is_success).await;

        assert_eq!(record.payload, "all good");
        assert!(record.comment.is_empty());
        assert!(record.observed_at.is_some());

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn timeouts_degrade_and_observations_keep_advancing() {
        let cache = Arc::new(StatusCache::new());
        // Sleeps far past the cycle timeout, so every cycle times out.
        let task = ScriptedTask::with_delay(vec![Ok("late".to_owned())], Duration::from_secs(60));
        let token = CancellationToken::new();
        let spec = SourceSpec::new(
            "src",
            PollWork::Function { task: task.clone() },
            Duration::from_millis(25),
            Duration::from_millis(10),
        );
        let handle = spawn_loop(spec, &cache, &token);

        let first = wait_for_record(&cache, "src", |r| r.observed_at.is_some()).await;
        let second = wait_for_record(&cache, "src", |r| r.observed_at > first.observed_at).await;
        let third = wait_for_record(&cache, "src", |r| r.observed_at > second.observed_at).await;

        assert!(!third.is_success);
        assert!(third.payload.is_empty());
        assert!(third.comment.contains("timed out"), "{}", third.comment);
        assert!(task.calls() >= 3);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failures_keep_the_last_good_payload() {
        let cache = Arc::new(StatusCache::new());
        let task = ScriptedTask::new(vec![
            Ok("OK:42".to_owned()),
            Err(PollError::transient("boom 1")),
            Err(PollError::transient("boom 2")),
        ]);
        let token = CancellationToken::new();
        let handle = spawn_loop(
            function_spec("src", task.clone(), Duration::from_millis(10)),
            &cache,
            &token,
        );

        let record =
            wait_for_record(&cache, "src", |r| r.comment.contains("boom 2")).await;

        assert!(!record.is_success);
        assert_eq!(record.payload, "OK:42");

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_writes_immediately() {
        let cache = Arc::new(StatusCache::new());
        let task = ScriptedTask::ok("tick");
        let token = CancellationToken::new();
        let handle = spawn_loop(
            function_spec("src", task.clone(), Duration::from_secs(600)),
            &cache,
            &token,
        );

        let before = wait_for_record(&cache, "src", |r| r.is_success).await;
        token.cancel();
        handle.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.get("src"), before);
        assert_eq!(task.calls(), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_exits_before_any_cycle() {
        let cache = Arc::new(StatusCache::new());
        let task = ScriptedTask::ok("never");
        let token = CancellationToken::new();
        token.cancel();
        let handle = spawn_loop(
            function_spec("src", task.clone(), Duration::from_millis(10)),
            &cache,
            &token,
        );

        handle.await.unwrap().unwrap();

        assert_eq!(task.calls(), 0);
        assert!(cache.get("src").observed_at.is_none());
    }

    #[tokio::test]
    async fn cycle_starts_respect_the_interval() {
        let cache = Arc::new(StatusCache::new());
        let task = ScriptedTask::ok("tick");
        let interval = Duration::from_millis(80);
        let token = CancellationToken::new();
        let handle = spawn_loop(function_spec("src", task.clone(), interval), &cache, &token);

        wait_until(|| task.calls() >= 4).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        let stamps = task.stamps();
        for pair in stamps.windows(2) {
            let spacing = pair[1] - pair[0];
            assert!(spacing >= interval, "cycle spacing {spacing:?} under the interval");
        }
    }

    #[tokio::test]
    async fn slow_cycles_still_get_the_floor_delay() {
        let cache = Arc::new(StatusCache::new());
        let work_time = Duration::from_millis(30);
        // Interval shorter than the work itself: the floor must keep the
        // loop from spinning.
        let task = ScriptedTask::with_delay(vec![Ok("slow".to_owned())], work_time);
        let token = CancellationToken::new();
        let handle = spawn_loop(
            function_spec("src", task.clone(), Duration::from_millis(1)),
            &cache,
            &token,
        );

        wait_until(|| task.calls() >= 3).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        let floor = work_time + MIN_CYCLE_DELAY;
        for pair in task.stamps().windows(2) {
            let spacing = pair[1] - pair[0];
            assert!(spacing >= floor, "cycle spacing {spacing:?} under the floor");
        }
    }

    #[tokio::test]
    async fn fatal_errors_end_the_loop_and_mark_the_cache() {
        let cache = Arc::new(StatusCache::new());
        let task = ScriptedTask::new(vec![Err(PollError::fatal("id collision"))]);
        let token = CancellationToken::new();
        let handle = spawn_loop(
            function_spec("src", task.clone(), Duration::from_millis(10)),
            &cache,
            &token,
        );

        let err = handle.await.unwrap().unwrap_err();

        assert!(err.is_fatal());
        assert!(err.message().contains("id collision"));
        let record = cache.get("src");
        assert!(!record.is_success);
        assert!(record.comment.contains("id collision"));
        assert_eq!(task.calls(), 1);
    }

    #[tokio::test]
    async fn remote_loops_reconnect_after_session_errors() {
        let cache = Arc::new(StatusCache::new());
        let closed_first = Arc::new(AtomicBool::new(false));
        let transport = ScriptedTransport::new(vec![
            Ok(ScriptedSession {
                outputs: VecDeque::from(vec![
                    Ok(marker_wrapped("sample one")),
                    Err(PollError::transient("connection lost")),
                ]),
                closed: closed_first.clone(),
            }),
            Ok(ScriptedSession {
                outputs: VecDeque::from(vec![Ok(marker_wrapped("sample two"))]),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        ]);
        let token = CancellationToken::new();
        let spec = SourceSpec::new(
            "db15",
            PollWork::Remote {
                transport: transport.clone(),
                bundle: CommandBundle::new().with("A", "probe"),
                decoder: Arc::new(SectionDecoder),
            },
            Duration::from_millis(20),
            Duration::from_secs(1),
        );
        let handle = spawn_loop(spec, &cache, &token);

        let record =
            wait_for_record(&cache, "db15", |r| r.payload.contains("sample two")).await;

        assert!(record.is_success);
        assert_eq!(transport.attempts(), 2);
        assert!(closed_first.load(Ordering::SeqCst));

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn remote_connect_failures_retry_at_the_cadence() {
        let cache = Arc::new(StatusCache::new());
        let transport = ScriptedTransport::new(vec![
            Err(PollError::transient("connection refused")),
            Err(PollError::transient("connection refused")),
            Ok(ScriptedSession {
                outputs: VecDeque::from(vec![Ok(marker_wrapped("up"))]),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        ]);
        let token = CancellationToken::new();
        let spec = SourceSpec::new(
            "db15",
            PollWork::Remote {
                transport: transport.clone(),
                bundle: CommandBundle::new().with("A", "probe"),
                decoder: Arc::new(SectionDecoder),
            },
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        let handle = spawn_loop(spec, &cache, &token);

        let failed =
            wait_for_record(&cache, "db15", |r| r.comment.contains("connection refused")).await;
        assert!(!failed.is_success);

        let record = wait_for_record(&cache, "db15", |r| r.is_success).await;
        assert_eq!(record.payload, "up");
        assert_eq!(transport.attempts(), 3);

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn undecodable_remote_output_degrades_without_reusing_the_session() {
        let cache = Arc::new(StatusCache::new());
        let closed_first = Arc::new(AtomicBool::new(false));
        let transport = ScriptedTransport::new(vec![
            Ok(ScriptedSession {
                // No markers at all, as if the remote shell printed a motd
                // and died.
                outputs: VecDeque::from(vec![Ok("login banner only".to_owned())]),
                closed: closed_first.clone(),
            }),
            Ok(ScriptedSession {
                outputs: VecDeque::from(vec![Ok(marker_wrapped("recovered"))]),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        ]);
        let token = CancellationToken::new();
        let spec = SourceSpec::new(
            "db15",
            PollWork::Remote {
                transport: transport.clone(),
                bundle: CommandBundle::new().with("A", "probe"),
                decoder: Arc::new(SectionDecoder),
            },
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        let handle = spawn_loop(spec, &cache, &token);

        let record = wait_for_record(&cache, "db15", |r| r.is_success).await;

        assert_eq!(record.payload, "recovered");
        assert_eq!(transport.attempts(), 2);
        assert!(closed_first.load(Ordering::SeqCst));

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
