//! Progress Event Bridge - lifecycle event を 1 run 分の SSE progress stream に変換する
//!
//! # 構成
//! - listener: 専用の `std::thread`。broker の blocking consume を回し、bounded mpsc に流す
//! - stream: async 側。mpsc を待ちつつ keep-alive / timeout / grace を駆動する
//!
//! # 状態遷移
//! `Connecting → Streaming → {Done | Timeout | Error}`
//!
//! `Streaming` に入るのは listener が購読を確立したと通知してから（固定 sleep は使わない）。
//! 終端 frame（completed / failed / timeout）は必ず 1 回だけ、最後に出ます。

pub mod cache;
pub mod correlation;
pub mod frame;
pub mod payload;
pub mod progress;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use self::cache::FrameCache;
use self::correlation::{Attribution, Correlator};
use self::progress::{ProgressTracker, ProgressUpdate};
use crate::config::BridgeConfig;
use crate::domain::{BridgeError, EventPayload, RunId, StageEvent, StageEventType};
use crate::ports::EventSource;

pub use self::frame::Frame;
pub use self::payload::{DecodeLayer, Decoded, decode_result};
pub use self::progress::ProgressStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Streaming,
    Done,
    Timeout,
    Error,
}

impl BridgeState {
    pub fn as_str(self) -> &'static str {
        match self {
            BridgeState::Connecting => "connecting",
            BridgeState::Streaming => "streaming",
            BridgeState::Done => "done",
            BridgeState::Timeout => "timeout",
            BridgeState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BridgeState::Done | BridgeState::Timeout | BridgeState::Error)
    }
}

type Listened = Result<StageEvent, BridgeError>;

pub struct ProgressBridge {
    events: Arc<dyn EventSource>,
    cache: Arc<FrameCache>,
    config: BridgeConfig,
}

impl ProgressBridge {
    pub fn new(events: Arc<dyn EventSource>, config: BridgeConfig) -> Self {
        Self {
            events,
            cache: Arc::new(FrameCache::new(config.replay_ttl)),
            config,
        }
    }

    pub fn cache(&self) -> Arc<FrameCache> {
        Arc::clone(&self.cache)
    }

    /// Open a stream for `run_id`. With `last_event_id`, cached frames newer than it
    /// are replayed first.
    pub fn open(&self, run_id: RunId, last_event_id: Option<u64>) -> ProgressStream {
        let deadline = Instant::now() + self.config.stream_timeout;
        let mut stream = ProgressStream {
            run_id,
            state: BridgeState::Connecting,
            config: self.config.clone(),
            cache: Arc::clone(&self.cache),
            pending: VecDeque::new(),
            listener: None,
            cancel: Arc::new(AtomicBool::new(false)),
            correlator: Correlator::new(run_id),
            tracker: ProgressTracker::new(),
            deadline,
            result_deadline: None,
            last_frame_at: Instant::now(),
            last_progress: 0,
            next_id: self.cache.last_id(run_id) + 1,
            resumed: last_event_id.is_some(),
        };

        if let Some(last) = last_event_id {
            for cached in self.cache.delivered(run_id, last) {
                stream.restore(cached.update.as_ref());
            }
            for cached in self.cache.replay_after(run_id, last) {
                stream.restore(cached.update.as_ref());
                let terminal = cached.frame.is_terminal();
                stream.pending.push_back(cached.frame);
                if terminal {
                    debug!(%run_id, last, "replay reached the terminal frame");
                    stream.state = BridgeState::Done;
                    return stream;
                }
            }
        }

        stream.listener = Some(spawn_listener(
            Arc::clone(&self.events),
            run_id,
            &self.config,
            Arc::clone(&stream.cancel),
        ));
        stream
    }
}

struct ListenerHandle {
    ready: Option<oneshot::Receiver<Result<(), BridgeError>>>,
    events: mpsc::Receiver<Listened>,
}

fn spawn_listener(
    source: Arc<dyn EventSource>,
    run_id: RunId,
    config: &BridgeConfig,
    cancel: Arc<AtomicBool>,
) -> ListenerHandle {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let poll = config.poll_interval;

    let spawned = std::thread::Builder::new()
        .name(format!("progress-{run_id}"))
        .spawn(move || listen(source, run_id, poll, cancel, ready_tx, tx));
    if let Err(e) = spawned {
        // ready_tx は closure ごと drop 済みなので stream 側は ListenerFailed になる
        warn!(%run_id, error = %e, "could not start listener thread");
    }

    ListenerHandle {
        ready: Some(ready_rx),
        events: rx,
    }
}

/// Runs on the listener thread.
fn listen(
    source: Arc<dyn EventSource>,
    run_id: RunId,
    poll: Duration,
    cancel: Arc<AtomicBool>,
    ready_tx: oneshot::Sender<Result<(), BridgeError>>,
    tx: mpsc::Sender<Listened>,
) {
    let mut consumer = match source.subscribe() {
        Ok(consumer) => consumer,
        Err(e) => {
            let _ = ready_tx.send(Err(BridgeError::ListenerFailed(e.to_string())));
            return;
        }
    };
    if ready_tx.send(Ok(())).is_err() {
        return;
    }
    debug!(%run_id, "listener bound");

    // 実行中の blocking read は最大 1 回分だけ cancel を追い越す
    while !cancel.load(Ordering::SeqCst) && !tx.is_closed() {
        match consumer.next_event(poll) {
            Ok(Some(event)) => {
                if tx.blocking_send(Ok(event)).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.blocking_send(Err(BridgeError::ListenerFailed(e.to_string())));
                break;
            }
        }
    }
    debug!(%run_id, "listener stopped");
}

/// One client's view of one run.
pub struct ProgressStream {
    run_id: RunId,
    state: BridgeState,
    config: BridgeConfig,
    cache: Arc<FrameCache>,
    pending: VecDeque<Frame>,
    listener: Option<ListenerHandle>,
    cancel: Arc<AtomicBool>,
    correlator: Correlator,
    tracker: ProgressTracker,
    deadline: Instant,
    result_deadline: Option<Instant>,
    /// Last time anything was queued for the client, keep-alives included.
    last_frame_at: Instant,
    last_progress: u8,
    next_id: u64,
    resumed: bool,
}

impl ProgressStream {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Next frame, or `None` once the terminal frame has been handed out.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            match self.state {
                BridgeState::Connecting => self.connect().await,
                BridgeState::Streaming => self.pump().await,
                BridgeState::Done | BridgeState::Timeout | BridgeState::Error => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Frame> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let frame = stream.next_frame().await?;
            Some((frame, stream))
        })
    }

    async fn connect(&mut self) {
        let Some(ready) = self.listener.as_mut().and_then(|l| l.ready.take()) else {
            self.fail_stream(BridgeError::ListenerFailed("listener missing".into()));
            return;
        };
        let wait = self.config.ready_timeout.min(self.deadline.saturating_duration_since(Instant::now()));

        match tokio::time::timeout(wait, ready).await {
            Ok(Ok(Ok(()))) => {
                self.state = BridgeState::Streaming;
                info!(run_id = %self.run_id, resumed = self.resumed, "progress stream connected");
                if !self.resumed {
                    let id = self.take_id();
                    self.push(Frame::connected(id, self.run_id), None);
                }
            }
            Ok(Ok(Err(e))) => self.fail_stream(e),
            Ok(Err(_)) => self.fail_stream(BridgeError::ListenerFailed(
                "listener exited before binding".into(),
            )),
            Err(_) => self.fail_stream(BridgeError::NotReady(self.config.ready_timeout)),
        }
    }

    async fn pump(&mut self) {
        let now = Instant::now();
        if now >= self.deadline {
            self.time_out();
            return;
        }
        if let Some(grace) = self.result_deadline
            && now >= grace
        {
            warn!(run_id = %self.run_id, "final result did not arrive in time");
            let updates = self.tracker.on_result(None);
            self.apply(updates);
            return;
        }

        // 他 run の event が流れ続けても keep-alive は止めない
        let keepalive_at = self.last_frame_at + self.config.keepalive_interval;
        if now >= keepalive_at {
            self.pending.push_back(Frame::KeepAlive);
            self.last_frame_at = now;
            return;
        }

        let mut wake = keepalive_at.min(self.deadline);
        if let Some(grace) = self.result_deadline {
            wake = wake.min(grace);
        }

        let Some(listener) = self.listener.as_mut() else {
            self.fail_stream(BridgeError::ListenerFailed("listener missing".into()));
            return;
        };
        match tokio::time::timeout_at(wake, listener.events.recv()).await {
            Ok(Some(Ok(event))) => self.on_event(event),
            Ok(Some(Err(e))) => self.fail_stream(e),
            Ok(None) => self.fail_stream(BridgeError::ListenerFailed("event channel closed".into())),
            // 次の pump で keep-alive / deadline / grace を判定する
            Err(_) => {}
        }
    }

    fn on_event(&mut self, event: StageEvent) {
        let stage = match self.correlator.attribute(&event) {
            Ok(Attribution::Matched(stage)) => stage,
            Ok(Attribution::Foreign) => return,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "dropping event");
                return;
            }
        };

        let updates = match event.event_type {
            StageEventType::Started => self.tracker.on_started(stage),
            StageEventType::Succeeded => {
                let updates = self.tracker.on_succeeded(stage);
                if self.tracker.awaiting_result() && self.result_deadline.is_none() {
                    self.result_deadline = Some(Instant::now() + self.config.result_grace);
                }
                updates
            }
            StageEventType::Result => {
                let result = decode_result(event.payload.as_ref()).map(|d| d.value);
                self.tracker.on_result(result)
            }
            StageEventType::Failed => self.tracker.on_failed(stage, failure_text(event.payload.as_ref())),
            StageEventType::Sent | StageEventType::Received => Vec::new(),
        };
        self.apply(updates);
    }

    fn apply(&mut self, updates: Vec<ProgressUpdate>) {
        for update in updates {
            let id = self.take_id();
            let frame = Frame::progress(id, self.run_id, &update);
            self.last_progress = self.last_progress.max(update.progress);
            let terminal = frame.is_terminal();
            let failed = update.status == ProgressStatus::Failed;
            self.push(frame, Some(update));
            if terminal {
                self.finish(if failed { BridgeState::Error } else { BridgeState::Done });
                return;
            }
        }
    }

    fn time_out(&mut self) {
        warn!(run_id = %self.run_id, timeout_s = self.config.stream_timeout.as_secs(), "progress stream timed out");
        let id = self.take_id();
        self.push(Frame::timeout(id, self.run_id), None);
        self.finish(BridgeState::Timeout);
    }

    fn fail_stream(&mut self, error: BridgeError) {
        warn!(run_id = %self.run_id, error = %error, "progress stream failed");
        let id = self.take_id();
        let frame = Frame::stream_failed(id, self.run_id, self.last_progress, &error.to_string());
        self.push(frame, None);
        self.finish(BridgeState::Error);
    }

    fn finish(&mut self, state: BridgeState) {
        self.state = state;
        self.cancel.store(true, Ordering::SeqCst);
        debug!(run_id = %self.run_id, state = state.as_str(), "progress stream finished");
    }

    fn push(&mut self, frame: Frame, update: Option<ProgressUpdate>) {
        self.cache.append(self.run_id, frame.clone(), update);
        self.pending.push_back(frame);
        self.last_frame_at = Instant::now();
    }

    fn restore(&mut self, update: Option<&ProgressUpdate>) {
        if let Some(update) = update {
            self.tracker.seed(update);
            self.last_progress = self.last_progress.max(update.progress);
        }
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Drop for ProgressStream {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

fn failure_text(payload: Option<&EventPayload>) -> String {
    match payload {
        Some(EventPayload::Text(text)) => text.clone(),
        Some(EventPayload::Json(value)) => value.to_string(),
        None => "stage failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StageId, TaskId};
    use crate::impls::InMemoryEventBus;
    use crate::ports::EventPublisher;
    use chrono::Utc;
    use serde_json::json;
    use ulid::Ulid;

    fn config() -> BridgeConfig {
        BridgeConfig {
            stream_timeout: Duration::from_secs(3),
            keepalive_interval: Duration::from_millis(50),
            ready_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            channel_capacity: 16,
            result_grace: Duration::from_millis(150),
            replay_ttl: Duration::from_secs(60),
        }
    }

    fn id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    fn event(kind: StageEventType, run: RunId, task: TaskId, stage: StageId) -> StageEvent {
        StageEvent::new(kind, task, Utc::now())
            .with_root(run)
            .with_stage(stage)
    }

    /// Emits started/succeeded for every stage, task ids chained from the run id.
    fn emit_chain(bus: &InMemoryEventBus, run: RunId, stages: &[StageId]) {
        for &stage in stages {
            let task = if stage == StageId::first() { run } else { id() };
            bus.emit(event(StageEventType::Started, run, task, stage)).unwrap();
            bus.emit(event(StageEventType::Succeeded, run, task, stage)).unwrap();
        }
    }

    fn emit_result(bus: &InMemoryEventBus, run: RunId) {
        let payload = EventPayload::Json(json!({"status": "completed", "reward": null}));
        bus.emit(event(StageEventType::Result, run, id(), StageId::Reward).with_payload(payload))
            .unwrap();
    }

    async fn data_frames(stream: &mut ProgressStream) -> Vec<Frame> {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut frames = Vec::new();
            while let Some(frame) = stream.next_frame().await {
                if !matches!(frame, Frame::KeepAlive) {
                    frames.push(frame);
                }
            }
            frames
        })
        .await
        .expect("stream did not terminate")
    }

    fn steps(frames: &[Frame]) -> Vec<(String, String, u64)> {
        frames
            .iter()
            .filter_map(Frame::body)
            .filter(|body| body.get("step").is_some())
            .map(|body| {
                (
                    body["step"].as_str().unwrap_or_default().to_string(),
                    body["status"].as_str().unwrap_or_default().to_string(),
                    body["progress"].as_u64().unwrap_or_default(),
                )
            })
            .collect()
    }

    async fn next_data(stream: &mut ProgressStream) -> Frame {
        loop {
            match stream.next_frame().await {
                Some(Frame::KeepAlive) => continue,
                Some(frame) => return frame,
                None => panic!("stream ended early"),
            }
        }
    }

    async fn wait_for_subscribers(bus: &InMemoryEventBus, expected: usize) {
        for _ in 0..200 {
            if bus.subscriber_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscriber count never reached {expected}");
    }

    #[tokio::test]
    async fn streams_the_whole_chain_and_ends_with_the_result() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = ProgressBridge::new(bus.clone(), config());
        let run = id();
        let mut stream = bridge.open(run, None);

        let first = stream.next_frame().await.unwrap();
        assert_eq!(first.status(), Some("connected"));
        assert_eq!(first.id(), Some(1));
        assert_eq!(stream.state(), BridgeState::Streaming);

        emit_chain(&bus, run, &StageId::CHAIN);
        emit_result(&bus, run);

        let frames = data_frames(&mut stream).await;
        let expected: Vec<(String, String, u64)> = [
            ("vision", "started", 0),
            ("vision", "completed", 25),
            ("rule", "started", 25),
            ("rule", "completed", 50),
            ("answer", "started", 50),
            ("answer", "completed", 75),
            ("reward", "started", 75),
            ("reward", "completed", 100),
        ]
        .into_iter()
        .map(|(s, st, p)| (s.to_string(), st.to_string(), p))
        .collect();
        assert_eq!(steps(&frames), expected);

        let last = frames.last().unwrap();
        assert!(last.is_terminal());
        assert_eq!(last.body().unwrap()["result"], json!({"status": "completed", "reward": null}));
        assert_eq!(stream.state(), BridgeState::Done);

        let ids: Vec<u64> = frames.iter().filter_map(Frame::id).collect();
        assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[tokio::test]
    async fn missing_successes_are_synthesized() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = ProgressBridge::new(bus.clone(), config());
        let run = id();
        let mut stream = bridge.open(run, None);
        stream.next_frame().await.unwrap();

        bus.emit(event(StageEventType::Started, run, run, StageId::Vision)).unwrap();
        bus.emit(event(StageEventType::Started, run, id(), StageId::Answer)).unwrap();
        bus.emit(event(StageEventType::Failed, run, id(), StageId::Reward)
            .with_payload(EventPayload::Text("ledger offline".into())))
            .unwrap();

        let frames = data_frames(&mut stream).await;
        assert_eq!(
            steps(&frames),
            vec![
                ("vision".to_string(), "started".to_string(), 0),
                ("vision".to_string(), "completed".to_string(), 25),
                ("rule".to_string(), "completed".to_string(), 50),
                ("answer".to_string(), "started".to_string(), 50),
                ("reward".to_string(), "failed".to_string(), 75),
            ]
        );
        assert_eq!(frames.last().unwrap().body().unwrap()["error"], "ledger offline");
        assert_eq!(stream.state(), BridgeState::Error);
    }

    #[tokio::test]
    async fn foreign_events_are_ignored() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = ProgressBridge::new(bus.clone(), config());
        let run = id();
        let other = id();
        let mut stream = bridge.open(run, None);
        stream.next_frame().await.unwrap();

        emit_chain(&bus, other, &StageId::CHAIN);
        emit_result(&bus, other);
        // claims the run but names no stage for an unseen task
        bus.emit(StageEvent::new(StageEventType::Succeeded, id(), Utc::now()).with_root(run))
            .unwrap();
        emit_chain(&bus, run, &StageId::CHAIN);
        emit_result(&bus, run);

        let frames = data_frames(&mut stream).await;
        assert_eq!(steps(&frames).len(), 8);
        assert!(frames.iter().all(|f| f.body().unwrap()["task_id"] == json!(run)));
    }

    #[tokio::test]
    async fn missing_result_completes_with_null_after_grace() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = ProgressBridge::new(bus.clone(), config());
        let run = id();
        let mut stream = bridge.open(run, None);
        stream.next_frame().await.unwrap();

        emit_chain(&bus, run, &StageId::CHAIN);

        let frames = data_frames(&mut stream).await;
        let last = frames.last().unwrap();
        assert_eq!(last.status(), Some("completed"));
        assert_eq!(last.body().unwrap()["progress"], 100);
        assert_eq!(last.body().unwrap()["result"], serde_json::Value::Null);
        assert_eq!(stream.state(), BridgeState::Done);
    }

    #[tokio::test]
    async fn idle_stream_sends_keepalives_then_times_out() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = ProgressBridge::new(
            bus.clone(),
            BridgeConfig {
                stream_timeout: Duration::from_millis(300),
                ..config()
            },
        );
        let mut stream = bridge.open(id(), None);

        let mut keepalives = 0;
        let mut last = None;
        while let Some(frame) = stream.next_frame().await {
            if frame == Frame::KeepAlive {
                keepalives += 1;
            }
            last = Some(frame);
        }
        assert!(keepalives >= 2, "got {keepalives} keepalives");
        assert_eq!(last.unwrap().status(), Some("timeout"));
        assert_eq!(stream.state(), BridgeState::Timeout);
    }

    #[tokio::test]
    async fn keepalives_continue_under_foreign_traffic() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = ProgressBridge::new(
            bus.clone(),
            BridgeConfig {
                stream_timeout: Duration::from_millis(400),
                ..config()
            },
        );
        let mut stream = bridge.open(id(), None);
        stream.next_frame().await.unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let noise = {
            let bus = Arc::clone(&bus);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let other = id();
                while !stop.load(Ordering::SeqCst) {
                    let _ = bus.emit(event(StageEventType::Sent, other, id(), StageId::Vision));
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        };

        let mut keepalives = 0;
        let mut last = None;
        while let Some(frame) = stream.next_frame().await {
            if frame == Frame::KeepAlive {
                keepalives += 1;
            }
            last = Some(frame);
        }
        stop.store(true, Ordering::SeqCst);
        noise.join().unwrap();

        assert!(keepalives >= 3, "got {keepalives} keepalives");
        assert_eq!(last.unwrap().status(), Some("timeout"));
    }

    #[tokio::test]
    async fn waits_for_a_slow_subscription_before_streaming() {
        let bus = Arc::new(InMemoryEventBus::new().with_subscribe_delay(Duration::from_millis(100)));
        let bridge = ProgressBridge::new(bus.clone(), config());
        let run = id();
        let mut stream = bridge.open(run, None);

        assert_eq!(stream.next_frame().await.unwrap().status(), Some("connected"));
        // the listener is bound, nothing emitted from here on can be missed
        emit_chain(&bus, run, &StageId::CHAIN);
        emit_result(&bus, run);
        assert_eq!(steps(&data_frames(&mut stream).await).len(), 8);
    }

    #[tokio::test]
    async fn subscription_slower_than_ready_timeout_fails_the_stream() {
        let bus = Arc::new(InMemoryEventBus::new().with_subscribe_delay(Duration::from_millis(300)));
        let bridge = ProgressBridge::new(
            bus.clone(),
            BridgeConfig {
                ready_timeout: Duration::from_millis(50),
                ..config()
            },
        );
        let mut stream = bridge.open(id(), None);

        let frames = data_frames(&mut stream).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status(), Some("failed"));
        assert!(frames[0].body().unwrap()["error"].as_str().unwrap().contains("not ready"));
        assert_eq!(stream.state(), BridgeState::Error);
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_the_listener() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = ProgressBridge::new(bus.clone(), config());
        let mut stream = bridge.open(id(), None);
        stream.next_frame().await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        drop(stream);
        wait_for_subscribers(&bus, 0).await;
    }

    #[tokio::test]
    async fn resumed_stream_continues_after_last_event_id() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = ProgressBridge::new(bus.clone(), config());
        let run = id();

        let mut first = bridge.open(run, None);
        first.next_frame().await.unwrap();
        emit_chain(&bus, run, &[StageId::Vision]);
        let started = next_data(&mut first).await;
        assert_eq!(started.id(), Some(2));
        // "vision completed" (id 3) is produced but the client disconnects before reading it
        next_data(&mut first).await;
        drop(first);
        wait_for_subscribers(&bus, 0).await;

        let mut resumed = bridge.open(run, Some(2));
        let replayed = next_data(&mut resumed).await;
        assert_eq!(replayed.id(), Some(3));
        assert_eq!(replayed.status(), Some("completed"));

        wait_for_subscribers(&bus, 1).await;
        emit_chain(&bus, run, &[StageId::Rule, StageId::Answer, StageId::Reward]);
        emit_result(&bus, run);

        let frames = data_frames(&mut resumed).await;
        assert_eq!(frames[0].id(), Some(4));
        assert!(frames.iter().all(|f| f.status() != Some("connected")));
        assert!(steps(&frames).iter().all(|(stage, _, _)| stage != "vision"));
        assert_eq!(frames.last().unwrap().status(), Some("completed"));
    }

    #[tokio::test]
    async fn resume_after_terminal_replays_without_listening() {
        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = ProgressBridge::new(bus.clone(), config());
        let run = id();

        let mut first = bridge.open(run, None);
        first.next_frame().await.unwrap();
        emit_chain(&bus, run, &StageId::CHAIN);
        emit_result(&bus, run);
        let delivered = data_frames(&mut first).await;
        drop(first);
        wait_for_subscribers(&bus, 0).await;

        let mut resumed = bridge.open(run, Some(1));
        assert_eq!(resumed.state(), BridgeState::Done);
        assert_eq!(bus.subscriber_count(), 0);
        let replayed = data_frames(&mut resumed).await;
        assert_eq!(replayed, delivered);
    }

    #[tokio::test]
    async fn into_stream_yields_the_same_frames() {
        use futures::StreamExt;

        let bus = Arc::new(InMemoryEventBus::new());
        let bridge = ProgressBridge::new(bus.clone(), config());
        let run = id();
        let mut stream = bridge.open(run, None);
        stream.next_frame().await.unwrap();
        emit_chain(&bus, run, &StageId::CHAIN);
        emit_result(&bus, run);

        let frames: Vec<Frame> = stream
            .into_stream()
            .filter(|f| futures::future::ready(*f != Frame::KeepAlive))
            .collect()
            .await;
        assert_eq!(frames.len(), 8);
        assert!(frames.last().unwrap().is_terminal());
    }
}
