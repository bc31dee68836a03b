//! The scan-and-verify control loop.
//!
//! One task drives everything: it samples the frame source on a fixed tick,
//! decodes, debounces, and starts safety checks without waiting for them.
//! Checks in flight are polled on the same task, so verdicts interleave
//! with ticks but never run in parallel with them. Bringing the frame source
//! up is polled the same way, so commands and verdicts are still handled
//! while a camera is slow to answer.

pub mod state;

use futures_util::future::LocalBoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use qr_guard_common::config::ScanConfig;
use qr_guard_common::event::{
    CameraError, DecodeError, SafetyVerdict, ScanEvent, ScanId, VerificationError,
};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::decoder::{DecodePrimitive, DecoderAdapter, RqrrDecoder};
use crate::sink::{ChannelSink, PresentationSink};
use crate::source::upload::ImageUpload;
use crate::source::FrameSource;
use crate::verify::SafetyCheck;

pub use state::{LoopState, ScanSessionState, DEFAULT_DEBOUNCE};

type Verification =
    LocalBoxFuture<'static, (ScanId, String, Result<SafetyVerdict, VerificationError>)>;

/// Requests from the presentation layer.
///
/// Closing the result view is not a loop command: the capture is left as it
/// is and the view discards stale events on its own (`ResultView::dismiss`).
#[derive(Debug)]
pub enum Command {
    StartCamera,
    Stop,
    Restart,
    /// Retry after a camera error. Same teardown-then-start as `Restart`.
    RetryCamera,
    /// One-shot scan of an uploaded image. Stops the camera if it is running.
    ScanFile(ImageUpload),
    Shutdown,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NotRunning,
    NoFrame,
    NoCode,
    /// Same payload inside the debounce window, or its check is still pending.
    Debounced,
    Accepted(ScanId),
    CaptureLost,
}

/// How a start that kept listening for commands ended.
enum Acquisition {
    Finished(Result<(), CameraError>),
    /// A command arrived that needs the capture torn down first.
    Interrupted(Command),
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub tick_interval: Duration,
    pub debounce: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            debounce: Duration::from_millis(config.debounce_ms),
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(33),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

pub struct ScanLoop<S, V, D = RqrrDecoder, K = ChannelSink> {
    source: S,
    decoder: DecoderAdapter<D>,
    verifier: Rc<V>,
    sink: K,
    settings: LoopSettings,
    state: LoopState,
    session: ScanSessionState,
    in_flight: FuturesUnordered<Verification>,
    /// Payloads with a check in flight, with how many checks each.
    pending: HashMap<String, usize>,
    next_scan: u64,
}

impl<S, V, D, K> ScanLoop<S, V, D, K>
where
    S: FrameSource,
    V: SafetyCheck + 'static,
    D: DecodePrimitive,
    K: PresentationSink,
{
    pub fn new(
        source: S,
        decoder: DecoderAdapter<D>,
        verifier: V,
        sink: K,
        settings: LoopSettings,
    ) -> Self {
        Self {
            source,
            decoder,
            verifier: Rc::new(verifier),
            sink,
            settings,
            state: LoopState::Idle,
            session: ScanSessionState::default(),
            in_flight: FuturesUnordered::new(),
            pending: HashMap::new(),
            next_scan: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn session(&self) -> &ScanSessionState {
        &self.session
    }

    /// Number of safety checks started but not yet reported.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn next_scan_id(&mut self) -> ScanId {
        self.next_scan += 1;
        ScanId(self.next_scan)
    }

    /// Acquire the frame source and start ticking.
    ///
    /// On failure the loop stays `Idle` with nothing held, and a
    /// `CameraError` event is emitted for the retry prompt.
    pub async fn start(&mut self) -> Result<(), CameraError> {
        if self.state == LoopState::Running {
            debug!("scan loop already running");
            return Ok(());
        }
        self.begin_start();
        let result = self.source.acquire().await;
        self.finish_start(result, LoopState::Idle)
    }

    fn begin_start(&mut self) {
        self.state = LoopState::Starting;
        info!(source = self.source.name(), "acquiring frame source");
    }

    /// Apply the outcome of an acquire. A failed first start leaves the loop
    /// `Idle`; a failed retry leaves it `Stopped`.
    fn finish_start(
        &mut self,
        result: Result<(), CameraError>,
        on_failure: LoopState,
    ) -> Result<(), CameraError> {
        match result {
            Ok(()) => {
                self.state = LoopState::Running;
                self.session.active = true;
                info!(source = self.source.name(), "scan loop RUNNING");
                Ok(())
            }
            Err(e) => {
                self.source.release();
                self.state = on_failure;
                self.session.active = false;
                error!(error = %e, cause = ?e.cause(), state = %self.state, "failed to acquire frame source");
                let scan = self.next_scan_id();
                self.sink.emit(ScanEvent::CameraError {
                    scan,
                    error: e.clone(),
                });
                Err(e)
            }
        }
    }

    /// Release the capture, then mark the loop `Stopped`.
    ///
    /// Safety checks already in flight still complete and are reported.
    pub fn stop(&mut self) {
        if self.source.is_acquired() {
            self.source.release();
        }
        if matches!(self.state, LoopState::Running | LoopState::Starting) {
            info!(from = %self.state, in_flight = self.in_flight.len(), "scan loop STOPPED");
            self.state = LoopState::Stopped;
        }
        self.session.reset();
    }

    /// Full teardown followed by a fresh start, from any state.
    ///
    /// If the new acquire fails the loop ends `Stopped`.
    pub async fn restart(&mut self) -> Result<(), CameraError> {
        self.teardown();
        self.begin_start();
        let result = self.source.acquire().await;
        self.finish_start(result, LoopState::Stopped)
    }

    fn teardown(&mut self) {
        self.source.release();
        self.session.reset();
        self.state = LoopState::Idle;
        info!(source = self.source.name(), "scan loop torn down for restart");
    }

    /// Sample the frame source once.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.state != LoopState::Running {
            return TickOutcome::NotRunning;
        }

        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return TickOutcome::NoFrame,
            Err(e) => {
                warn!(error = %e, "frame source lost, stopping scan loop");
                self.stop();
                let scan = self.next_scan_id();
                self.sink.emit(ScanEvent::CameraError { scan, error: e });
                return TickOutcome::CaptureLost;
            }
        };

        let Some(code) = self.decoder.decode(&frame, now) else {
            return TickOutcome::NoCode;
        };

        if self.pending.contains_key(&code.payload) {
            debug!(seq = frame.seq, payload = code.payload, "check for this code still pending, ignoring");
            return TickOutcome::Debounced;
        }

        let payload = code.payload.clone();
        if !self.session.try_accept(code, self.settings.debounce) {
            debug!(seq = frame.seq, payload, "same code within debounce window, ignoring");
            return TickOutcome::Debounced;
        }

        let scan = self.next_scan_id();
        info!(%scan, seq = frame.seq, payload, "code accepted, checking safety");
        self.sink.emit(ScanEvent::Loading {
            scan,
            payload: payload.clone(),
        });
        self.dispatch(scan, payload);
        TickOutcome::Accepted(scan)
    }

    /// Decode an uploaded image once and, if a code is found, check it.
    ///
    /// Non-images are rejected before decoding. Decode failures are
    /// reported to the sink and leave the loop as it was; there is no retry.
    pub fn scan_file(&mut self, upload: &ImageUpload) -> Result<ScanId, DecodeError> {
        if self.state == LoopState::Running {
            info!("switching to file mode, stopping camera");
            self.stop();
        }

        let scan = self.next_scan_id();
        match self.decoder.decode_upload(upload, Instant::now()) {
            Ok(code) => {
                info!(%scan, name = upload.name, payload = code.payload, "code found in upload");
                self.sink.emit(ScanEvent::Loading {
                    scan,
                    payload: code.payload.clone(),
                });
                self.dispatch(scan, code.payload);
                Ok(scan)
            }
            Err(e) => {
                warn!(%scan, name = upload.name, error = %e, "upload could not be scanned");
                self.sink.emit(ScanEvent::Error {
                    scan,
                    payload: None,
                    error: e.clone().into(),
                });
                Err(e)
            }
        }
    }

    fn dispatch(&mut self, scan: ScanId, payload: String) {
        *self.pending.entry(payload.clone()).or_default() += 1;
        let verifier = Rc::clone(&self.verifier);
        self.in_flight.push(
            async move {
                let result = verifier.verify(&payload).await;
                (scan, payload, result)
            }
            .boxed_local(),
        );
    }

    fn report(
        &mut self,
        scan: ScanId,
        payload: String,
        result: Result<SafetyVerdict, VerificationError>,
    ) {
        settle(&mut self.pending, &payload);
        emit_result(&self.sink, scan, payload, result);
        // A failed check never ends scanning.
        if self.state == LoopState::Running {
            self.session.active = true;
        }
    }

    /// Wait for the next in-flight safety check and report it.
    /// Returns `None` when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<ScanId> {
        let (scan, payload, result) = self.in_flight.next().await?;
        self.report(scan, payload, result);
        Some(scan)
    }

    /// Poll the source's acquire alongside commands and in-flight checks.
    async fn acquire_listening(&mut self, commands: &mut mpsc::Receiver<Command>) -> Acquisition {
        let Self {
            source,
            sink,
            in_flight,
            pending,
            ..
        } = self;
        let acquire = source.acquire();
        tokio::pin!(acquire);

        loop {
            tokio::select! {
                result = &mut acquire => return Acquisition::Finished(result),
                command = commands.recv() => match command {
                    Some(Command::StartCamera) => debug!("frame source already starting"),
                    Some(command) => return Acquisition::Interrupted(command),
                    None => return Acquisition::Interrupted(Command::Shutdown),
                },
                Some((scan, payload, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    settle(pending, &payload);
                    emit_result(&*sink, scan, payload, result);
                }
            }
        }
    }

    /// Start from inside `run`. Returns the command that cut the start
    /// short, after the partial capture has been released.
    async fn start_listening(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
        on_failure: LoopState,
    ) -> Option<Command> {
        if self.state == LoopState::Running {
            debug!("scan loop already running");
            return None;
        }
        self.begin_start();
        match self.acquire_listening(commands).await {
            Acquisition::Finished(result) => {
                let _ = self.finish_start(result, on_failure);
                None
            }
            Acquisition::Interrupted(command) => {
                info!(?command, "frame source start abandoned");
                self.source.release();
                self.session.reset();
                self.state = LoopState::Stopped;
                Some(command)
            }
        }
    }

    async fn handle(
        &mut self,
        command: Command,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Option<Command> {
        debug!(?command, state = %self.state, "handling command");
        match command {
            Command::StartCamera => self.start_listening(commands, LoopState::Idle).await,
            Command::Stop => {
                self.stop();
                None
            }
            Command::Restart | Command::RetryCamera => {
                self.teardown();
                self.start_listening(commands, LoopState::Stopped).await
            }
            Command::ScanFile(upload) => {
                let _ = self.scan_file(&upload);
                None
            }
            Command::Shutdown => None,
        }
    }

    /// Drive the loop until `Shutdown` arrives or the command channel closes.
    /// The capture is released before returning.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            debounce_ms = self.settings.debounce.as_millis() as u64,
            "entering scan loop"
        );

        'run: loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(mut command) = command else { break };
                    loop {
                        if matches!(command, Command::Shutdown) {
                            break 'run;
                        }
                        match self.handle(command, &mut commands).await {
                            Some(next) => command = next,
                            None => break,
                        }
                    }
                }
                Some((scan, payload, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.report(scan, payload, result);
                }
                _ = ticker.tick(), if self.state == LoopState::Running => {
                    self.tick(Instant::now());
                }
            }
        }

        let abandoned = self.in_flight.len();
        self.stop();
        self.in_flight.clear();
        self.pending.clear();
        info!(abandoned, "scan loop shut down");
    }
}

fn settle(pending: &mut HashMap<String, usize>, payload: &str) {
    if let Some(count) = pending.get_mut(payload) {
        *count -= 1;
        if *count == 0 {
            pending.remove(payload);
        }
    }
}

fn emit_result<K: PresentationSink>(
    sink: &K,
    scan: ScanId,
    payload: String,
    result: Result<SafetyVerdict, VerificationError>,
) {
    match result {
        Ok(verdict) => {
            debug!(%scan, is_safe = verdict.is_safe, "reporting verdict");
            sink.emit(ScanEvent::Verdict {
                scan,
                payload,
                verdict,
            });
        }
        Err(e) => {
            warn!(%scan, kind = ?e.kind(), error = %e, "safety check failed");
            sink.emit(ScanEvent::Error {
                scan,
                payload: Some(payload),
                error: e.into(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use qr_guard_common::event::{ScanFailure, ThreatType, VerificationErrorKind};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::Cursor;

    #[derive(Debug, Default)]
    struct SourceStats {
        acquires: u32,
        releases: u32,
        open: u32,
        max_open: u32,
    }

    /// Frame source fed from a script of per-tick results.
    struct FakeSource {
        acquire_results: VecDeque<Result<(), CameraError>>,
        frames: VecDeque<Result<Option<Frame>, CameraError>>,
        /// Acquire opens the capture but never sees a first frame.
        hang_acquire: bool,
        open: bool,
        stats: Rc<RefCell<SourceStats>>,
    }

    impl FakeSource {
        fn new(stats: Rc<RefCell<SourceStats>>) -> Self {
            Self {
                acquire_results: VecDeque::new(),
                frames: VecDeque::new(),
                hang_acquire: false,
                open: false,
                stats,
            }
        }

        fn push_code(&mut self, n: u8) {
            let image = GrayImage::from_pixel(4, 4, Luma([n]));
            self.frames.push_back(Ok(Some(Frame::new(image, n as u64))));
        }

        fn mark_open(&mut self) {
            self.open = true;
            let mut stats = self.stats.borrow_mut();
            stats.open += 1;
            stats.max_open = stats.max_open.max(stats.open);
        }
    }

    impl FrameSource for FakeSource {
        async fn acquire(&mut self) -> Result<(), CameraError> {
            self.release();
            self.stats.borrow_mut().acquires += 1;
            if self.hang_acquire {
                self.mark_open();
                std::future::pending::<()>().await;
            }
            let result = self.acquire_results.pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.mark_open();
            }
            result
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
            if !self.open {
                return Err(CameraError::Other("not open".into()));
            }
            self.frames.pop_front().unwrap_or(Ok(None))
        }

        fn release(&mut self) {
            if self.open {
                self.open = false;
                let mut stats = self.stats.borrow_mut();
                stats.open -= 1;
                stats.releases += 1;
            }
        }

        fn is_acquired(&self) -> bool {
            self.open
        }
    }

    /// Pixel value n decodes to `https://site{n}.example/`; 0 is no code.
    struct PixelDecoder;

    impl DecodePrimitive for PixelDecoder {
        fn decode(&self, frame: &Frame) -> Option<String> {
            match frame.image.get_pixel(0, 0).0[0] {
                0 => None,
                n => Some(format!("https://site{n}.example/")),
            }
        }
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Safe,
        /// Safe, after a delay.
        SlowSafe(Duration),
        Phishing,
        Timeout,
        /// Never answers.
        Hang,
    }

    struct FakeVerifier {
        reply: Reply,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl SafetyCheck for FakeVerifier {
        async fn verify(&self, payload: &str) -> Result<SafetyVerdict, VerificationError> {
            self.calls.borrow_mut().push(payload.to_string());
            tokio::task::yield_now().await;
            match self.reply {
                Reply::SlowSafe(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(SafetyVerdict {
                        is_safe: true,
                        threat: ThreatType::Unknown,
                        raw: serde_json::Value::Null,
                    })
                }
                Reply::Hang => std::future::pending().await,
                Reply::Safe => Ok(SafetyVerdict {
                    is_safe: true,
                    threat: ThreatType::Unknown,
                    raw: serde_json::json!({"message": "SUCCESS", "result": {"safe": "1"}}),
                }),
                Reply::Phishing => Ok(SafetyVerdict {
                    is_safe: false,
                    threat: ThreatType::Phishing,
                    raw: serde_json::Value::Null,
                }),
                Reply::Timeout => Err(VerificationError::NetworkFailure(
                    "request timed out".into(),
                )),
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Rc<RefCell<Vec<ScanEvent>>>,
    }

    impl PresentationSink for RecordingSink {
        fn emit(&self, event: ScanEvent) {
            self.events.borrow_mut().push(event);
        }
    }

    struct Harness {
        scan: ScanLoop<FakeSource, FakeVerifier, PixelDecoder, RecordingSink>,
        stats: Rc<RefCell<SourceStats>>,
        calls: Rc<RefCell<Vec<String>>>,
        events: Rc<RefCell<Vec<ScanEvent>>>,
    }

    fn harness(reply: Reply, setup: impl FnOnce(&mut FakeSource)) -> Harness {
        let stats = Rc::new(RefCell::new(SourceStats::default()));
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = RecordingSink::default();
        let events = Rc::clone(&sink.events);

        let mut source = FakeSource::new(Rc::clone(&stats));
        setup(&mut source);

        let scan = ScanLoop::new(
            source,
            DecoderAdapter::new(PixelDecoder, 1024),
            FakeVerifier {
                reply,
                calls: Rc::clone(&calls),
            },
            sink,
            LoopSettings::default(),
        );
        Harness {
            scan,
            stats,
            calls,
            events,
        }
    }

    async fn drain(scan: &mut ScanLoop<FakeSource, FakeVerifier, PixelDecoder, RecordingSink>) {
        while scan.next_completion().await.is_some() {}
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test]
    async fn held_code_within_window_verifies_once() {
        let mut h = harness(Reply::Safe, |s| {
            for _ in 0..3 {
                s.push_code(1);
            }
        });
        h.scan.start().await.unwrap();

        let t0 = Instant::now();
        assert!(matches!(h.scan.tick(t0), TickOutcome::Accepted(_)));
        assert_eq!(h.scan.tick(t0 + ms(1000)), TickOutcome::Debounced);
        assert_eq!(h.scan.tick(t0 + ms(3000)), TickOutcome::Debounced);
        drain(&mut h.scan).await;

        assert_eq!(h.calls.borrow().len(), 1);
    }

    #[tokio::test]
    async fn held_code_is_not_rechecked_while_check_pending() {
        let mut h = harness(Reply::Hang, |s| {
            s.push_code(1);
            s.push_code(1);
            s.push_code(2);
        });
        h.scan.start().await.unwrap();

        let t0 = Instant::now();
        assert!(matches!(h.scan.tick(t0), TickOutcome::Accepted(_)));
        // Past the debounce window, but the first check has not answered.
        assert_eq!(h.scan.tick(t0 + ms(3001)), TickOutcome::Debounced);
        assert!(matches!(h.scan.tick(t0 + ms(3002)), TickOutcome::Accepted(_)));
        assert_eq!(h.scan.in_flight(), 2);

        assert!(tokio::time::timeout(ms(20), h.scan.next_completion())
            .await
            .is_err());
        let mut calls = h.calls.borrow().clone();
        calls.sort();
        assert_eq!(calls, vec!["https://site1.example/", "https://site2.example/"]);
    }

    #[tokio::test]
    async fn same_code_after_window_verifies_twice() {
        let mut h = harness(Reply::Safe, |s| {
            s.push_code(1);
            s.push_code(1);
        });
        h.scan.start().await.unwrap();

        let t0 = Instant::now();
        h.scan.tick(t0);
        assert!(matches!(h.scan.tick(t0 + ms(3001)), TickOutcome::Accepted(_)));
        drain(&mut h.scan).await;

        assert_eq!(h.calls.borrow().len(), 2);
    }

    #[tokio::test]
    async fn distinct_codes_verify_independently() {
        let mut h = harness(Reply::Safe, |s| {
            s.push_code(1);
            s.push_code(2);
        });
        h.scan.start().await.unwrap();

        let t0 = Instant::now();
        h.scan.tick(t0);
        h.scan.tick(t0);
        assert_eq!(h.scan.in_flight(), 2);
        drain(&mut h.scan).await;

        assert_eq!(
            *h.calls.borrow(),
            vec!["https://site1.example/", "https://site2.example/"]
        );
    }

    #[tokio::test]
    async fn accepted_code_emits_loading_then_verdict() {
        let mut h = harness(Reply::Phishing, |s| s.push_code(5));
        h.scan.start().await.unwrap();

        let TickOutcome::Accepted(scan) = h.scan.tick(Instant::now()) else {
            panic!("code not accepted");
        };
        // The tick returns before the check completes.
        assert_eq!(h.events.borrow().len(), 1);
        assert_eq!(h.scan.next_completion().await, Some(scan));

        let events = h.events.borrow();
        assert!(matches!(&events[0], ScanEvent::Loading { payload, .. } if payload == "https://site5.example/"));
        match &events[1] {
            ScanEvent::Verdict { scan: s, verdict, .. } => {
                assert_eq!(*s, scan);
                assert!(!verdict.is_safe);
                assert_eq!(verdict.threat_type(), "PHISHING");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_ticks_do_nothing() {
        let mut h = harness(Reply::Safe, |s| s.push_code(0));
        assert_eq!(h.scan.tick(Instant::now()), TickOutcome::NotRunning);

        h.scan.start().await.unwrap();
        assert_eq!(h.scan.tick(Instant::now()), TickOutcome::NoCode);
        assert_eq!(h.scan.tick(Instant::now()), TickOutcome::NoFrame);
        assert!(h.events.borrow().is_empty());
    }

    #[tokio::test]
    async fn permission_denied_then_retry_does_not_leak() {
        let mut h = harness(Reply::Safe, |s| {
            s.acquire_results.push_back(Err(CameraError::PermissionDenied));
        });

        assert_eq!(h.scan.start().await.unwrap_err(), CameraError::PermissionDenied);
        assert_eq!(h.scan.state(), LoopState::Idle);
        assert!(!h.scan.session().active);
        assert!(matches!(
            &h.events.borrow()[0],
            ScanEvent::CameraError { error: CameraError::PermissionDenied, .. }
        ));

        // A retry that fails again ends Stopped, still holding nothing.
        h.scan
            .source
            .acquire_results
            .push_back(Err(CameraError::NoDevice));
        assert_eq!(h.scan.restart().await.unwrap_err(), CameraError::NoDevice);
        assert_eq!(h.scan.state(), LoopState::Stopped);
        assert_eq!(h.stats.borrow().open, 0);
        assert!(matches!(
            &h.events.borrow()[1],
            ScanEvent::CameraError { error: CameraError::NoDevice, .. }
        ));

        h.scan.restart().await.unwrap();
        assert_eq!(h.scan.state(), LoopState::Running);

        let stats = h.stats.borrow();
        assert_eq!(stats.acquires, 3);
        assert_eq!(stats.open, 1);
        assert_eq!(stats.max_open, 1);
    }

    #[tokio::test]
    async fn restart_releases_before_acquiring() {
        let mut h = harness(Reply::Safe, |_| {});
        h.scan.start().await.unwrap();
        h.scan.restart().await.unwrap();
        h.scan.restart().await.unwrap();

        let stats = h.stats.borrow();
        assert_eq!(stats.acquires, 3);
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.max_open, 1);
    }

    #[tokio::test]
    async fn stop_releases_capture() {
        let mut h = harness(Reply::Safe, |s| s.push_code(1));
        h.scan.start().await.unwrap();
        h.scan.tick(Instant::now());
        h.scan.stop();

        assert_eq!(h.scan.state(), LoopState::Stopped);
        assert!(!h.scan.source().is_acquired());
        assert_eq!(h.stats.borrow().open, 0);
        assert!(!h.scan.session().active);
        assert!(h.scan.session().last_accepted.is_none());
        assert_eq!(h.scan.tick(Instant::now()), TickOutcome::NotRunning);
    }

    #[tokio::test]
    async fn verification_failure_keeps_scanning() {
        let mut h = harness(Reply::Timeout, |s| {
            s.push_code(3);
            s.push_code(4);
        });
        h.scan.start().await.unwrap();
        h.scan.tick(Instant::now());
        drain(&mut h.scan).await;

        assert!(h.scan.session().active);
        assert_eq!(h.scan.state(), LoopState::Running);
        match h.events.borrow().last().unwrap() {
            ScanEvent::Error {
                error: ScanFailure::Verification(e),
                payload,
                ..
            } => {
                assert_eq!(e.kind(), VerificationErrorKind::NetworkFailure);
                assert_eq!(payload.as_deref(), Some("https://site3.example/"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The next code is still picked up.
        assert!(matches!(h.scan.tick(Instant::now()), TickOutcome::Accepted(_)));
    }

    #[tokio::test]
    async fn lost_capture_stops_loop() {
        let mut h = harness(Reply::Safe, |s| s.frames.push_back(Err(CameraError::Aborted)));
        h.scan.start().await.unwrap();

        assert_eq!(h.scan.tick(Instant::now()), TickOutcome::CaptureLost);
        assert_eq!(h.scan.state(), LoopState::Stopped);
        assert_eq!(h.stats.borrow().open, 0);
        assert!(matches!(
            &h.events.borrow()[0],
            ScanEvent::CameraError { error: CameraError::Aborted, .. }
        ));
    }

    fn png(shade: u8) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(GrayImage::from_pixel(16, 16, Luma([shade])))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn non_image_upload_rejected_synchronously() {
        let mut h = harness(Reply::Safe, |_| {});
        let upload = ImageUpload::from_bytes("doc.pdf", b"%PDF-1.7 not pixels".to_vec());

        assert_eq!(h.scan.scan_file(&upload).unwrap_err(), DecodeError::NotAnImage);
        assert!(matches!(
            &h.events.borrow()[0],
            ScanEvent::Error { error: ScanFailure::Decode(DecodeError::NotAnImage), .. }
        ));
        assert_eq!(h.scan.in_flight(), 0);
        assert_eq!(h.scan.state(), LoopState::Idle);
        assert!(h.calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn upload_without_code_stays_idle() {
        let mut h = harness(Reply::Safe, |_| {});
        let upload = ImageUpload::from_bytes("blank.png", png(0));

        assert_eq!(h.scan.scan_file(&upload).unwrap_err(), DecodeError::NoCodeFound);
        assert_eq!(h.scan.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn upload_is_verified_without_debounce() {
        let mut h = harness(Reply::Safe, |_| {});
        let upload = ImageUpload::from_bytes("qr.png", png(8));

        h.scan.scan_file(&upload).unwrap();
        h.scan.scan_file(&upload).unwrap();
        drain(&mut h.scan).await;

        assert_eq!(h.calls.borrow().len(), 2);
    }

    #[tokio::test]
    async fn upload_while_running_stops_camera() {
        let mut h = harness(Reply::Safe, |_| {});
        h.scan.start().await.unwrap();

        h.scan.scan_file(&ImageUpload::from_bytes("qr.png", png(8))).unwrap();
        assert_eq!(h.scan.state(), LoopState::Stopped);
        assert_eq!(h.stats.borrow().open, 0);
    }

    #[tokio::test]
    async fn run_processes_commands_and_shuts_down_cleanly() {
        let mut h = harness(Reply::Safe, |s| s.push_code(9));
        let (tx, rx) = mpsc::channel(8);
        let events = Rc::clone(&h.events);

        let driver = async {
            tx.send(Command::StartCamera).await.unwrap();
            for _ in 0..200 {
                let done = events
                    .borrow()
                    .iter()
                    .any(|e| matches!(e, ScanEvent::Verdict { .. }));
                if done {
                    break;
                }
                tokio::time::sleep(ms(5)).await;
            }
            tx.send(Command::Shutdown).await.unwrap();
        };
        tokio::join!(h.scan.run(rx), driver);

        assert!(h
            .events
            .borrow()
            .iter()
            .any(|e| matches!(e, ScanEvent::Verdict { payload, .. } if payload == "https://site9.example/")));
        assert_eq!(h.stats.borrow().open, 0);
        assert_eq!(h.scan.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn commands_and_verdicts_flow_while_camera_hangs() {
        let mut h = harness(Reply::SlowSafe(ms(50)), |s| s.hang_acquire = true);
        h.scan
            .scan_file(&ImageUpload::from_bytes("qr.png", png(8)))
            .unwrap();
        let (tx, rx) = mpsc::channel(8);
        let events = Rc::clone(&h.events);
        let stats = Rc::clone(&h.stats);

        let driver = async {
            tx.send(Command::StartCamera).await.unwrap();
            for _ in 0..200 {
                if events
                    .borrow()
                    .iter()
                    .any(|e| matches!(e, ScanEvent::Verdict { .. }))
                {
                    break;
                }
                tokio::time::sleep(ms(5)).await;
            }
            // The verdict was reported while the camera was still coming up.
            assert_eq!(stats.borrow().acquires, 1);
            assert_eq!(stats.borrow().open, 1);

            tx.send(Command::Restart).await.unwrap();
            for _ in 0..200 {
                if stats.borrow().acquires == 2 {
                    break;
                }
                tokio::time::sleep(ms(5)).await;
            }
            tx.send(Command::Shutdown).await.unwrap();
        };
        let finished =
            tokio::time::timeout(Duration::from_secs(2), async { tokio::join!(h.scan.run(rx), driver) })
                .await;
        assert!(finished.is_ok(), "loop did not shut down while acquiring");

        assert!(h
            .events
            .borrow()
            .iter()
            .any(|e| matches!(e, ScanEvent::Verdict { payload, .. } if payload == "https://site8.example/")));
        let stats = h.stats.borrow();
        assert_eq!(stats.acquires, 2);
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.open, 0);
        assert_eq!(stats.max_open, 1);
        assert_eq!(h.scan.state(), LoopState::Stopped);
    }
}
