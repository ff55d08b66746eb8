//! Continuous frame acquisition on a dedicated thread.
//!
//! The capture loop publishes each frame into a single-slot `watch` mailbox:
//! a new frame replaces the previous one whether or not it was read, and
//! readers always get a whole `Arc<Frame>`. The device handle never leaves
//! the capture thread; `stop()` joins the thread, so the device is dropped
//! before `Stopped` is reported.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

/// Something that yields frames. Owned exclusively by the capture thread.
pub trait FrameDevice: Send + 'static {
    fn acquire(&mut self) -> Result<Frame, CameraError>;
}

impl FrameDevice for Camera {
    fn acquire(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

/// Read side of a frame source.
pub trait FrameProvider: Send + Sync {
    /// The most recently published frame.
    fn snapshot(&self) -> Result<Arc<Frame>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Running,
    /// Acquisitions have failed continuously for longer than the configured window.
    Degraded,
    Stopping,
    Stopped,
}

impl SourceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("frame source unavailable (state: {})", .0.as_str())]
    Unavailable(SourceState),
    #[error("no frame available")]
    NoFrame,
    #[error("frame source already started")]
    AlreadyStarted,
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    /// Pause between acquisitions.
    pub interval: Duration,
    /// How long acquisitions may fail back-to-back before the source degrades.
    pub degraded_after: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(30),
            degraded_after: Duration::from_secs(5),
        }
    }
}

struct Shared {
    state: Mutex<SourceState>,
    stop: AtomicBool,
    mailbox: watch::Sender<Option<Arc<Frame>>>,
}

impl Shared {
    /// Move `from -> to`; returns false if the source was not in `from`.
    fn transition(&self, from: SourceState, to: SourceState) -> bool {
        let mut state = lock(&self.state);
        if *state != from {
            return false;
        }
        *state = to;
        true
    }
}

/// Latest-wins frame source driven by a capture thread.
pub struct FrameSource {
    shared: Arc<Shared>,
    device: Mutex<Option<Box<dyn FrameDevice>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    options: SourceOptions,
}

impl FrameSource {
    /// Wrap an already opened device. Nothing runs until [`start`](Self::start).
    pub fn new(device: impl FrameDevice, options: SourceOptions) -> Self {
        let (mailbox, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SourceState::Idle),
                stop: AtomicBool::new(false),
                mailbox,
            }),
            device: Mutex::new(Some(Box::new(device))),
            worker: Mutex::new(None),
            options,
        }
    }

    pub fn state(&self) -> SourceState {
        *lock(&self.shared.state)
    }

    /// Spawn the capture thread. Only valid from `Idle`.
    pub fn start(&self) -> Result<(), SourceError> {
        let mut worker = lock(&self.worker);
        if !self.shared.transition(SourceState::Idle, SourceState::Running) {
            return Err(SourceError::AlreadyStarted);
        }
        let Some(device) = lock(&self.device).take() else {
            return Err(SourceError::AlreadyStarted);
        };

        let shared = Arc::clone(&self.shared);
        let options = self.options;
        let spawned = std::thread::Builder::new()
            .name("faceguard-frames".into())
            .spawn(move || run_capture_loop(device, &shared, options));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                tracing::info!(
                    interval_ms = options.interval.as_millis() as u64,
                    "frame source started"
                );
                Ok(())
            }
            Err(e) => {
                *lock(&self.shared.state) = SourceState::Stopped;
                Err(SourceError::Spawn(e))
            }
        }
    }

    /// Request a cooperative stop and wait for the device to be released.
    ///
    /// Idempotent and safe to call from several threads; an acquisition
    /// already in flight completes and its frame is discarded.
    pub fn stop(&self) {
        let mut worker = lock(&self.worker);
        {
            let mut state = lock(&self.shared.state);
            if *state == SourceState::Stopped {
                return;
            }
            *state = SourceState::Stopping;
        }

        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
        // Never started: the device is still parked here.
        drop(lock(&self.device).take());

        *lock(&self.shared.state) = SourceState::Stopped;
        tracing::info!("frame source stopped");
    }
}

impl FrameProvider for FrameSource {
    fn snapshot(&self) -> Result<Arc<Frame>, SourceError> {
        let state = self.state();
        if state != SourceState::Running {
            return Err(SourceError::Unavailable(state));
        }
        self.shared.mailbox.borrow().clone().ok_or(SourceError::NoFrame)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_loop(mut device: Box<dyn FrameDevice>, shared: &Shared, options: SourceOptions) {
    let mut last_success = Instant::now();
    let mut failures = 0u64;

    while !shared.stop.load(Ordering::Acquire) {
        match device.acquire() {
            Ok(frame) => {
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                shared.mailbox.send_replace(Some(Arc::new(frame)));
                last_success = Instant::now();
                if shared.transition(SourceState::Degraded, SourceState::Running) {
                    tracing::info!(failures, "frame source recovered");
                }
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                tracing::debug!(error = %e, failures, "frame acquisition failed; skipping");
                let stalled = last_success.elapsed();
                if stalled >= options.degraded_after
                    && shared.transition(SourceState::Running, SourceState::Degraded)
                {
                    tracing::warn!(
                        failures,
                        stalled_ms = stalled.as_millis() as u64,
                        "frame source degraded"
                    );
                }
            }
        }
        std::thread::sleep(options.interval);
    }

    drop(device);
    tracing::debug!("capture thread exiting");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFormat;
    use std::sync::atomic::AtomicU32;

    const W: u32 = 8;
    const H: u32 = 4;

    /// Produces uniform frames whose every byte equals the sequence number.
    /// Fails its first `fail_first` acquisitions.
    struct FakeDevice {
        calls: Arc<AtomicU32>,
        fail_first: u32,
        released: Arc<AtomicBool>,
    }

    impl FakeDevice {
        fn new(fail_first: u32) -> (Self, Arc<AtomicBool>) {
            let released = Arc::new(AtomicBool::new(false));
            let device = Self {
                calls: Arc::new(AtomicU32::new(0)),
                fail_first,
                released: Arc::clone(&released),
            };
            (device, released)
        }
    }

    impl FrameDevice for FakeDevice {
        fn acquire(&mut self) -> Result<Frame, CameraError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(CameraError::CaptureFailed("no data".into()));
            }
            let fill = (n % 251) as u8;
            Ok(Frame::new(vec![fill; (W * H * 3) as usize], W, H, FrameFormat::Rgb8, n).unwrap())
        }
    }

    impl Drop for FakeDevice {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn fast() -> SourceOptions {
        SourceOptions {
            interval: Duration::from_millis(1),
            degraded_after: Duration::from_secs(60),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_snapshot_before_start_is_unavailable() {
        let (device, _) = FakeDevice::new(0);
        let source = FrameSource::new(device, fast());
        assert!(matches!(
            source.snapshot(),
            Err(SourceError::Unavailable(SourceState::Idle))
        ));
    }

    #[test]
    fn test_snapshot_returns_latest_frame() {
        let (device, _) = FakeDevice::new(0);
        let source = FrameSource::new(device, fast());
        source.start().unwrap();

        assert!(wait_for(|| source.snapshot().is_ok()));
        let first = source.snapshot().unwrap();
        assert!(wait_for(|| source.snapshot().unwrap().sequence > first.sequence));
        source.stop();
    }

    #[test]
    fn test_no_frame_yet() {
        let (device, _) = FakeDevice::new(u32::MAX);
        let source = FrameSource::new(device, fast());
        source.start().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(source.snapshot(), Err(SourceError::NoFrame)));
        assert_eq!(source.state(), SourceState::Running);
    }

    #[test]
    fn test_start_twice_rejected() {
        let (device, _) = FakeDevice::new(0);
        let source = FrameSource::new(device, fast());
        source.start().unwrap();
        assert!(matches!(source.start(), Err(SourceError::AlreadyStarted)));
    }

    #[test]
    fn test_stop_releases_device_and_is_idempotent() {
        let (device, released) = FakeDevice::new(0);
        let source = FrameSource::new(device, fast());
        source.start().unwrap();
        assert!(wait_for(|| source.snapshot().is_ok()));

        source.stop();
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(source.state(), SourceState::Stopped);
        assert!(matches!(
            source.snapshot(),
            Err(SourceError::Unavailable(SourceState::Stopped))
        ));

        source.stop();
        assert_eq!(source.state(), SourceState::Stopped);
    }

    #[test]
    fn test_stop_without_start_releases_device() {
        let (device, released) = FakeDevice::new(0);
        let source = FrameSource::new(device, fast());
        source.stop();
        assert!(released.load(Ordering::SeqCst));
        assert!(matches!(source.start(), Err(SourceError::AlreadyStarted)));
    }

    #[test]
    fn test_concurrent_stop() {
        let (device, released) = FakeDevice::new(0);
        let source = Arc::new(FrameSource::new(device, fast()));
        source.start().unwrap();

        let stoppers: Vec<_> = (0..4)
            .map(|_| {
                let source = Arc::clone(&source);
                std::thread::spawn(move || {
                    source.stop();
                    source.state()
                })
            })
            .collect();

        for handle in stoppers {
            assert_eq!(handle.join().unwrap(), SourceState::Stopped);
        }
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_degrades_when_acquisition_stalls() {
        let (device, _) = FakeDevice::new(u32::MAX);
        let source = FrameSource::new(
            device,
            SourceOptions {
                interval: Duration::from_millis(1),
                degraded_after: Duration::from_millis(20),
            },
        );
        source.start().unwrap();

        assert!(wait_for(|| source.state() == SourceState::Degraded));
        assert!(matches!(
            source.snapshot(),
            Err(SourceError::Unavailable(SourceState::Degraded))
        ));
    }

    #[test]
    fn test_recovers_after_degraded() {
        let (device, _) = FakeDevice::new(200);
        let source = FrameSource::new(
            device,
            SourceOptions {
                interval: Duration::from_millis(1),
                degraded_after: Duration::from_millis(5),
            },
        );
        source.start().unwrap();

        assert!(wait_for(|| source.state() == SourceState::Degraded));
        assert!(wait_for(|| source.snapshot().is_ok()));
        assert_eq!(source.state(), SourceState::Running);
    }

    #[test]
    fn test_readers_never_see_partial_frames() {
        let (device, _) = FakeDevice::new(0);
        let source = Arc::new(FrameSource::new(
            device,
            SourceOptions {
                interval: Duration::ZERO,
                degraded_after: Duration::from_secs(60),
            },
        ));
        source.start().unwrap();
        assert!(wait_for(|| source.snapshot().is_ok()));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let source = Arc::clone(&source);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let frame = source.snapshot().unwrap();
                        assert_eq!(frame.data.len(), (W * H * 3) as usize);
                        let first = frame.data[0];
                        assert!(frame.data.iter().all(|&b| b == first));
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }
        source.stop();
    }

    /// Serves one frame, then parks inside the next `acquire` until released.
    struct GatedDevice {
        calls: u32,
        entered: std::sync::mpsc::Sender<()>,
        release: std::sync::mpsc::Receiver<()>,
        released: Arc<AtomicBool>,
    }

    impl FrameDevice for GatedDevice {
        fn acquire(&mut self) -> Result<Frame, CameraError> {
            self.calls += 1;
            if self.calls > 1 {
                let _ = self.entered.send(());
                let _ = self.release.recv();
            }
            Ok(Frame::new(vec![0; (W * H * 3) as usize], W, H, FrameFormat::Rgb8, self.calls).unwrap())
        }
    }

    impl Drop for GatedDevice {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stop_waits_for_in_flight_acquisition_and_discards_it() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let released = Arc::new(AtomicBool::new(false));
        let source = Arc::new(FrameSource::new(
            GatedDevice {
                calls: 0,
                entered: entered_tx,
                release: release_rx,
                released: Arc::clone(&released),
            },
            fast(),
        ));
        source.start().unwrap();
        assert!(wait_for(|| source.snapshot().is_ok()));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let stopper = {
            let source = Arc::clone(&source);
            std::thread::spawn(move || source.stop())
        };
        assert!(wait_for(|| source.state() == SourceState::Stopping));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!stopper.is_finished());
        assert_eq!(source.state(), SourceState::Stopping);
        assert!(!released.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        stopper.join().unwrap();

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(source.state(), SourceState::Stopped);
        let last = source.shared.mailbox.borrow().clone().unwrap();
        assert_eq!(last.sequence, 1, "frame acquired during stop was published");
    }
}
