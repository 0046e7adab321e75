//! Camera state machine over an ordered list of backends.
//!
//! `Uninitialized → Initializing → Ready → Degraded → Uninitialized`
//!
//! Initialization walks the backend list in order and keeps the first one that
//! comes up, retrying the whole walk a bounded number of times. Repeated
//! capture failures move the source to `Degraded` and trigger one
//! reinitialize cycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::backends::{BackendError, BackendResult, CameraBackend, StillStrategy};
use super::{CameraError, CameraState, CapturedImage, Frame, Resolution};

const DEFAULT_INIT_ATTEMPTS: u32 = 3;
const DEFAULT_INIT_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_RECOVERY_SETTLE: Duration = Duration::from_secs(2);
/// Consecutive frame failures before the source is considered degraded.
const DEGRADED_AFTER: u32 = 3;

const STAGING_PREFIX: &str = ".staging_";

pub struct CameraSource {
    backends: Vec<Box<dyn CameraBackend>>,
    active: Option<usize>,
    state: CameraState,
    disabled: bool,
    scratch_dir: PathBuf,
    init_attempts: u32,
    init_delay: Duration,
    recovery_settle: Duration,
    frame_failures: u32,
    cancel: CancellationToken,
}

impl CameraSource {
    /// A source trying `backends` in order, staging stills in `scratch_dir`.
    pub fn new(backends: Vec<Box<dyn CameraBackend>>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            backends,
            active: None,
            state: CameraState::Uninitialized,
            disabled: false,
            scratch_dir: scratch_dir.into(),
            init_attempts: DEFAULT_INIT_ATTEMPTS,
            init_delay: DEFAULT_INIT_DELAY,
            recovery_settle: DEFAULT_RECOVERY_SETTLE,
            frame_failures: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// A source that never initializes (`NO_CAMERA`).
    pub fn disabled(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            disabled: true,
            ..Self::new(Vec::new(), scratch_dir)
        }
    }

    pub fn with_init_policy(mut self, attempts: u32, delay: Duration) -> Self {
        self.init_attempts = attempts.max(1);
        self.init_delay = delay;
        self
    }

    pub fn with_recovery_settle(mut self, settle: Duration) -> Self {
        self.recovery_settle = settle;
        self
    }

    /// Aborts pending initialize/recovery waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> CameraState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == CameraState::Ready
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Name of the backend currently in use.
    pub fn active_backend(&self) -> Option<&'static str> {
        self.active.map(|idx| self.backends[idx].name())
    }

    /// Brings up the first working backend.
    ///
    /// Every backend is tried once per attempt; attempts are separated by the
    /// configured delay. Returns `HardwareUnavailable` once the budget is spent.
    pub async fn initialize(&mut self) -> Result<(), CameraError> {
        if self.disabled {
            return Err(CameraError::HardwareUnavailable("camera disabled by configuration".to_string()));
        }
        if self.backends.is_empty() {
            return Err(CameraError::HardwareUnavailable("no camera backends configured".to_string()));
        }

        self.release_backend().await;
        self.state = CameraState::Initializing;
        if let Err(e) = tokio::fs::create_dir_all(&self.scratch_dir).await {
            log::warn!("Cannot create scratch directory {}: {}", self.scratch_dir.display(), e);
        }

        for attempt in 1..=self.init_attempts {
            for idx in 0..self.backends.len() {
                let backend = &mut self.backends[idx];
                match backend.initialize().await {
                    Ok(()) => {
                        log::info!("Camera initialized with {} backend (attempt {})", backend.name(), attempt);
                        self.active = Some(idx);
                        self.state = CameraState::Ready;
                        self.frame_failures = 0;
                        return Ok(());
                    }
                    Err(e) => {
                        log::warn!("{} backend failed to initialize: {}", backend.name(), e);
                        backend.shutdown().await;
                    }
                }
            }

            if attempt < self.init_attempts {
                log::info!(
                    "Camera initialization attempt {}/{} failed, retrying in {:?}",
                    attempt,
                    self.init_attempts,
                    self.init_delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.init_delay) => {}
                    _ = self.cancel.cancelled() => {
                        log::info!("Camera initialization cancelled");
                        break;
                    }
                }
            }
        }

        self.state = CameraState::Uninitialized;
        log::error!("Camera initialization failed after {} attempts", self.init_attempts);
        Err(CameraError::HardwareUnavailable(format!(
            "no camera backend available after {} attempts",
            self.init_attempts
        )))
    }

    /// Captures a still and publishes it under the scratch directory.
    ///
    /// The capture is staged in a temporary file, checked for non-zero size and
    /// renamed into place. On failure the staging file is removed, the source
    /// reinitializes once and the capture is retried.
    pub async fn capture_still(&mut self, resolution: Resolution) -> Result<CapturedImage, CameraError> {
        let first = self.capture_still_once(resolution).await;
        let err = match first {
            Ok(image) => return Ok(image),
            Err(CameraError::HardwareUnavailable(msg)) if self.state != CameraState::Ready => {
                return Err(CameraError::HardwareUnavailable(msg));
            }
            Err(e) => e,
        };

        log::warn!("Still capture failed: {}. Reinitializing camera", err);
        if self.recover().await.is_err() {
            return Err(err);
        }
        self.capture_still_once(resolution).await
    }

    /// Captures one in-memory frame.
    pub async fn capture_frame(&mut self, resolution: Resolution) -> Result<Frame, CameraError> {
        let idx = self.ready_backend()?;

        match self.backends[idx].capture_frame(resolution).await {
            Ok(image) => {
                self.frame_failures = 0;
                Ok(Frame {
                    image,
                    captured_at: Utc::now(),
                })
            }
            Err(e) => {
                let err = CameraError::from(e);
                self.frame_failures += 1;
                log::warn!("Frame capture failed ({} in a row): {}", self.frame_failures, err);
                if self.frame_failures >= DEGRADED_AFTER {
                    self.frame_failures = 0;
                    if let Err(re) = self.recover().await {
                        log::error!("Camera recovery failed: {}", re);
                    }
                }
                Err(err)
            }
        }
    }

    /// Best-effort probe: a still at [`Resolution::PROBE`], discarded immediately.
    ///
    /// On failure the backend is torn down (scratch files are kept) and
    /// reinitialized within the normal initialize budget. Returns whether the
    /// probe succeeded.
    pub async fn health_check(&mut self) -> bool {
        if self.disabled {
            return false;
        }

        if self.is_ready() {
            match self.capture_still_once(Resolution::PROBE).await {
                Ok(probe) => {
                    log::debug!("Camera health probe ok ({} bytes)", probe.bytes().len());
                    return true;
                }
                Err(e) => log::warn!("Camera health probe failed: {}", e),
            }
        } else {
            log::warn!("Camera health probe found camera in state {:?}", self.state);
        }

        self.shutdown(false).await;
        if let Err(e) = self.initialize().await {
            log::error!("Camera reinitialization after failed probe failed: {}", e);
        }
        false
    }

    /// Releases streaming resources; the camera stays initialized.
    pub async fn suspend(&mut self) {
        if let Some(idx) = self.active {
            self.backends[idx].suspend().await;
        }
    }

    /// Releases the backend. With `full`, also purges every file in the scratch directory.
    pub async fn shutdown(&mut self, full: bool) {
        self.release_backend().await;
        self.state = CameraState::Uninitialized;
        self.frame_failures = 0;

        if full {
            match purge_dir(&self.scratch_dir).await {
                Ok(0) => {}
                Ok(n) => log::info!("Removed {} temporary files from {}", n, self.scratch_dir.display()),
                Err(e) => log::warn!("Failed to purge {}: {}", self.scratch_dir.display(), e),
            }
        }
    }

    async fn release_backend(&mut self) {
        if let Some(idx) = self.active.take() {
            log::debug!("Releasing {} backend", self.backends[idx].name());
            self.backends[idx].shutdown().await;
        }
    }

    async fn recover(&mut self) -> Result<(), CameraError> {
        self.state = CameraState::Degraded;
        self.release_backend().await;

        tokio::select! {
            _ = tokio::time::sleep(self.recovery_settle) => {}
            _ = self.cancel.cancelled() => {
                self.state = CameraState::Uninitialized;
                return Err(CameraError::HardwareUnavailable("camera recovery cancelled".to_string()));
            }
        }

        self.initialize().await
    }

    fn ready_backend(&self) -> Result<usize, CameraError> {
        match (self.state, self.active) {
            (CameraState::Ready, Some(idx)) => Ok(idx),
            _ if self.disabled => Err(CameraError::HardwareUnavailable("camera disabled by configuration".to_string())),
            (state, _) => Err(CameraError::HardwareUnavailable(format!("camera is {:?}", state))),
        }
    }

    async fn capture_still_once(&mut self, resolution: Resolution) -> Result<CapturedImage, CameraError> {
        let idx = self.ready_backend()?;
        let backend = self.backends[idx].as_mut();
        stage_still(backend, &self.scratch_dir, resolution)
            .await
            .map_err(CameraError::from)
    }
}

async fn stage_still(
    backend: &mut dyn CameraBackend,
    scratch_dir: &Path,
    resolution: Resolution,
) -> BackendResult<CapturedImage> {
    tokio::fs::create_dir_all(scratch_dir).await?;

    // Removed on drop unless persisted.
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .suffix(".jpg")
        .tempfile_in(scratch_dir)?
        .into_temp_path();

    let (attempts, spacing) = match backend.still_strategy() {
        StillStrategy::Staged => (1, Duration::ZERO),
        StillStrategy::RetryOnEmpty { attempts, spacing } => (attempts.max(1), spacing),
    };

    let mut bytes = Vec::new();
    for attempt in 1..=attempts {
        let result = match backend.capture_still(resolution, &staging).await {
            Ok(()) => match tokio::fs::read(&staging).await {
                Ok(data) if data.is_empty() => Err(BackendError::EmptyOutput),
                Ok(data) => Ok(data),
                Err(e) => Err(BackendError::Io(e)),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(data) => {
                bytes = data;
                break;
            }
            Err(BackendError::EmptyOutput) if attempt < attempts => {
                log::warn!(
                    "{} produced an empty still (attempt {}/{}), retrying",
                    backend.name(),
                    attempt,
                    attempts
                );
                tokio::time::sleep(spacing).await;
            }
            Err(e) => return Err(e),
        }
    }
    if bytes.is_empty() {
        return Err(BackendError::EmptyOutput);
    }

    let captured_at = Utc::now();
    let unique = uuid::Uuid::new_v4().simple().to_string();
    let final_path = scratch_dir.join(format!(
        "image_{}_{}.jpg",
        captured_at.format("%Y%m%d_%H%M%S"),
        &unique[..8]
    ));

    staging.persist(&final_path).map_err(|e| BackendError::Io(e.error))?;
    log::debug!("Still published at {} ({} bytes)", final_path.display(), bytes.len());

    Ok(CapturedImage::new(final_path, bytes, captured_at))
}

async fn purge_dir(dir: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Cloneable handle to a [`CameraSource`] behind an async mutex.
///
/// The mutex is the capture gate: at most one operation touches the device at a time.
#[derive(Clone)]
pub struct SharedCamera {
    inner: Arc<Mutex<CameraSource>>,
}

impl SharedCamera {
    pub fn new(source: CameraSource) -> Self {
        Self {
            inner: Arc::new(Mutex::new(source)),
        }
    }

    /// Waits for exclusive access to the camera.
    pub async fn lock(&self) -> MutexGuard<'_, CameraSource> {
        self.inner.lock().await
    }

    pub async fn capture_still(&self, resolution: Resolution) -> Result<CapturedImage, CameraError> {
        self.lock().await.capture_still(resolution).await
    }

    pub async fn capture_frame(&self, resolution: Resolution) -> Result<Frame, CameraError> {
        self.lock().await.capture_frame(resolution).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::backends::TestPatternBackend;
    use async_trait::async_trait;
    use image::RgbImage;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Outcome of one scripted still capture.
    #[derive(Clone, Copy)]
    pub(crate) enum StillOutcome {
        Ok,
        /// Leaves a zero-byte file behind.
        Empty,
        /// Writes a partial file, then fails.
        PartialThenFail,
    }

    #[derive(Default)]
    pub(crate) struct ScriptedBackend {
        pub init_ok: bool,
        pub initialized: bool,
        pub stills: VecDeque<StillOutcome>,
        pub frame_failures: VecDeque<bool>,
        pub init_calls: Arc<AtomicU32>,
        pub strategy: Option<StillStrategy>,
    }

    #[async_trait]
    impl CameraBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn still_strategy(&self) -> StillStrategy {
            self.strategy.unwrap_or(StillStrategy::Staged)
        }

        async fn initialize(&mut self) -> BackendResult<()> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.init_ok {
                self.initialized = true;
                Ok(())
            } else {
                Err(BackendError::NotDetected("scripted absence".into()))
            }
        }

        async fn capture_still(&mut self, _resolution: Resolution, dest: &Path) -> BackendResult<()> {
            match self.stills.pop_front().unwrap_or(StillOutcome::Ok) {
                StillOutcome::Ok => {
                    std::fs::write(dest, b"\xFF\xD8jpeg\xFF\xD9")?;
                    Ok(())
                }
                StillOutcome::Empty => {
                    std::fs::write(dest, b"")?;
                    Ok(())
                }
                StillOutcome::PartialThenFail => {
                    std::fs::write(dest, b"\xFF\xD8")?;
                    Err(BackendError::Process {
                        program: "scripted".into(),
                        status: 1,
                        stderr: "sensor fault".into(),
                    })
                }
            }
        }

        async fn capture_frame(&mut self, resolution: Resolution) -> BackendResult<RgbImage> {
            if self.frame_failures.pop_front().unwrap_or(false) {
                return Err(BackendError::Timeout {
                    what: "scripted frame".into(),
                    after: Duration::from_secs(1),
                });
            }
            Ok(RgbImage::new(resolution.width, resolution.height))
        }

        async fn shutdown(&mut self) {
            self.initialized = false;
        }
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok().map(|e| e.path())).collect())
            .unwrap_or_default()
    }

    fn working() -> ScriptedBackend {
        ScriptedBackend {
            init_ok: true,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_gives_up_after_three_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let a = ScriptedBackend {
            init_calls: calls.clone(),
            ..Default::default()
        };
        let b = ScriptedBackend {
            init_calls: calls.clone(),
            ..Default::default()
        };
        let mut source = CameraSource::new(vec![Box::new(a), Box::new(b)], dir.path());

        let started = tokio::time::Instant::now();
        let result = source.initialize().await;

        assert!(matches!(result, Err(CameraError::HardwareUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(source.state(), CameraState::Uninitialized);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_falls_through_to_second_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = CameraSource::new(
            vec![Box::new(ScriptedBackend::default()), Box::new(TestPatternBackend::new())],
            dir.path(),
        );

        source.initialize().await.unwrap();
        assert_eq!(source.active_backend(), Some("test"));
        assert!(source.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_initialize_short() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let mut source =
            CameraSource::new(vec![Box::new(ScriptedBackend::default())], dir.path()).with_cancellation(token.clone());
        token.cancel();

        let started = tokio::time::Instant::now();
        assert!(source.initialize().await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn disabled_source_never_initializes() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = CameraSource::disabled(dir.path());
        assert!(source.initialize().await.is_err());
        assert!(matches!(
            source.capture_frame(Resolution::PROBE).await,
            Err(CameraError::HardwareUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn still_is_published_and_removed_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = CameraSource::new(vec![Box::new(working())], dir.path());
        source.initialize().await.unwrap();

        let image = source.capture_still(Resolution::new(1920, 1080)).await.unwrap();
        let name = image.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("image_") && name.ends_with(".jpg"));
        assert!(std::fs::metadata(image.path()).unwrap().len() > 0);
        assert_eq!(files_in(dir.path()), vec![image.path().to_path_buf()]);

        drop(image);
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_still_leaves_no_partial_or_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend {
            init_ok: true,
            stills: VecDeque::from([StillOutcome::PartialThenFail, StillOutcome::Empty]),
            ..Default::default()
        };
        let mut source = CameraSource::new(vec![Box::new(backend)], dir.path());
        source.initialize().await.unwrap();

        let result = source.capture_still(Resolution::new(640, 480)).await;

        assert_eq!(result.unwrap_err(), CameraError::CaptureEmpty);
        assert!(files_in(dir.path()).is_empty());
        assert!(source.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn still_retries_after_reinitialize() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let backend = ScriptedBackend {
            init_ok: true,
            stills: VecDeque::from([StillOutcome::PartialThenFail, StillOutcome::Ok]),
            init_calls: calls.clone(),
            ..Default::default()
        };
        let mut source = CameraSource::new(vec![Box::new(backend)], dir.path());
        source.initialize().await.unwrap();

        let image = source.capture_still(Resolution::new(640, 480)).await.unwrap();
        assert!(image.bytes().len() > 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_on_empty_strategy_tolerates_transient_empties() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ScriptedBackend {
            init_ok: true,
            stills: VecDeque::from([StillOutcome::Empty, StillOutcome::Empty, StillOutcome::Ok]),
            strategy: Some(StillStrategy::RetryOnEmpty {
                attempts: 3,
                spacing: Duration::from_secs(1),
            }),
            ..Default::default()
        };
        let mut source = CameraSource::new(vec![Box::new(backend)], dir.path());
        source.initialize().await.unwrap();

        let started = tokio::time::Instant::now();
        let image = source.capture_still(Resolution::new(640, 480)).await.unwrap();
        assert!(!image.bytes().is_empty());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_frame_failures_trigger_reinitialize() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let backend = ScriptedBackend {
            init_ok: true,
            frame_failures: VecDeque::from([true, true, true, false]),
            init_calls: calls.clone(),
            ..Default::default()
        };
        let mut source = CameraSource::new(vec![Box::new(backend)], dir.path());
        source.initialize().await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                source.capture_frame(Resolution::PROBE).await.unwrap_err(),
                CameraError::CaptureTimeout
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(source.is_ready());
        assert!(source.capture_frame(Resolution::PROBE).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_reinitializes_within_budget_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let backend = ScriptedBackend {
            init_ok: true,
            stills: VecDeque::from([StillOutcome::PartialThenFail]),
            init_calls: calls.clone(),
            ..Default::default()
        };
        let mut source = CameraSource::new(vec![Box::new(backend)], dir.path());
        source.initialize().await.unwrap();

        let started = tokio::time::Instant::now();
        assert!(!source.health_check().await);
        assert!(started.elapsed() <= Duration::from_secs(20));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(source.is_ready());
        assert!(files_in(dir.path()).is_empty());

        assert!(source.health_check().await);
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn full_shutdown_purges_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("image_old.jpg"), b"stale").unwrap();
        std::fs::write(dir.path().join(".staging_x.jpg"), b"").unwrap();

        let mut source = CameraSource::new(vec![Box::new(working())], dir.path());
        source.initialize().await.unwrap();

        source.shutdown(false).await;
        assert_eq!(files_in(dir.path()).len(), 2);
        assert_eq!(source.state(), CameraState::Uninitialized);

        source.shutdown(true).await;
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn shared_camera_serializes_access() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = CameraSource::new(vec![Box::new(TestPatternBackend::new())], dir.path());
        source.initialize().await.unwrap();
        let camera = SharedCamera::new(source);

        let (a, b) = tokio::join!(
            camera.capture_frame(Resolution::new(32, 24)),
            camera.capture_frame(Resolution::new(32, 24))
        );
        assert!(a.is_ok() && b.is_ok());
    }
}
