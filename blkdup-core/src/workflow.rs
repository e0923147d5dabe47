//! The capture/restore state machine.
//!
//! A run moves through `Idle → GateCheck → Copying → (Verifying) → Done`.
//! Components report typed results; this module alone decides what each
//! result means for the run and records it in a [`WorkflowOutcome`].
//!
//! ```rust,no_run
//! use blkdup_core::{CancelToken, DeviceRef, DupConfig, ImageRef};
//! use blkdup_core::workflow::{DuplicationWorkflow, WorkflowEvent, WorkflowRequest};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let device = DeviceRef::parse("sdb")?;
//! let request = WorkflowRequest::capture(device, ImageRef::new("backup.img"));
//! let workflow = DuplicationWorkflow::new(DupConfig::default(), CancelToken::new());
//!
//! let outcome = workflow.run(&request, |event| {
//!     if let WorkflowEvent::CopyProgress { bytes } = event {
//!         println!("{bytes} bytes copied");
//!     }
//! });
//! std::process::exit(outcome.exit_code());
//! # }
//! ```
use crate::cancel::CancelToken;
use crate::config::DupConfig;
use crate::copy::{self, CopyOptions, CopyResult};
use crate::device::{DeviceRef, ImageRef};
use crate::error::DupError;
use crate::gate::{DeviceGate, SystemGate};
use crate::hash::{Digest, DigestSource, DigestSpec, Sha256Hasher};
use crate::lock::DeviceLock;
use crate::platform;
use crate::verify::{
    DigestInput, RetryPolicy, VerdictStatus, VerificationCoordinator, VerificationVerdict,
    VerifySide,
};
use std::fmt;
use std::sync::Arc;
use tracing::{info, info_span, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Device → image file.
    Capture,
    /// Image file → device.
    Restore,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Capture => "capture",
            Direction::Restore => "restore",
        })
    }
}

/// The states of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    GateCheck,
    Copying,
    Verifying,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Idle => "idle",
            Phase::GateCheck => "gate-check",
            Phase::Copying => "copying",
            Phase::Verifying => "verifying",
            Phase::Done => "done",
        })
    }
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Success,
    Failed,
    /// The copy succeeded but its integrity could not be confirmed.
    Indeterminate,
    Cancelled,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Disposition::Success => "success",
            Disposition::Failed => "failed",
            Disposition::Indeterminate => "indeterminate",
            Disposition::Cancelled => "cancelled",
        })
    }
}

/// Everything the caller decided before starting a run.
///
/// Interactive confirmation happens before a request is built; the workflow
/// treats a request as already approved.
#[derive(Clone, Debug)]
pub struct WorkflowRequest {
    pub direction: Direction,
    pub device: DeviceRef,
    pub image: ImageRef,
    pub verify: bool,
    /// Proceed even if the device cannot be unmounted.
    pub force: bool,
    pub remount: bool,
    /// A previously recorded digest of the source side to verify against.
    pub expected_digest: Option<Digest>,
}

impl WorkflowRequest {
    pub fn capture(device: DeviceRef, image: ImageRef) -> Self {
        Self::new(Direction::Capture, device, image)
    }

    pub fn restore(image: ImageRef, device: DeviceRef) -> Self {
        Self::new(Direction::Restore, device, image)
    }

    fn new(direction: Direction, device: DeviceRef, image: ImageRef) -> Self {
        Self {
            direction,
            device,
            image,
            verify: true,
            force: false,
            remount: false,
            expected_digest: None,
        }
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_remount(mut self, remount: bool) -> Self {
        self.remount = remount;
        self
    }

    pub fn with_expected_digest(mut self, digest: Digest) -> Self {
        self.expected_digest = Some(digest);
        self
    }
}

/// Structured progress for presentation layers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkflowEvent {
    PhaseStarted {
        phase: Phase,
        /// Bytes the phase is expected to process, when known.
        total_bytes: Option<u64>,
    },
    CopyProgress {
        bytes: u64,
    },
    VerifyProgress {
        side: VerifySide,
        bytes: u64,
    },
    Warning(String),
}

/// The terminal record of a run.
#[derive(Debug)]
pub struct WorkflowOutcome {
    direction: Direction,
    disposition: Disposition,
    phase: Phase,
    copy: Option<CopyResult>,
    verification: Option<VerificationVerdict>,
    failure: Option<DupError>,
    warnings: Vec<String>,
    recommend_recopy: bool,
}

impl WorkflowOutcome {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn success(&self) -> bool {
        self.disposition == Disposition::Success
    }

    /// The phase the run was in when it reached `Done`.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// `None` if the run ended before copying started.
    pub fn copy(&self) -> Option<&CopyResult> {
        self.copy.as_ref()
    }

    pub fn verification(&self) -> Option<&VerificationVerdict> {
        self.verification.as_ref()
    }

    /// Why the run did not succeed, if it did not.
    pub fn cause(&self) -> Option<&DupError> {
        self.failure
            .as_ref()
            .or_else(|| self.copy.as_ref().and_then(CopyResult::error))
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Set when a restored device failed verification.
    pub fn recommend_recopy(&self) -> bool {
        self.recommend_recopy
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.copy.as_ref().map_or(0, CopyResult::bytes_copied)
    }

    /// Process exit code for command-line front-ends.
    pub fn exit_code(&self) -> i32 {
        match self.disposition {
            Disposition::Success => 0,
            Disposition::Failed => 1,
            Disposition::Indeterminate => 2,
            Disposition::Cancelled => 130,
        }
    }
}

/// Mutable bookkeeping for a single run.
struct Run<'r> {
    request: &'r WorkflowRequest,
    phase: Phase,
    image_len: Option<u64>,
    lock: Option<DeviceLock>,
    unmounted: bool,
    copy: Option<CopyResult>,
    verification: Option<VerificationVerdict>,
    end: Option<(Disposition, Option<DupError>)>,
    warnings: Vec<String>,
    recommend_recopy: bool,
}

impl<'r> Run<'r> {
    fn new(request: &'r WorkflowRequest) -> Self {
        Self {
            request,
            phase: Phase::Idle,
            image_len: None,
            lock: None,
            unmounted: false,
            copy: None,
            verification: None,
            end: None,
            warnings: Vec::new(),
            recommend_recopy: false,
        }
    }

    /// Records the terminal disposition and moves to `Done`.
    fn finish(&mut self, disposition: Disposition, failure: Option<DupError>) -> Phase {
        self.end = Some((disposition, failure));
        Phase::Done
    }

    fn fail(&mut self, failure: DupError) -> Phase {
        let disposition = if failure.is_cancelled() {
            Disposition::Cancelled
        } else {
            Disposition::Failed
        };
        self.finish(disposition, Some(failure))
    }

    fn warn(&mut self, message: String, on_event: &mut dyn FnMut(WorkflowEvent)) {
        warn!("{message}");
        on_event(WorkflowEvent::Warning(message.clone()));
        self.warnings.push(message);
    }
}

/// Sequences gate, copy and verification for one device and one image.
pub struct DuplicationWorkflow {
    gate: Arc<dyn DeviceGate>,
    hasher: Arc<dyn DigestSource>,
    config: DupConfig,
    cancel: CancelToken,
}

impl DuplicationWorkflow {
    /// A workflow using the system mount facilities and SHA-256.
    pub fn new(config: DupConfig, cancel: CancelToken) -> Self {
        Self {
            gate: Arc::new(SystemGate),
            hasher: Arc::new(Sha256Hasher),
            config,
            cancel,
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn DeviceGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn DigestSource>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn config(&self) -> &DupConfig {
        &self.config
    }

    /// Runs `request` to completion. Blocks for the duration of the copy and
    /// the verification; `on_event` receives progress along the way.
    pub fn run<F>(&self, request: &WorkflowRequest, mut on_event: F) -> WorkflowOutcome
    where
        F: FnMut(WorkflowEvent),
    {
        let span = info_span!(
            "duplicate",
            direction = %request.direction,
            device = %request.device,
            image = %request.image.path().display()
        );
        let _entered = span.enter();

        let mut run = Run::new(request);
        loop {
            let next = match run.phase {
                Phase::Idle => self.validate(&mut run),
                Phase::GateCheck => self.gate_check(&mut run, &mut on_event),
                Phase::Copying => self.copy(&mut run, &mut on_event),
                Phase::Verifying => self.verify(&mut run, &mut on_event),
                Phase::Done => break,
            };
            if next == Phase::Done {
                break;
            }
            info!(from = %run.phase, to = %next, "Transition");
            run.phase = next;
        }

        self.conclude(run, &mut on_event)
    }

    fn validate(&self, run: &mut Run<'_>) -> Phase {
        let request = run.request;
        let device_path = request.device.raw_path();

        if !device_path.exists() {
            return run.fail(DupError::InvalidInput(format!(
                "device {} ({}) does not exist",
                request.device,
                device_path.display()
            )));
        }
        if request.image.path() == device_path {
            return run.fail(DupError::InvalidInput(
                "image path and device path are the same".to_string(),
            ));
        }
        if let Err(e) = self.config.validate() {
            return run.fail(e);
        }

        match request.direction {
            Direction::Capture => {
                if let Err(e) = request.image.validate_for_capture() {
                    return run.fail(e);
                }
            }
            Direction::Restore => {
                let image_len = match request.image.validate_for_restore() {
                    Ok(len) => len,
                    Err(e) => return run.fail(e),
                };
                if let Some(device_len) = platform::device_size(device_path) {
                    if image_len > device_len && !request.device.is_backed() {
                        return run.fail(DupError::InvalidInput(format!(
                            "image is {image_len} bytes but device {} holds only {device_len}",
                            request.device
                        )));
                    }
                }
                run.image_len = Some(image_len);
            }
        }
        Phase::GateCheck
    }

    fn gate_check(&self, run: &mut Run<'_>, on_event: &mut dyn FnMut(WorkflowEvent)) -> Phase {
        on_event(WorkflowEvent::PhaseStarted {
            phase: Phase::GateCheck,
            total_bytes: None,
        });
        let request = run.request;
        let device = &request.device;

        match DeviceLock::acquire(&self.config.lock_dir, device) {
            Ok(lock) => run.lock = Some(lock),
            Err(e) => return run.fail(e),
        }

        match self.gate.ensure_unmounted(device) {
            Ok(was_mounted) => {
                // Only volumes this run took down are brought back.
                run.unmounted = was_mounted;
                Phase::Copying
            }
            Err(e) if e.is_device_busy() && request.force => {
                run.warn(format!("continuing with a busy device: {e}"), on_event);
                Phase::Copying
            }
            Err(e) => run.fail(e),
        }
    }

    fn copy(&self, run: &mut Run<'_>, on_event: &mut dyn FnMut(WorkflowEvent)) -> Phase {
        let request = run.request;
        let (source, dest, total) = match request.direction {
            Direction::Capture => (
                request.device.raw_path(),
                request.image.path(),
                platform::device_size(request.device.raw_path()),
            ),
            Direction::Restore => (
                request.image.path(),
                request.device.raw_path(),
                run.image_len,
            ),
        };

        on_event(WorkflowEvent::PhaseStarted {
            phase: Phase::Copying,
            total_bytes: total,
        });
        let options = CopyOptions {
            block_size: self.config.block_size,
            // A restore target keeps its size, even when it is a backing file.
            truncate_dest: request.direction == Direction::Capture,
        };
        let result = copy::copy(source, dest, options, &self.cancel, |bytes| {
            on_event(WorkflowEvent::CopyProgress { bytes })
        });

        let next = if result.was_cancelled() {
            run.finish(Disposition::Cancelled, None)
        } else if !result.succeeded() {
            run.finish(Disposition::Failed, None)
        } else if request.verify {
            Phase::Verifying
        } else {
            run.finish(Disposition::Success, None)
        };
        run.copy = Some(result);
        next
    }

    fn verify(&self, run: &mut Run<'_>, on_event: &mut dyn FnMut(WorkflowEvent)) -> Phase {
        let request = run.request;
        let bytes_copied = run.copy.as_ref().map_or(0, CopyResult::bytes_copied);

        let (source_spec, dest_spec, dest_device) = match request.direction {
            Direction::Capture => (
                DigestSpec::device(request.device.raw_path()),
                DigestSpec::file(request.image.path()),
                None,
            ),
            Direction::Restore => (
                DigestSpec::file(request.image.path()),
                DigestSpec::device(request.device.raw_path()).with_limit(bytes_copied),
                Some(&request.device),
            ),
        };
        let source = match &request.expected_digest {
            Some(digest) => DigestInput::Recorded(digest.clone()),
            None => DigestInput::Compute(source_spec),
        };

        on_event(WorkflowEvent::PhaseStarted {
            phase: Phase::Verifying,
            total_bytes: Some(bytes_copied),
        });

        let policy = RetryPolicy {
            retries: self.config.verify_retries,
            settle_delay: self.config.settle_delay(),
        };
        let coordinator = VerificationCoordinator::new(&*self.hasher, &*self.gate, policy);
        let verdict = coordinator.verify(
            &source,
            &dest_spec,
            dest_device,
            &self.cancel,
            &mut |side, bytes| on_event(WorkflowEvent::VerifyProgress { side, bytes }),
        );

        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(e) => return run.fail(e),
        };
        let next = match verdict.status() {
            VerdictStatus::Match => run.finish(Disposition::Success, None),
            VerdictStatus::Mismatch => {
                run.recommend_recopy = request.direction == Direction::Restore;
                run.finish(Disposition::Failed, verdict.failure())
            }
            VerdictStatus::Indeterminate => {
                run.finish(Disposition::Indeterminate, verdict.failure())
            }
        };
        run.verification = Some(verdict);
        next
    }

    /// Remounts if requested, releases the device and builds the outcome.
    fn conclude(&self, mut run: Run<'_>, on_event: &mut dyn FnMut(WorkflowEvent)) -> WorkflowOutcome {
        if run.unmounted && run.request.remount {
            if let Err(e) = self.gate.ensure_mounted(&run.request.device) {
                run.warn(format!("remount failed: {e}"), on_event);
            }
        }
        drop(run.lock.take());

        let (disposition, failure) = run
            .end
            .take()
            .unwrap_or((Disposition::Failed, None));

        info!(
            disposition = %disposition,
            phase = %run.phase,
            bytes = run.copy.as_ref().map_or(0, CopyResult::bytes_copied),
            "Run finished"
        );

        WorkflowOutcome {
            direction: run.request.direction,
            disposition,
            phase: run.phase,
            copy: run.copy,
            verification: run.verification,
            failure,
            warnings: run.warnings,
            recommend_recopy: run.recommend_recopy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceNaming;
    use crate::gate::SimulatedGate;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Bench {
        dir: TempDir,
        gate: Arc<SimulatedGate>,
    }

    impl Bench {
        fn new(gate: SimulatedGate) -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                gate: Arc::new(gate),
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn device(&self, bytes: &[u8]) -> DeviceRef {
            let backing = self.path("sdz.dev");
            std::fs::write(&backing, bytes).unwrap();
            DeviceRef::parse_with(DeviceNaming::Linux, "sdz")
                .unwrap()
                .with_backing_path(backing)
        }

        fn workflow(&self) -> DuplicationWorkflow {
            let config = DupConfig {
                block_size: 4096,
                settle_delay_ms: 0,
                lock_dir: self.path("locks"),
                ..DupConfig::default()
            };
            DuplicationWorkflow::new(config, CancelToken::new()).with_gate(self.gate.clone())
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn capture_without_verification() {
        let bench = Bench::new(SimulatedGate::new());
        let data = pattern(20_000);
        let device = bench.device(&data);
        let image = ImageRef::new(bench.path("out.img"));

        let request = WorkflowRequest::capture(device, image).with_verify(false);
        let mut phases = Vec::new();
        let outcome = bench.workflow().run(&request, |event| {
            if let WorkflowEvent::PhaseStarted { phase, .. } = event {
                phases.push(phase);
            }
        });

        assert!(outcome.success());
        assert_eq!(outcome.phase(), Phase::Copying);
        assert!(outcome.verification().is_none());
        assert_eq!(outcome.bytes_transferred(), data.len() as u64);
        assert_eq!(phases, vec![Phase::GateCheck, Phase::Copying]);
        assert_eq!(std::fs::read(bench.path("out.img")).unwrap(), data);
    }

    #[test]
    fn missing_device_is_invalid_input() {
        let bench = Bench::new(SimulatedGate::new());
        let device = DeviceRef::parse_with(DeviceNaming::Linux, "sdz")
            .unwrap()
            .with_backing_path(bench.path("absent"));
        let request = WorkflowRequest::capture(device, ImageRef::new(bench.path("out.img")));

        let outcome = bench.workflow().run(&request, |_| {});
        assert_eq!(outcome.disposition(), Disposition::Failed);
        assert_eq!(outcome.phase(), Phase::Idle);
        assert!(outcome.copy().is_none());
        assert!(matches!(outcome.cause(), Some(DupError::InvalidInput(_))));
        assert_eq!(bench.gate.unmount_calls(), 0);
    }

    #[test]
    fn restore_of_missing_image_is_invalid_input() {
        let bench = Bench::new(SimulatedGate::new());
        let device = bench.device(&pattern(100));
        let request = WorkflowRequest::restore(ImageRef::new(bench.path("none.img")), device);
        let outcome = bench.workflow().run(&request, |_| {});
        assert!(matches!(outcome.cause(), Some(DupError::InvalidInput(_))));
        assert_eq!(outcome.exit_code(), 1);
    }

    #[test]
    fn busy_device_stops_before_copy() {
        let gate = SimulatedGate::mounted();
        gate.set_busy(true);
        let bench = Bench::new(gate);
        let device = bench.device(&pattern(1000));
        let request = WorkflowRequest::capture(device, ImageRef::new(bench.path("out.img")));

        let outcome = bench.workflow().run(&request, |_| {});
        assert_eq!(outcome.disposition(), Disposition::Failed);
        assert_eq!(outcome.phase(), Phase::GateCheck);
        assert!(outcome.cause().is_some_and(DupError::is_device_busy));
        assert!(outcome.copy().is_none());
        assert!(!bench.path("out.img").exists());
    }

    #[test]
    fn forced_run_proceeds_with_warning() {
        let gate = SimulatedGate::mounted();
        gate.set_busy(true);
        let bench = Bench::new(gate);
        let data = pattern(3000);
        let device = bench.device(&data);
        let request = WorkflowRequest::capture(device, ImageRef::new(bench.path("out.img")))
            .with_force(true);

        let mut warnings = 0;
        let outcome = bench.workflow().run(&request, |event| {
            if matches!(event, WorkflowEvent::Warning(_)) {
                warnings += 1;
            }
        });
        assert!(outcome.success());
        assert_eq!(outcome.warnings().len(), 1);
        assert_eq!(warnings, 1);
    }

    #[test]
    fn concurrent_run_on_same_device_is_busy() {
        let bench = Bench::new(SimulatedGate::new());
        let device = bench.device(&pattern(100));
        let _held = DeviceLock::acquire(&bench.path("locks"), &device).unwrap();

        let request = WorkflowRequest::capture(device, ImageRef::new(bench.path("out.img")));
        let outcome = bench.workflow().run(&request, |_| {});
        assert!(outcome.cause().is_some_and(DupError::is_device_busy));
        assert!(outcome.cause().is_some_and(DupError::is_device_locked));

        // Forcing only overrides mounted volumes, never another run's lock.
        let outcome = bench.workflow().run(&request.with_force(true), |_| {});
        assert_eq!(outcome.phase(), Phase::GateCheck);
        assert!(outcome.cause().is_some_and(DupError::is_device_locked));
        assert_eq!(bench.gate.unmount_calls(), 0);
    }

    #[test]
    fn cancelled_copy_is_distinguished() {
        let bench = Bench::new(SimulatedGate::new());
        let device = bench.device(&pattern(100_000));
        let request = WorkflowRequest::capture(device, ImageRef::new(bench.path("out.img")));

        let cancel = CancelToken::new();
        let workflow = DuplicationWorkflow::new(
            DupConfig {
                block_size: 4096,
                lock_dir: bench.path("locks"),
                ..DupConfig::default()
            },
            cancel.clone(),
        )
        .with_gate(bench.gate.clone());

        let outcome = workflow.run(&request, |event| {
            if let WorkflowEvent::CopyProgress { bytes } = event {
                if bytes >= 8192 {
                    cancel.cancel();
                }
            }
        });
        assert_eq!(outcome.disposition(), Disposition::Cancelled);
        assert_eq!(outcome.exit_code(), 130);
        assert!(outcome.cause().is_some_and(DupError::is_cancelled));
        assert!(outcome.bytes_transferred() < 100_000);
    }

    #[test]
    fn remount_failure_is_only_a_warning() {
        let gate = SimulatedGate::mounted();
        gate.set_remount_fails(true);
        let bench = Bench::new(gate);
        let data = pattern(5000);
        let image = bench.path("in.img");
        std::fs::write(&image, &data).unwrap();
        let device = bench.device(&vec![0u8; 8192]);

        let request = WorkflowRequest::restore(ImageRef::new(&image), device).with_remount(true);
        let outcome = bench.workflow().run(&request, |_| {});

        assert!(outcome.success(), "{:?}", outcome.cause());
        assert_eq!(bench.gate.mount_calls(), 1);
        assert!(outcome.warnings()[0].contains("remount failed"));
    }

    #[test]
    fn unmounted_device_is_not_remounted() {
        let bench = Bench::new(SimulatedGate::new());
        let device = bench.device(&pattern(6000));
        let request = WorkflowRequest::capture(device, ImageRef::new(bench.path("out.img")))
            .with_remount(true);

        let outcome = bench.workflow().run(&request, |_| {});
        assert!(outcome.success(), "{:?}", outcome.cause());
        assert_eq!(bench.gate.unmount_calls(), 1);
        assert_eq!(bench.gate.mount_calls(), 0);
        assert!(!bench.gate.is_mounted());
        assert!(outcome.warnings().is_empty());
    }

    #[test]
    fn forced_busy_device_is_not_remounted() {
        let gate = SimulatedGate::mounted();
        gate.set_busy(true);
        let bench = Bench::new(gate);
        let device = bench.device(&pattern(6000));
        let request = WorkflowRequest::capture(device, ImageRef::new(bench.path("out.img")))
            .with_force(true)
            .with_remount(true);

        let outcome = bench.workflow().run(&request, |_| {});
        assert!(outcome.success(), "{:?}", outcome.cause());
        assert_eq!(bench.gate.mount_calls(), 0);
        assert!(bench.gate.is_mounted());
    }

    #[test]
    fn restore_mismatch_recommends_recopy() {
        let bench = Bench::new(SimulatedGate::new());
        let data = pattern(4096 * 3);
        let image = bench.path("in.img");
        std::fs::write(&image, &data).unwrap();
        let device = bench.device(&vec![0u8; data.len()]);

        let wrong = Digest::of_bytes(b"something else", "release notes");
        let request = WorkflowRequest::restore(ImageRef::new(&image), device)
            .with_expected_digest(wrong);
        let outcome = bench.workflow().run(&request, |_| {});

        assert_eq!(outcome.disposition(), Disposition::Failed);
        assert_eq!(outcome.phase(), Phase::Verifying);
        assert!(outcome.recommend_recopy());
        assert!(matches!(
            outcome.cause(),
            Some(DupError::VerificationFailed { .. })
        ));
        // The copy itself went through.
        assert!(outcome.copy().is_some_and(CopyResult::succeeded));
    }

    #[test]
    fn backing_files_skip_the_device_size_check() {
        let bench = Bench::new(SimulatedGate::new());
        let image = bench.path("in.img");
        std::fs::write(&image, pattern(10_000)).unwrap();
        let device = bench.device(&[0u8; 512]);

        let request = WorkflowRequest::restore(ImageRef::new(&image), device);
        let outcome = bench.workflow().run(&request, |_| {});
        assert!(outcome.success(), "{:?}", outcome.cause());
    }
}
