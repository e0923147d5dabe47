//! Digest comparison between the two sides of a finished copy.
//!
//! A device that was just written is often not readable straight away: the
//! media needs to settle and the OS may remount volumes it finds on it. The
//! destination digest therefore gets a bounded retry with a settle delay and a
//! fresh unmount in between. A digest that still cannot be obtained leaves the
//! result indeterminate; it is never reported as corruption.
use crate::cancel::CancelToken;
use crate::device::DeviceRef;
use crate::error::{DupError, Result};
use crate::gate::DeviceGate;
use crate::hash::{Digest, DigestSource, DigestSpec};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Where the reference digest comes from.
#[derive(Clone, Debug)]
pub enum DigestInput {
    /// A digest recorded earlier, e.g. published alongside an image.
    Recorded(Digest),
    /// Hash this source now.
    Compute(DigestSpec),
}

/// Which side of the comparison a progress report is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifySide {
    Source,
    Destination,
}

/// How often and how patiently the destination digest is retried.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub settle_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 1,
            settle_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerdictStatus {
    Match,
    Mismatch,
    /// The destination digest could not be obtained.
    Indeterminate,
}

/// The result of comparing the two digests.
#[derive(Clone, Debug)]
pub struct VerificationVerdict {
    source: Digest,
    destination: Option<Digest>,
    matched: bool,
    retries: u32,
    unresolved: Option<String>,
}

impl VerificationVerdict {
    pub fn source(&self) -> &Digest {
        &self.source
    }

    /// `None` when the destination digest could not be obtained.
    pub fn destination(&self) -> Option<&Digest> {
        self.destination.as_ref()
    }

    pub fn matched(&self) -> bool {
        self.matched
    }

    /// Retry attempts consumed obtaining the destination digest.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn status(&self) -> VerdictStatus {
        match (&self.destination, self.matched) {
            (_, true) => VerdictStatus::Match,
            (Some(_), false) => VerdictStatus::Mismatch,
            (None, false) => VerdictStatus::Indeterminate,
        }
    }

    /// The error describing a non-matching verdict.
    pub fn failure(&self) -> Option<DupError> {
        match self.status() {
            VerdictStatus::Match => None,
            VerdictStatus::Mismatch => Some(DupError::VerificationFailed {
                expected: self.source.to_hex(),
                actual: self
                    .destination
                    .as_ref()
                    .map(Digest::to_hex)
                    .unwrap_or_default(),
            }),
            VerdictStatus::Indeterminate => Some(DupError::VerificationIndeterminate {
                attempts: self.retries + 1,
                reason: self.unresolved.clone().unwrap_or_default(),
            }),
        }
    }
}

/// Runs the hasher against both sides and compares the results.
pub struct VerificationCoordinator<'a> {
    hasher: &'a dyn DigestSource,
    gate: &'a dyn DeviceGate,
    policy: RetryPolicy,
}

impl<'a> VerificationCoordinator<'a> {
    pub fn new(hasher: &'a dyn DigestSource, gate: &'a dyn DeviceGate, policy: RetryPolicy) -> Self {
        Self {
            hasher,
            gate,
            policy,
        }
    }

    /// Obtains the source digest, then the destination digest, and compares.
    ///
    /// `dest_device` names the device behind `dest`, if any; it is unmounted
    /// again before a retry. Errors are returned for cancellation and for a
    /// source digest that cannot be computed. An unobtainable destination
    /// digest yields an indeterminate verdict instead.
    pub fn verify(
        &self,
        source: &DigestInput,
        dest: &DigestSpec,
        dest_device: Option<&DeviceRef>,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(VerifySide, u64),
    ) -> Result<VerificationVerdict> {
        let source = match source {
            DigestInput::Recorded(digest) => digest.clone(),
            DigestInput::Compute(spec) => self.hasher.compute_digest(spec, cancel, &mut |n| {
                on_progress(VerifySide::Source, n)
            })?,
        };
        info!(source = %source.source(), digest = %source, "Source digest ready");

        let mut retries = 0;
        loop {
            let attempt = self.hasher.compute_digest(dest, cancel, &mut |n| {
                on_progress(VerifySide::Destination, n)
            });

            match attempt {
                Ok(destination) => {
                    let matched = destination == source;
                    info!(destination = %destination.source(), digest = %destination, matched, "Destination digest ready");
                    return Ok(VerificationVerdict {
                        source,
                        destination: Some(destination),
                        matched,
                        retries,
                        unresolved: None,
                    });
                }
                Err(DupError::Cancelled) => return Err(DupError::Cancelled),
                Err(error) if retries < self.policy.retries => {
                    retries += 1;
                    warn!(error = %error, attempt = retries, "Destination digest failed, retrying after settle delay");
                    self.settle(dest_device, cancel)?;
                }
                Err(error) => {
                    warn!(error = %error, retries, "Destination digest unobtainable");
                    return Ok(VerificationVerdict {
                        source,
                        destination: None,
                        matched: false,
                        retries,
                        unresolved: Some(error.to_string()),
                    });
                }
            }
        }
    }

    fn settle(&self, device: Option<&DeviceRef>, cancel: &CancelToken) -> Result<()> {
        thread::sleep(self.policy.settle_delay);
        if let Some(device) = device {
            // A failure here surfaces through the next digest attempt.
            if let Err(error) = self.gate.ensure_unmounted(device) {
                warn!(device = %device, error = %error, "Unmount before retry failed");
            }
        }
        thread::sleep(self.policy.settle_delay);
        if cancel.is_cancelled() {
            return Err(DupError::Cancelled);
        }
        Ok(())
    }
}
