//! Machine-readable run reports for `--json`.
use blkdup_core::{WorkflowOutcome, WorkflowRequest};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct VerificationReport {
    pub source_digest: String,
    pub destination_digest: Option<String>,
    pub matched: bool,
    pub retries: u32,
}

#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub direction: String,
    pub device: &'a str,
    pub image: &'a Path,
    pub image_format: &'static str,
    pub disposition: String,
    pub exit_code: i32,
    pub phase: String,
    pub bytes_transferred: u64,
    pub elapsed_secs: Option<f64>,
    pub throughput_bytes_per_sec: Option<f64>,
    pub verification: Option<VerificationReport>,
    pub error: Option<ErrorReport>,
    pub warnings: &'a [String],
    pub recommend_recopy: bool,
}

impl<'a> RunReport<'a> {
    pub fn new(request: &'a WorkflowRequest, outcome: &'a WorkflowOutcome) -> Self {
        let copy = outcome.copy();
        Self {
            direction: outcome.direction().to_string(),
            device: request.device.identifier(),
            image: request.image.path(),
            image_format: request.image.format().as_str(),
            disposition: outcome.disposition().to_string(),
            exit_code: outcome.exit_code(),
            phase: outcome.phase().to_string(),
            bytes_transferred: outcome.bytes_transferred(),
            elapsed_secs: copy.map(|c| c.elapsed().as_secs_f64()),
            throughput_bytes_per_sec: copy.map(|c| c.throughput()),
            verification: outcome.verification().map(|v| VerificationReport {
                source_digest: v.source().to_hex(),
                destination_digest: v.destination().map(|d| d.to_hex()),
                matched: v.matched(),
                retries: v.retries(),
            }),
            error: outcome.cause().map(|e| ErrorReport {
                kind: e.kind(),
                message: e.to_string(),
            }),
            warnings: outcome.warnings(),
            recommend_recopy: outcome.recommend_recopy(),
        }
    }
}

/// The `hash` subcommand's JSON output.
#[derive(Debug, Serialize)]
pub struct DigestReport<'a> {
    pub path: &'a Path,
    pub kind: &'static str,
    pub sha256: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use blkdup_core::gate::SimulatedGate;
    use blkdup_core::{
        CancelToken, DeviceNaming, DeviceRef, Digest, DupConfig, DuplicationWorkflow, ImageRef,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    fn run(request: &WorkflowRequest, dir: &Path) -> WorkflowOutcome {
        let config = DupConfig {
            block_size: 4096,
            settle_delay_ms: 0,
            lock_dir: dir.join("locks"),
            ..DupConfig::default()
        };
        DuplicationWorkflow::new(config, CancelToken::new())
            .with_gate(Arc::new(SimulatedGate::new()))
            .run(request, |_| {})
    }

    fn device(dir: &Path, bytes: &[u8]) -> DeviceRef {
        let backing = dir.join("sdk.dev");
        std::fs::write(&backing, bytes).unwrap();
        DeviceRef::parse_with(DeviceNaming::Linux, "sdk")
            .unwrap()
            .with_backing_path(backing)
    }

    #[test]
    fn successful_capture_report() {
        let dir = TempDir::new().unwrap();
        let data = vec![0x5A; 10_000];
        let request =
            WorkflowRequest::capture(device(dir.path(), &data), ImageRef::new(dir.path().join("a.img")));
        let outcome = run(&request, dir.path());

        let json = serde_json::to_value(RunReport::new(&request, &outcome)).unwrap();
        assert_eq!(json["direction"], "capture");
        assert_eq!(json["device"], "sdk");
        assert_eq!(json["image_format"], "img");
        assert_eq!(json["disposition"], "success");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["bytes_transferred"], 10_000);
        assert_eq!(json["verification"]["matched"], true);
        assert_eq!(
            json["verification"]["source_digest"],
            Digest::of_bytes(&data, "data").to_hex()
        );
        assert!(json["error"].is_null());
    }

    #[test]
    fn failed_restore_report_carries_the_error_kind() {
        let dir = TempDir::new().unwrap();
        let image = dir.path().join("in.bin");
        std::fs::write(&image, [1u8; 2048]).unwrap();
        let request = WorkflowRequest::restore(ImageRef::new(&image), device(dir.path(), &[0; 2048]))
            .with_expected_digest(Digest::of_bytes(b"other", "recorded"));
        let outcome = run(&request, dir.path());

        let json = serde_json::to_value(RunReport::new(&request, &outcome)).unwrap();
        assert_eq!(json["disposition"], "failed");
        assert_eq!(json["exit_code"], 1);
        assert_eq!(json["phase"], "verifying");
        assert_eq!(json["error"]["kind"], "verification_failed");
        assert_eq!(json["recommend_recopy"], true);
        assert_eq!(json["verification"]["matched"], false);
    }
}
