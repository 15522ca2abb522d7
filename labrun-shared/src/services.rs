//! Request/response payloads of the containerized services.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::any::{AnyMessage, TypeTagged};
use crate::dut::{Dut, IpEndpoint};
use crate::request::TestSuite;

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InstallRequest {
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub prevent_reboot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AnyMessage>,
}

impl TypeTagged for InstallRequest {
    const TYPE_URL: &'static str = "labrun.provision.InstallRequest";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallStatus {
    #[default]
    Unspecified,
    Success,
    InvalidRequest,
    DutUnreachablePreProvision,
    DownloadingImageFailed,
    ProvisioningTimedout,
    ProvisioningFailed,
    DutUnreachablePostProvision,
    UpdateFirmwareFailed,
}

impl InstallStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, InstallStatus::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStatus::Unspecified => "UNSPECIFIED",
            InstallStatus::Success => "SUCCESS",
            InstallStatus::InvalidRequest => "INVALID_REQUEST",
            InstallStatus::DutUnreachablePreProvision => "DUT_UNREACHABLE_PRE_PROVISION",
            InstallStatus::DownloadingImageFailed => "DOWNLOADING_IMAGE_FAILED",
            InstallStatus::ProvisioningTimedout => "PROVISIONING_TIMEDOUT",
            InstallStatus::ProvisioningFailed => "PROVISIONING_FAILED",
            InstallStatus::DutUnreachablePostProvision => "DUT_UNREACHABLE_POST_PROVISION",
            InstallStatus::UpdateFirmwareFailed => "UPDATE_FIRMWARE_FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InstallResponse {
    #[serde(default)]
    pub status: InstallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AnyMessage>,
}

impl TypeTagged for InstallResponse {
    const TYPE_URL: &'static str = "labrun.provision.InstallResponse";
}

// ---------------------------------------------------------------------------
// Test execution / discovery
// ---------------------------------------------------------------------------

/// A device as handed to the test execution service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestDevice {
    pub dut: Dut,
    pub dut_server: IpEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunTestsRequest {
    pub test_suites: Vec<TestSuite>,
    #[serde(default)]
    pub primary: Option<TestDevice>,
    #[serde(default)]
    pub companions: Vec<TestDevice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AnyMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail { reason: String },
    Crash { reason: String },
    Abort { reason: String },
    Skip { reason: String },
    NotRun { reason: String },
}

impl Verdict {
    /// Failures attributable to the product under test rather than the lab.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Verdict::Fail { .. } | Verdict::Crash { .. } | Verdict::Abort { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCaseResult {
    pub test_case_id: String,
    #[serde(flatten)]
    pub verdict: Verdict,
    #[serde(default)]
    pub result_dir_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunTestsResponse {
    #[serde(default)]
    pub test_case_results: Vec<TestCaseResult>,
}

impl TypeTagged for RunTestsResponse {
    const TYPE_URL: &'static str = "labrun.test.RunTestsResponse";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FindTestsRequest {
    pub test_suites: Vec<TestSuite>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FindTestsResponse {
    #[serde(default)]
    pub test_suites: Vec<TestSuite>,
}

impl TypeTagged for FindTestsResponse {
    const TYPE_URL: &'static str = "labrun.test.FindTestsResponse";
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PublishRequest {
    pub artifact_dir_path: String,
    #[serde(default)]
    pub test_response: Option<RunTestsResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<AnyMessage>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishStatus {
    #[default]
    Unspecified,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PublishResponse {
    #[serde(default)]
    pub status: PublishStatus,
    #[serde(default)]
    pub message: String,
}

impl TypeTagged for PublishResponse {
    const TYPE_URL: &'static str = "labrun.publish.PublishResponse";
}

// ---------------------------------------------------------------------------
// Generic services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GenericRequest {
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GenericResponse {
    #[serde(default)]
    pub payload: Value,
}

impl TypeTagged for GenericResponse {
    const TYPE_URL: &'static str = "labrun.generic.GenericResponse";
}

// ---------------------------------------------------------------------------
// VM leasing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    #[default]
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GceImage {
    pub name: String,
    pub project: String,
    #[serde(default)]
    pub status: ImageStatus,
    #[serde(default)]
    pub source_build: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LeaseVmRequest {
    pub image_name: String,
    pub image_project: String,
    pub board: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub machine_type: String,
    #[serde(default)]
    pub lease_duration_secs: u64,
}

impl TypeTagged for LeaseVmRequest {
    const TYPE_URL: &'static str = "labrun.vm.LeaseVmRequest";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LeaseVmResponse {
    pub lease_id: String,
    pub vm_address: IpEndpoint,
    /// Zone/region the VM was placed in; needed to release it.
    pub zone: String,
}

impl TypeTagged for LeaseVmResponse {
    const TYPE_URL: &'static str = "labrun.vm.LeaseVmResponse";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReleaseVmRequest {
    pub lease_id: String,
    pub zone: String,
    #[serde(default)]
    pub project: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReleaseVmResponse {
    #[serde(default)]
    pub lease_id: String,
}

impl TypeTagged for ReleaseVmResponse {
    const TYPE_URL: &'static str = "labrun.vm.ReleaseVmResponse";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_status_wire_names() {
        let json = serde_json::to_string(&InstallStatus::ProvisioningFailed).unwrap();
        assert_eq!(json, "\"PROVISIONING_FAILED\"");
        assert_eq!(InstallStatus::ProvisioningFailed.as_str(), "PROVISIONING_FAILED");
        assert!(!InstallStatus::Unspecified.is_success());
        assert!(InstallStatus::Success.is_success());
    }

    #[test]
    fn test_case_result_flattens_verdict() {
        let result: TestCaseResult = serde_json::from_str(
            r#"{"test_case_id":"tast.example.Fail","verdict":"fail","reason":"boom"}"#,
        )
        .unwrap();
        assert_eq!(
            result.verdict,
            Verdict::Fail {
                reason: "boom".into()
            }
        );
        assert!(result.verdict.is_failure());

        let pass: TestCaseResult =
            serde_json::from_str(r#"{"test_case_id":"tast.example.Pass","verdict":"pass"}"#)
                .unwrap();
        assert_eq!(pass.verdict, Verdict::Pass);
        assert!(
            !Verdict::Skip {
                reason: "n/a".into()
            }
            .is_failure()
        );
    }

    #[test]
    fn test_lease_request_packs_into_install_metadata() {
        let lease = LeaseVmRequest {
            image_name: "betty-release-r120".into(),
            image_project: "lab-images".into(),
            board: "betty".into(),
            ..Default::default()
        };
        let req = InstallRequest {
            metadata: Some(AnyMessage::pack(&lease).unwrap()),
            ..Default::default()
        };
        let back: LeaseVmRequest = req.metadata.unwrap().unpack().unwrap();
        assert_eq!(back, lease);
    }
}
