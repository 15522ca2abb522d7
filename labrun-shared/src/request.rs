use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::dut::DutModel;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProvisionState {
    /// e.g. `gs://chromeos-image-archive/betty-release/R120-15662.0.0`
    #[serde(default)]
    pub system_image_path: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub prevent_reboot: bool,
}

/// One requested device role (primary or companion).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceRequest {
    pub dut_model: DutModel,
    #[serde(default)]
    pub provision_state: Option<ProvisionState>,
    /// Selects the service images for this device in `container_images`.
    #[serde(default)]
    pub container_metadata_key: String,
}

impl DeviceRequest {
    pub fn board(&self) -> &str {
        &self.dut_model.build_target
    }

    pub fn model(&self) -> &str {
        &self.dut_model.model_name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TestSuite {
    pub name: String,
    #[serde(default)]
    pub test_case_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tags_excluded: Vec<String>,
}

impl TestSuite {
    /// Suites given by tags still need the test finder to expand them.
    pub fn needs_expansion(&self) -> bool {
        self.test_case_ids.is_empty() && !self.tags.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerImage {
    pub repository: String,
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub digest: Option<String>,
}

impl ContainerImage {
    pub fn reference(&self) -> String {
        let base = format!("{}/{}", self.repository.trim_end_matches('/'), self.name);
        match (&self.digest, self.tag.is_empty()) {
            (Some(digest), _) => format!("{base}@{digest}"),
            (None, false) => format!("{base}:{}", self.tag),
            (None, true) => format!("{base}:latest"),
        }
    }
}

/// Full description of one lab run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TestRequest {
    pub primary_dut: DeviceRequest,
    #[serde(default)]
    pub companion_duts: Vec<DeviceRequest>,
    #[serde(default)]
    pub test_suites: Vec<TestSuite>,
    /// container_metadata_key -> service name -> image
    #[serde(default)]
    pub container_images: HashMap<String, HashMap<String, ContainerImage>>,
    #[serde(default)]
    pub autotest_keyvals: BTreeMap<String, String>,
    #[serde(default)]
    pub parent_build_id: i64,
}

impl TestRequest {
    /// `<board>-<build-type>/R<milestone>-<version>` taken from the primary
    /// device's system image path.
    pub fn build_identifier(&self) -> Option<String> {
        let path = self
            .primary_dut
            .provision_state
            .as_ref()?
            .system_image_path
            .as_deref()?;
        let mut parts = path.trim_end_matches('/').rsplit('/');
        let version = parts.next().filter(|s| !s.is_empty())?;
        let bucket_dir = parts.next().filter(|s| !s.is_empty())?;
        if bucket_dir.starts_with("gs:") {
            return None;
        }
        Some(format!("{bucket_dir}/{version}"))
    }

    pub fn image_for(&self, metadata_key: &str, service: &str) -> Option<&ContainerImage> {
        self.container_images.get(metadata_key)?.get(service)
    }
}
