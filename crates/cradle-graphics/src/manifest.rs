use crate::GraphicsError;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// The driver families Cradle knows how to blend into a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DriverKind {
    VulkanIcd,
    VulkanExplicitLayer,
    VulkanImplicitLayer,
    EglIcd,
    EglExternalPlatform,
    Vdpau,
    Dri,
    VaApi,
    OpenXr,
}

impl DriverKind {
    /// Whether drivers of this kind are described by JSON manifests (as
    /// opposed to bare `.so` files found by directory convention).
    pub fn is_json_based(self) -> bool {
        !matches!(self, Self::Vdpau | Self::Dri | Self::VaApi)
    }

    /// Subdirectory of the overrides library directory that absolute-path
    /// drivers of this kind are captured into.
    pub fn capture_dir_name(self) -> &'static str {
        match self {
            Self::VulkanIcd => "vulkan",
            Self::VulkanExplicitLayer => "vulkan-explicit-layer",
            Self::VulkanImplicitLayer => "vulkan-implicit-layer",
            Self::EglIcd => "glvnd",
            Self::EglExternalPlatform => "egl-platform",
            Self::Vdpau => "vdpau",
            Self::Dri => "dri",
            Self::VaApi => "va-api",
            Self::OpenXr => "openxr",
        }
    }

    /// Subdirectory of `share/` where rewritten manifests of this kind are
    /// emitted, mirroring the upstream loader's layout.
    pub fn manifest_dir_name(self) -> Option<&'static str> {
        match self {
            Self::VulkanIcd => Some("vulkan/icd.d"),
            Self::VulkanExplicitLayer => Some("vulkan/explicit_layer.d"),
            Self::VulkanImplicitLayer => Some("vulkan/implicit_layer.d"),
            Self::EglIcd => Some("glvnd/egl_vendor.d"),
            Self::EglExternalPlatform => Some("egl/egl_external_platform.d"),
            Self::OpenXr => Some("openxr/1"),
            Self::Vdpau | Self::Dri | Self::VaApi => None,
        }
    }

    /// Directories, relative to a provider root, searched for JSON
    /// manifests of this kind, in loader precedence order.
    pub fn manifest_search_dirs(self) -> &'static [&'static str] {
        match self {
            Self::VulkanIcd => &[
                "etc/vulkan/icd.d",
                "usr/share/vulkan/icd.d",
                "usr/local/share/vulkan/icd.d",
            ],
            Self::VulkanExplicitLayer => &[
                "etc/vulkan/explicit_layer.d",
                "usr/share/vulkan/explicit_layer.d",
            ],
            Self::VulkanImplicitLayer => &[
                "etc/vulkan/implicit_layer.d",
                "usr/share/vulkan/implicit_layer.d",
            ],
            Self::EglIcd => &["usr/share/glvnd/egl_vendor.d", "etc/glvnd/egl_vendor.d"],
            Self::EglExternalPlatform => &[
                "usr/share/egl/egl_external_platform.d",
                "etc/egl/egl_external_platform.d",
            ],
            Self::OpenXr => &["usr/share/openxr/1", "etc/openxr/1"],
            Self::Vdpau | Self::Dri | Self::VaApi => &[],
        }
    }

    /// The JSON object key holding the member with `library_path`.
    fn json_section(self) -> Option<&'static str> {
        match self {
            Self::VulkanIcd | Self::EglIcd | Self::EglExternalPlatform => Some("ICD"),
            Self::VulkanExplicitLayer | Self::VulkanImplicitLayer => Some("layer"),
            Self::OpenXr => Some("runtime"),
            Self::Vdpau | Self::Dri | Self::VaApi => None,
        }
    }

    /// Whether the loader identifies drivers of this kind by name rather
    /// than by manifest path (Vulkan layers), which changes the filename
    /// scheme used when emitting rewritten manifests.
    pub fn is_name_identified(self) -> bool {
        matches!(self, Self::VulkanExplicitLayer | Self::VulkanImplicitLayer)
    }
}

/// A JSON driver manifest, kept as a raw value so a rewrite touches only
/// the `library_path` field and everything else survives byte-for-byte
/// (modulo formatting).
#[derive(Debug, Clone)]
pub struct DriverManifest {
    kind: DriverKind,
    path: PathBuf,
    json: Value,
    parse_error: Option<String>,
}

impl DriverManifest {
    pub fn load(kind: DriverKind, path: &Path) -> Self {
        let (json, parse_error) = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(json) => (json, None),
                Err(e) => (Value::Null, Some(e.to_string())),
            },
            Err(e) => (Value::Null, Some(e.to_string())),
        };
        Self {
            kind,
            path: path.to_owned(),
            json,
            parse_error,
        }
    }

    pub fn from_value(kind: DriverKind, path: impl Into<PathBuf>, json: Value) -> Self {
        Self {
            kind,
            path: path.into(),
            json,
            parse_error: None,
        }
    }

    #[inline]
    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    /// Where the manifest was found in the provider (current namespace).
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether loading or parsing failed; such drivers are excluded with a
    /// diagnostic, not fatal.
    pub fn parse_error(&self) -> Option<&str> {
        self.parse_error.as_deref()
    }

    #[inline]
    pub fn json(&self) -> &Value {
        &self.json
    }

    /// The declared library reference: an absolute or relative path, or a
    /// bare SONAME. `None` for aggregation-only layers (meta-layers) and
    /// unparsable manifests.
    pub fn library_path(&self) -> Option<&str> {
        let section = self.kind.json_section()?;
        self.json
            .get(section)?
            .get("library_path")?
            .as_str()
    }

    /// The layer name, for name-identified kinds.
    pub fn layer_name(&self) -> Option<&str> {
        self.json.get("layer")?.get("name")?.as_str()
    }

    /// A copy of this manifest with `library_path` replaced. Everything
    /// else, including fields this code knows nothing about, is preserved.
    pub fn with_library_path(&self, new_path: &str) -> Option<Self> {
        let section = self.kind.json_section()?;
        let mut json = self.json.clone();
        let member = json.get_mut(section)?.as_object_mut()?;
        member.insert(
            "library_path".to_owned(),
            Value::String(new_path.to_owned()),
        );
        Some(Self {
            kind: self.kind,
            path: self.path.clone(),
            json,
            parse_error: None,
        })
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, GraphicsError> {
        let mut bytes =
            serde_json::to_vec_pretty(&self.json).map_err(|source| GraphicsError::Json {
                path: self.path.clone(),
                source,
            })?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VULKAN_ICD: &str = r#"{
        "file_format_version": "1.0.0",
        "ICD": {
            "library_path": "/usr/lib/x86_64-linux-gnu/libvulkan_radeon.so",
            "api_version": "1.3.230",
            "is_portability_driver": false
        }
    }"#;

    const META_LAYER: &str = r#"{
        "file_format_version": "1.1.2",
        "layer": {
            "name": "VK_LAYER_MESA_device_select",
            "component_layers": ["VK_LAYER_a", "VK_LAYER_b"]
        }
    }"#;

    fn manifest(kind: DriverKind, content: &str) -> DriverManifest {
        DriverManifest::from_value(
            kind,
            "/provider/manifest.json",
            serde_json::from_str(content).unwrap(),
        )
    }

    #[test]
    fn reads_library_path_per_kind() {
        let m = manifest(DriverKind::VulkanIcd, VULKAN_ICD);
        assert_eq!(
            m.library_path(),
            Some("/usr/lib/x86_64-linux-gnu/libvulkan_radeon.so")
        );
    }

    #[test]
    fn meta_layer_has_no_library_path() {
        let m = manifest(DriverKind::VulkanImplicitLayer, META_LAYER);
        assert_eq!(m.library_path(), None);
        assert_eq!(m.layer_name(), Some("VK_LAYER_MESA_device_select"));
    }

    #[test]
    fn rewrite_touches_only_library_path() {
        let m = manifest(DriverKind::VulkanIcd, VULKAN_ICD);
        let rewritten = m
            .with_library_path("/overrides/lib/x86_64-linux-gnu/vulkan/libvulkan_radeon.so")
            .unwrap();

        assert_eq!(
            rewritten.library_path(),
            Some("/overrides/lib/x86_64-linux-gnu/vulkan/libvulkan_radeon.so")
        );
        // Every other field is unchanged.
        assert_eq!(
            rewritten.json()["ICD"]["api_version"],
            m.json()["ICD"]["api_version"]
        );
        assert_eq!(
            rewritten.json()["file_format_version"],
            m.json()["file_format_version"]
        );
        assert_eq!(
            rewritten.json()["ICD"]["is_portability_driver"],
            serde_json::Value::Bool(false)
        );
    }

    #[test]
    fn rewrite_round_trips_through_serialization() {
        let m = manifest(DriverKind::VulkanIcd, VULKAN_ICD);
        let rewritten = m.with_library_path("libvulkan_radeon.so").unwrap();
        let bytes = rewritten.to_json_bytes().unwrap();
        let reparsed: Value = serde_json::from_slice(&bytes).unwrap();

        let mut expected = m.json().clone();
        expected["ICD"]["library_path"] = Value::String("libvulkan_radeon.so".to_owned());
        assert_eq!(reparsed, expected);
    }

    #[test]
    fn load_records_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let m = DriverManifest::load(DriverKind::VulkanIcd, &path);
        assert!(m.parse_error().is_some());
        assert_eq!(m.library_path(), None);
    }

    #[test]
    fn json_based_partition() {
        assert!(DriverKind::VulkanIcd.is_json_based());
        assert!(DriverKind::OpenXr.is_json_based());
        assert!(!DriverKind::Dri.is_json_based());
        assert!(!DriverKind::Vdpau.is_json_based());
        assert!(!DriverKind::VaApi.is_json_based());
    }
}
