use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptsConfig {
    #[serde(default = "ScriptsConfig::default_root")]
    pub root: PathBuf,
    #[serde(default = "ScriptsConfig::default_extension")]
    pub extension: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub use_notify: bool,
    #[serde(default = "ScriptsConfig::default_notify_rescan_interval")]
    pub notify_rescan_interval: u32,
    #[serde(default)]
    pub debug_symbols: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReloadConfig {
    #[serde(default)]
    pub call_destroy_on_reload: bool,
    #[serde(default = "ReloadConfig::default_max_recorded_errors")]
    pub max_recorded_errors: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "LimitsConfig::default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "LimitsConfig::default_max_call_levels")]
    pub max_call_levels: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HarnessEntity {
    pub name: String,
    #[serde(default)]
    pub behaviours: Vec<String>,
    #[serde(default)]
    pub translation: Option<[f32; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    #[serde(default = "HarnessConfig::default_fixed_dt")]
    pub fixed_dt: f32,
    #[serde(default = "HarnessConfig::default_frames")]
    pub frames: u64,
    #[serde(default)]
    pub entities: Vec<HarnessEntity>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub reload: ReloadConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub harness: HarnessConfig,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigOverrides {
    pub scripts_root: Option<PathBuf>,
    pub frames: Option<u64>,
    pub fixed_dt: Option<f32>,
    pub debug_symbols: Option<bool>,
}

impl ScriptsConfig {
    fn default_root() -> PathBuf {
        PathBuf::from("assets/scripts")
    }

    fn default_extension() -> String {
        "ks".to_string()
    }

    const fn default_notify_rescan_interval() -> u32 {
        120
    }
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            extension: Self::default_extension(),
            recursive: false,
            use_notify: false,
            notify_rescan_interval: Self::default_notify_rescan_interval(),
            debug_symbols: false,
        }
    }
}

impl ReloadConfig {
    const fn default_max_recorded_errors() -> usize {
        100
    }
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self { call_destroy_on_reload: false, max_recorded_errors: Self::default_max_recorded_errors() }
    }
}

impl LimitsConfig {
    const fn default_max_operations() -> u64 {
        500_000
    }

    const fn default_max_call_levels() -> usize {
        64
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_operations: Self::default_max_operations(), max_call_levels: Self::default_max_call_levels() }
    }
}

impl HarnessConfig {
    const fn default_fixed_dt() -> f32 {
        1.0 / 60.0
    }

    const fn default_frames() -> u64 {
        600
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self { fixed_dt: Self::default_fixed_dt(), frames: Self::default_frames(), entities: Vec::new() }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &RuntimeConfigOverrides) {
        if let Some(root) = &overrides.scripts_root {
            self.scripts.root = root.clone();
        }
        if let Some(frames) = overrides.frames {
            self.harness.frames = frames;
        }
        if let Some(dt) = overrides.fixed_dt {
            self.harness.fixed_dt = dt;
        }
        if let Some(debug_symbols) = overrides.debug_symbols {
            self.scripts.debug_symbols = debug_symbols;
        }
    }
}

impl RuntimeConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.scripts_root.is_none() && self.frames.is_none() && self.fixed_dt.is_none() && self.debug_symbols.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.scripts_root.is_some() {
            fields.push("scripts");
        }
        if self.frames.is_some() {
            fields.push("frames");
        }
        if self.fixed_dt.is_some() {
            fields.push("dt");
        }
        if self.debug_symbols.is_some() {
            fields.push("debug-symbols");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").expect("parse empty config");
        assert_eq!(cfg.scripts.root, PathBuf::from("assets/scripts"));
        assert_eq!(cfg.scripts.extension, "ks");
        assert!(!cfg.reload.call_destroy_on_reload);
        assert_eq!(cfg.limits.max_call_levels, 64);
        assert!(cfg.harness.entities.is_empty());
    }

    #[test]
    fn partial_sections_fill_missing_fields() {
        let cfg: RuntimeConfig = serde_json::from_str(
            r#"{
                "scripts": { "root": "behaviours", "recursive": true },
                "harness": { "frames": 10, "entities": [{ "name": "wheel", "behaviours": ["Spinner"] }] }
            }"#,
        )
        .expect("parse config");
        assert_eq!(cfg.scripts.root, PathBuf::from("behaviours"));
        assert!(cfg.scripts.recursive);
        assert_eq!(cfg.scripts.extension, "ks");
        assert_eq!(cfg.harness.frames, 10);
        assert_eq!(cfg.harness.entities[0].behaviours, vec!["Spinner".to_string()]);
    }

    #[test]
    fn overrides_replace_selected_fields() {
        let mut cfg = RuntimeConfig::default();
        let overrides = RuntimeConfigOverrides {
            scripts_root: Some(PathBuf::from("other")),
            frames: Some(3),
            fixed_dt: None,
            debug_symbols: Some(true),
        };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.scripts.root, PathBuf::from("other"));
        assert_eq!(cfg.harness.frames, 3);
        assert!(cfg.scripts.debug_symbols);
        assert_eq!(overrides.applied_fields(), vec!["scripts", "frames", "debug-symbols"]);
    }
}
