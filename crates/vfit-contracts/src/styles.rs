use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Qualitative drape tightness for the generated fitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStyle {
    Tight,
    #[default]
    Standard,
    Loose,
}

impl FitStyle {
    pub const ALL: [FitStyle; 3] = [FitStyle::Tight, FitStyle::Standard, FitStyle::Loose];

    pub fn as_str(&self) -> &'static str {
        match self {
            FitStyle::Tight => "Tight",
            FitStyle::Standard => "Standard",
            FitStyle::Loose => "Loose",
        }
    }

    /// Prompt fragment describing how the garment should drape.
    pub fn drape_instruction(&self) -> &'static str {
        match self {
            FitStyle::Tight => "a tight, form-fitting drape that follows the body closely",
            FitStyle::Standard => "a standard, true-to-size drape",
            FitStyle::Loose => "a loose, relaxed, oversized drape",
        }
    }
}

impl fmt::Display for FitStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FitStyle {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tight" => Ok(FitStyle::Tight),
            "standard" => Ok(FitStyle::Standard),
            "loose" => Ok(FitStyle::Loose),
            other => Err(format!(
                "Unknown fit style '{other}'. Valid styles: tight, standard, loose."
            )),
        }
    }
}

/// Optional background/styling theme applied to the composite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenePreset {
    pub name: String,
    pub scene_instruction: String,
}

/// Insertion-ordered registry of the built-in scene presets.
#[derive(Debug, Clone)]
pub struct ScenePresetRegistry {
    presets: IndexMap<String, ScenePreset>,
}

impl ScenePresetRegistry {
    pub fn builtin() -> Self {
        let mut presets = IndexMap::new();
        for (name, scene) in [
            ("studio", "a clean professional photo studio with soft even lighting"),
            ("street", "a candid urban street scene with natural daylight"),
            ("beach", "a bright seaside boardwalk at golden hour"),
            ("runway", "a fashion runway with dramatic spotlights"),
            ("garden", "a lush garden backdrop with dappled sunlight"),
        ] {
            presets.insert(
                name.to_string(),
                ScenePreset {
                    name: name.to_string(),
                    scene_instruction: scene.to_string(),
                },
            );
        }
        Self { presets }
    }

    pub fn get(&self, name: &str) -> Option<&ScenePreset> {
        self.presets.get(name.trim().to_ascii_lowercase().as_str())
    }

    pub fn resolve(&self, name: &str) -> Result<ScenePreset, String> {
        self.get(name).cloned().ok_or_else(|| {
            format!(
                "Unknown scene preset '{}'. Valid presets: {}.",
                name.trim(),
                self.names().join(", ")
            )
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.presets.keys().cloned().collect()
    }
}

impl Default for ScenePresetRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
