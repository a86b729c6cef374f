//! Module availability gate.
//!
//! Bring-up rigs often lack some modules. Steps addressed to a disabled module are
//! skipped: they take no time, send nothing and report `NoError`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::config::GateConfig;
use crate::error::MasterError;

/// Module tag as written in command descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleTag {
    /// `kn`
    #[serde(rename = "kn")]
    Kneader,
    /// `ds`
    #[serde(rename = "ds")]
    Dispenser,
    /// `vt`
    #[serde(rename = "vt")]
    VerticalTray,
    /// `wp`
    #[serde(rename = "wp")]
    WedgePress,
    /// `kr`
    #[serde(rename = "kr")]
    Kicker,
    /// `ht`
    #[serde(rename = "ht")]
    Heater,
    /// `fan`, served by the heater module.
    #[serde(rename = "fan")]
    Fan,
    /// `sleep`, a timed pause with no module behind it.
    #[serde(rename = "sleep")]
    Sleep,
}

impl ModuleTag {
    /// Every tag, in descriptor order.
    pub const ALL: [ModuleTag; 8] = [
        ModuleTag::Kneader,
        ModuleTag::Dispenser,
        ModuleTag::VerticalTray,
        ModuleTag::WedgePress,
        ModuleTag::Kicker,
        ModuleTag::Heater,
        ModuleTag::Fan,
        ModuleTag::Sleep,
    ];

    /// Tag as written in recipes.
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleTag::Kneader => "kn",
            ModuleTag::Dispenser => "ds",
            ModuleTag::VerticalTray => "vt",
            ModuleTag::WedgePress => "wp",
            ModuleTag::Kicker => "kr",
            ModuleTag::Heater => "ht",
            ModuleTag::Fan => "fan",
            ModuleTag::Sleep => "sleep",
        }
    }
}

impl fmt::Display for ModuleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleTag {
    type Err = MasterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModuleTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| MasterError::Recipe(format!("unknown module '{}'", s)))
    }
}

/// Which modules the sequencer may drive, and whether sleep steps actually sleep.
#[derive(Debug, Clone)]
pub struct ModuleGate {
    disabled: HashSet<ModuleTag>,
    sleep_enabled: bool,
}

impl Default for ModuleGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleGate {
    /// Every module available, sleeps enabled.
    pub fn new() -> Self {
        Self {
            disabled: HashSet::new(),
            sleep_enabled: true,
        }
    }

    /// Gate with the modules listed in `config` disabled.
    pub fn from_config(config: &GateConfig) -> Self {
        let mut gate = Self::new();
        gate.disable_modules(&config.disabled);
        gate
    }

    /// Disables every module in `tags`.
    pub fn disable_modules(&mut self, tags: &[ModuleTag]) {
        self.disabled.extend(tags.iter().copied());
    }

    /// Disables `tag`.
    pub fn disable(&mut self, tag: ModuleTag) {
        self.disabled.insert(tag);
    }

    /// When false, sleep steps are skipped like a disabled module.
    pub fn set_sleep_enabled(&mut self, enabled: bool) {
        self.sleep_enabled = enabled;
    }

    /// Whether sleep steps run.
    pub fn sleep_enabled(&self) -> bool {
        self.sleep_enabled
    }

    /// True when steps for `tag` should run.
    pub fn is_available(&self, tag: ModuleTag) -> bool {
        if tag == ModuleTag::Sleep && !self.sleep_enabled {
            return false;
        }
        !self.disabled.contains(&tag)
    }
}
