// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs;
use std::path::Path;

use hypervisor::model::ModelConfig;
use hypervisor::SmramFormat;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::guest::ProgramOptions;
use crate::stage::Stage;

pub const DEFAULT_MAX_ITERATIONS: usize = 64;

/// Knobs of a harness run. Also the schema of the `--cfg` file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Save/restore cycles after every exit. More than one also checks that a cycle leaves the
    /// registers untouched.
    pub cycles_per_stage: usize,
    /// Ordinal stage after which the host injects an SMI.
    pub inject_smi_after: Option<u8>,
    /// Exits to handle before giving up on the guest.
    pub max_iterations: usize,
    /// Save-state layout used to find the control register images in SMRAM.
    pub smram_format: SmramFormat,
    /// Whether the guest raises an SMI on itself after pinning.
    pub self_smi: bool,
    /// Settings of the software vcpu, used with the model backend.
    pub model: ModelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cycles_per_stage: 1,
            inject_smi_after: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            smram_format: SmramFormat::default(),
            self_smi: true,
            model: ModelConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let name = path.display().to_string();
        let contents = fs::read_to_string(path).map_err(|e| Error::ConfigFile(name.clone(), e))?;
        let config: Config =
            serde_json::from_str(&contents).map_err(|e| Error::ConfigParse(name, e))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would silently weaken the run.
    pub fn validate(&self) -> Result<()> {
        if let Some(stage) = self.inject_smi_after {
            if Stage::n(stage).is_none() {
                return Err(Error::InjectStage(stage));
            }
        }
        Ok(())
    }

    /// KVM always saves a 64-bit guest in the AMD64 format, so any other layout would tamper with
    /// unrelated bytes.
    pub fn check_kvm(&self) -> Result<()> {
        if self.smram_format != SmramFormat::Amd64 {
            return Err(Error::UnsupportedSmramFormat(self.smram_format));
        }
        Ok(())
    }

    /// Model settings with the save-state layout the harness tampers with.
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            smram_format: self.smram_format,
            ..self.model.clone()
        }
    }

    pub fn program_options(&self) -> ProgramOptions {
        ProgramOptions {
            self_smi: self.self_smi,
            ..Default::default()
        }
    }
}
