// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;
use cr_pin_test::Config;
use hypervisor::SmramFormat;

/// Which hypervisor runs the guest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    Kvm,
    Model,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Backend::Kvm => write!(f, "kvm"),
            Backend::Model => write!(f, "model"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Backend, Self::Err> {
        match s {
            "kvm" => Ok(Backend::Kvm),
            "model" => Ok(Backend::Model),
            _ => Err(format!("invalid backend `{}` (expected kvm or model)", s)),
        }
    }
}

fn default_backend() -> Backend {
    Backend::Kvm
}

#[derive(FromArgs)]
/// cr_pin_test
pub struct Args {
    /// whether or not to print the debug messages
    #[argh(switch)]
    pub debug: bool,
    #[argh(subcommand)]
    pub command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
pub enum Command {
    Run(RunCommand),
    Status(StatusCommand),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
/// run the guest through every stage and check that the pinned bits survive SMM
pub struct RunCommand {
    /// hypervisor to use, kvm or model. (default: kvm)
    #[argh(option, default = "default_backend()")]
    pub backend: Backend,
    /// path to a JSON config file. Options given on the command line take precedence.
    #[argh(option)]
    pub cfg: Option<PathBuf>,
    /// save/restore cycles after every exit. (default: 1)
    #[argh(option)]
    pub cycles_per_stage: Option<usize>,
    /// inject an SMI from the host after this stage.
    #[argh(option)]
    pub inject_smi_after: Option<u8>,
    /// SMRAM save-state layout, amd64 or legacy32. (default: amd64)
    #[argh(option)]
    pub smram_format: Option<SmramFormat>,
    /// give up after this many exits. (default: 64)
    #[argh(option)]
    pub max_iterations: Option<usize>,
    /// don't let the guest raise an SMI on itself
    #[argh(switch)]
    pub no_self_smi: bool,
    /// fail unless /sys/hypervisor/pv_cr_pinning reports the interface as enabled
    #[argh(switch)]
    pub require_sysfs: bool,
    /// whether or not to print in json format
    #[argh(switch)]
    pub json: bool,
}

impl RunCommand {
    /// Builds the config from the `--cfg` file, if any, and the explicit options.
    pub fn config(&self) -> cr_pin_test::Result<Config> {
        let mut config = match &self.cfg {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(cycles) = self.cycles_per_stage {
            config.cycles_per_stage = cycles;
        }
        if let Some(stage) = self.inject_smi_after {
            config.inject_smi_after = Some(stage);
        }
        if let Some(format) = self.smram_format {
            config.smram_format = format;
        }
        if let Some(max) = self.max_iterations {
            config.max_iterations = max;
        }
        if self.no_self_smi {
            config.self_smi = false;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
/// report whether the kernel exposes the CR pinning interface
pub struct StatusCommand {
    /// path of the sysfs attribute. (default: /sys/hypervisor/pv_cr_pinning)
    #[argh(option)]
    pub sysfs_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::from_args(&["cr_pin_test"], args).unwrap()
    }

    #[test]
    fn run_defaults() {
        let args = parse(&["run"]);
        assert!(!args.debug);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.backend, Backend::Kvm);
                assert_eq!(run.config().unwrap(), Config::default());
            }
            Command::Status(_) => panic!("parsed as status"),
        }
    }

    #[test]
    fn explicit_options_override_defaults() {
        let args = parse(&[
            "--debug",
            "run",
            "--backend",
            "model",
            "--cycles-per-stage",
            "2",
            "--inject-smi-after",
            "3",
            "--smram-format",
            "legacy32",
            "--no-self-smi",
        ]);
        assert!(args.debug);
        let run = match args.command {
            Command::Run(run) => run,
            Command::Status(_) => panic!("parsed as status"),
        };
        assert_eq!(run.backend, Backend::Model);
        let config = run.config().unwrap();
        assert_eq!(config.cycles_per_stage, 2);
        assert_eq!(config.inject_smi_after, Some(3));
        assert_eq!(config.smram_format, SmramFormat::Legacy32);
        assert!(!config.self_smi);
    }

    #[test]
    fn bad_backend_is_rejected() {
        assert!(Args::from_args(&["cr_pin_test"], &["run", "--backend", "xen"]).is_err());
    }

    #[test]
    fn inject_after_non_ordinal_stage_is_rejected() {
        let run = match parse(&["run", "--inject-smi-after", "254"]).command {
            Command::Run(run) => run,
            Command::Status(_) => panic!("parsed as status"),
        };
        assert!(matches!(
            run.config(),
            Err(cr_pin_test::Error::InjectStage(0xfe))
        ));
    }
}
