// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs the SMM control register pinning conformance test.

mod args;

use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use args::Args;
use args::Backend;
use args::Command;
use args::RunCommand;
use args::StatusCommand;
use cr_pin_test::guest::cr_pinning_program;
use cr_pin_test::sysfs::read_pv_cr_pinning;
use cr_pin_test::sysfs::PV_CR_PINNING_PATH;
use cr_pin_test::Config;
use cr_pin_test::RunReport;
use hypervisor::model::ModelHypervisor;
use log::info;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run_kvm(config: &Config, program: &[u8]) -> Result<RunReport> {
    use hypervisor::kvm::KvmHypervisor;
    use hypervisor::MSR_KVM_CR0_PINNED;
    use hypervisor::MSR_KVM_CR4_PINNED;

    config.check_kvm()?;
    let hv = KvmHypervisor::new().context("failed to open kvm")?;
    if !hv.supports_smm() {
        bail!("kvm does not support SMM");
    }
    for msr in [MSR_KVM_CR0_PINNED, MSR_KVM_CR4_PINNED] {
        if !hv.supports_msr(msr) {
            bail!("kvm does not support CR pinning (msr {:#x} missing)", msr);
        }
    }
    Ok(cr_pin_test::run(&hv, config, program)?)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn run_kvm(_config: &Config, _program: &[u8]) -> Result<RunReport> {
    bail!("the kvm backend is only available on x86_64 linux");
}

fn run(cmd: RunCommand) -> Result<()> {
    if cmd.require_sysfs {
        match read_pv_cr_pinning(Path::new(PV_CR_PINNING_PATH))? {
            Some(true) => {}
            Some(false) => bail!("{} reports CR pinning as disabled", PV_CR_PINNING_PATH),
            None => bail!("{} is not available", PV_CR_PINNING_PATH),
        }
    }
    let config = cmd.config().context("invalid configuration")?;
    let program = cr_pinning_program(&config.program_options());
    info!("running on {} backend", cmd.backend);

    let report = match cmd.backend {
        Backend::Kvm => run_kvm(&config, &program)?,
        Backend::Model => {
            let hv = ModelHypervisor::new(config.model_config());
            cr_pin_test::run(&hv, &config, &program).context("model run failed")?
        }
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "PASS: {} stage reports, {} SMM entries, {} save/restore cycles",
            report.stages.len(),
            report.smm_entries,
            report.cycles
        );
        println!(
            "final cr0 {:#x} cr4 {:#x}",
            report.final_cr0, report.final_cr4
        );
    }
    Ok(())
}

fn status(cmd: StatusCommand) -> Result<()> {
    let path = cmd
        .sysfs_path
        .unwrap_or_else(|| Path::new(PV_CR_PINNING_PATH).to_path_buf());
    let state = match read_pv_cr_pinning(&path)? {
        Some(true) => "enabled",
        Some(false) => "disabled",
        None => "unavailable",
    };
    println!("pv_cr_pinning: {}", state);
    Ok(())
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let level = if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter(None, level)
        .init();

    match args.command {
        Command::Run(cmd) => run(cmd),
        Command::Status(cmd) => status(cmd),
    }
}
