// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End to end runs of the harness against the software vcpu.

use cr_pin_test::guest::cr_pinning_program;
use cr_pin_test::guest::ProgramBuilder;
use cr_pin_test::guest::ProgramOptions;
use cr_pin_test::stage::DONE;
use cr_pin_test::stage::SMRAM_STAGE;
use cr_pin_test::Config;
use cr_pin_test::Error;
use cr_pin_test::RunReport;
use hypervisor::model::ModelConfig;
use hypervisor::model::ModelHypervisor;
use hypervisor::ControlRegister;
use hypervisor::SmramFormat;
use hypervisor::CR4_PINNABLE;
use hypervisor::X86_CR0_WP;

fn run_model(config: &Config, opts: &ProgramOptions) -> Result<RunReport, Error> {
    let hv = ModelHypervisor::new(config.model_config());
    cr_pin_test::run(&hv, config, &cr_pinning_program(opts))
}

fn run_default(config: &Config) -> Result<RunReport, Error> {
    run_model(config, &config.program_options())
}

fn with_model(model: ModelConfig) -> Config {
    Config {
        model,
        ..Default::default()
    }
}

#[test]
fn self_smi_cannot_unpin() {
    let report = run_default(&Config::default()).unwrap();
    assert_eq!(report.stages, vec![1, 2, 3, 4, 5, SMRAM_STAGE, DONE]);
    assert_eq!(report.smm_entries, 1);
    // One cycle per exit, except the final one.
    assert_eq!(report.cycles, 6);

    let cr0 = report.tampering[0];
    assert_eq!(cr0.reg, ControlRegister::Cr0);
    assert_eq!(cr0.before & X86_CR0_WP, X86_CR0_WP);
    assert_eq!(cr0.after & X86_CR0_WP, 0);
    let cr4 = report.tampering[1];
    assert_eq!(cr4.reg, ControlRegister::Cr4);
    assert_eq!(cr4.before & CR4_PINNABLE, CR4_PINNABLE);
    assert_eq!(cr4.after & CR4_PINNABLE, 0);

    assert_eq!(report.final_cr0 & X86_CR0_WP, X86_CR0_WP);
    assert_eq!(report.final_cr4 & CR4_PINNABLE, CR4_PINNABLE);
}

#[test]
fn no_smi_at_all() {
    let config = Config {
        self_smi: false,
        ..Default::default()
    };
    let report = run_default(&config).unwrap();
    assert_eq!(report.stages, vec![1, 2, 3, 4, 5, DONE]);
    assert_eq!(report.smm_entries, 0);
    assert!(report.tampering.is_empty());
}

#[test]
fn host_smi_after_cr0_pinning() {
    let config = Config {
        self_smi: false,
        inject_smi_after: Some(3),
        ..Default::default()
    };
    let report = run_default(&config).unwrap();
    assert_eq!(report.stages, vec![1, 2, 3, SMRAM_STAGE, 4, 5, DONE]);
    assert_eq!(report.smm_entries, 1);
    let cr0 = report.tampering[0];
    assert_eq!(cr0.before & X86_CR0_WP, X86_CR0_WP);
    assert_eq!(cr0.after & X86_CR0_WP, 0);
    assert_eq!(report.final_cr0 & X86_CR0_WP, X86_CR0_WP);
}

#[test]
fn host_and_guest_smis_interleave() {
    let config = Config {
        inject_smi_after: Some(5),
        ..Default::default()
    };
    let report = run_default(&config).unwrap();
    assert_eq!(
        report.stages,
        vec![1, 2, 3, 4, 5, SMRAM_STAGE, SMRAM_STAGE, DONE]
    );
    assert_eq!(report.smm_entries, 2);
    assert_eq!(report.tampering.len(), 4);
}

#[test]
fn halt_is_an_unexpected_exit() {
    let opts = ProgramOptions {
        halt_after: Some(2),
        ..Default::default()
    };
    match run_model(&Config::default(), &opts) {
        Err(Error::UnexpectedExit(name, _)) => assert_eq!(name, "HLT"),
        r => panic!("unexpected result: {:?}", r),
    }
}

#[test]
fn skipped_stage_is_reported() {
    let opts = ProgramOptions {
        skip_stages: vec![2],
        ..Default::default()
    };
    match run_model(&Config::default(), &opts) {
        Err(Error::UnexpectedStage {
            expected: 2,
            actual: 3,
        }) => {}
        r => panic!("unexpected result: {:?}", r),
    }
}

#[test]
fn done_before_last_stage_is_reported() {
    let program = ProgramBuilder::new()
        .sync(1)
        .sync(DONE)
        .halt_forever()
        .build();
    let hv = ModelHypervisor::new(Default::default());
    match cr_pin_test::run(&hv, &Config::default(), &program) {
        Err(Error::PrematureDone {
            last: 1,
            expected: 2,
        }) => {}
        r => panic!("unexpected result: {:?}", r),
    }
}

#[test]
fn repeated_cycles_are_idempotent() {
    let config = Config {
        cycles_per_stage: 3,
        ..Default::default()
    };
    let report = run_default(&config).unwrap();
    assert_eq!(report.cycles, 18);
    let single = run_default(&Config::default()).unwrap();
    assert_eq!(report.stages, single.stages);
    assert_eq!(report.tampering, single.tampering);
    assert_eq!(report.final_cr0, single.final_cr0);
    assert_eq!(report.final_cr4, single.final_cr4);
}

#[test]
fn legacy_save_area() {
    let config = Config {
        smram_format: SmramFormat::Legacy32,
        ..Default::default()
    };
    let report = run_default(&config).unwrap();
    assert_eq!(report.smm_entries, 1);
    assert_eq!(report.final_cr0 & X86_CR0_WP, X86_CR0_WP);
}

#[test]
fn iteration_limit() {
    let config = Config {
        max_iterations: 3,
        ..Default::default()
    };
    assert!(matches!(
        run_default(&config),
        Err(Error::IterationLimit(3))
    ));
}

#[test]
fn pins_lost_on_restore_are_caught() {
    let config = with_model(ModelConfig {
        forget_pins_on_restore: true,
        ..Default::default()
    });
    match run_default(&config) {
        Err(Error::MissingPinnedBits {
            reg: ControlRegister::Cr0,
            missing,
            ..
        }) => assert_eq!(missing, X86_CR0_WP),
        r => panic!("unexpected result: {:?}", r),
    }
}

#[test]
fn rsm_ignoring_pins_is_caught() {
    let config = with_model(ModelConfig {
        ignore_pins_on_rsm: true,
        ..Default::default()
    });
    match run_default(&config) {
        Err(Error::MissingPinnedBits {
            reg: ControlRegister::Cr0,
            missing,
            ..
        }) => assert_eq!(missing, X86_CR0_WP),
        r => panic!("unexpected result: {:?}", r),
    }
}

#[test]
fn missing_pin_msrs_fault_the_guest() {
    let config = with_model(ModelConfig {
        pinning_supported: false,
        ..Default::default()
    });
    match run_default(&config) {
        Err(Error::UnexpectedExit(name, _)) => assert_eq!(name, "SHUTDOWN"),
        r => panic!("unexpected result: {:?}", r),
    }
}

#[test]
fn save_area_format_mismatch_is_caught() {
    // A vcpu that saves in the AMD64 format and would let the tamper through on rsm.
    let hv = ModelHypervisor::new(ModelConfig {
        smram_format: SmramFormat::Amd64,
        ignore_pins_on_rsm: true,
        ..Default::default()
    });
    let config = Config {
        smram_format: SmramFormat::Legacy32,
        ..Default::default()
    };
    match cr_pin_test::run(&hv, &config, &cr_pinning_program(&config.program_options())) {
        Err(Error::SaveAreaRevision {
            expected: 0x2_0000,
            actual: 0x2_0064,
        }) => {}
        r => panic!("unexpected result: {:?}", r),
    }
}
