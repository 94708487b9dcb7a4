// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Checks that control register bits pinned through the KVM paravirtual interface stay pinned
//! when SMM code rewrites the saved CR0 and CR4 before `rsm`, and across a full save and restore
//! of the vcpu after every step of the guest.

pub mod boot;
pub mod config;
pub mod error;
pub mod guest;
pub mod harness;
pub mod smram;
pub mod stage;
pub mod sysfs;
pub mod verify;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::harness::run;
pub use crate::harness::RunReport;
