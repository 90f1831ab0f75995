// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::SandboxStep;
use serde::Deserialize;
use std::{num::NonZeroU32, time::Duration};

/// How many times a sandbox step may be tried, and how long each try may take.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StepPolicy {
    /// The maximum number of tries, including the first.
    pub max_tries: NonZeroU32,

    /// The time limit for each try.
    pub timeout: Duration,
}

impl StepPolicy {
    /// A policy with a single try bounded by `timeout`.
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_tries: NonZeroU32::MIN,
            timeout,
        }
    }
}

/// Resolved sandbox settings for a profile: the `[profile.<name>.sandbox]`
/// table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SandboxPolicy {
    /// Creating an instance.
    pub create: StepPolicy,

    /// Booting an instance. Always a single try.
    pub boot: StepPolicy,

    /// Installing the workload.
    pub install: StepPolicy,

    /// Launching the workload.
    pub launch: StepPolicy,

    /// The time limit for deleting an instance.
    pub delete_timeout: Duration,

    /// If true, instances are left in place once their lane is done.
    pub keep_instances: bool,
}

impl SandboxPolicy {
    /// Returns the policy for the given step.
    pub fn step(&self, step: SandboxStep) -> StepPolicy {
        match step {
            SandboxStep::Create => self.create,
            SandboxStep::Boot => self.boot,
            SandboxStep::Install => self.install,
            SandboxStep::Launch => self.launch,
            SandboxStep::Delete => StepPolicy::once(self.delete_timeout),
        }
    }
}

/// The `sandbox` table as it appears in a profile. Every key is optional in
/// custom profiles and falls back to the default profile.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(in crate::config) struct SandboxConfigImpl {
    #[serde(default)]
    max_create_tries: Option<NonZeroU32>,
    #[serde(default)]
    max_install_tries: Option<NonZeroU32>,
    #[serde(default)]
    max_launch_tries: Option<NonZeroU32>,
    #[serde(default, with = "humantime_serde")]
    create_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    boot_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    install_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    launch_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    delete_timeout: Option<Duration>,
    #[serde(default)]
    keep_instances: Option<bool>,
}

impl SandboxConfigImpl {
    /// Resolves the default profile's table, which must set every key.
    pub(in crate::config) fn for_default_profile(self) -> SandboxPolicy {
        SandboxPolicy {
            create: StepPolicy {
                max_tries: self
                    .max_create_tries
                    .expect("max-create-tries present in default profile"),
                timeout: self
                    .create_timeout
                    .expect("create-timeout present in default profile"),
            },
            boot: StepPolicy::once(
                self.boot_timeout
                    .expect("boot-timeout present in default profile"),
            ),
            install: StepPolicy {
                max_tries: self
                    .max_install_tries
                    .expect("max-install-tries present in default profile"),
                timeout: self
                    .install_timeout
                    .expect("install-timeout present in default profile"),
            },
            launch: StepPolicy {
                max_tries: self
                    .max_launch_tries
                    .expect("max-launch-tries present in default profile"),
                timeout: self
                    .launch_timeout
                    .expect("launch-timeout present in default profile"),
            },
            delete_timeout: self
                .delete_timeout
                .expect("delete-timeout present in default profile"),
            keep_instances: self
                .keep_instances
                .expect("keep-instances present in default profile"),
        }
    }

    /// Overlays the keys set in this table on top of `base`.
    pub(in crate::config) fn overlay(&self, base: SandboxPolicy) -> SandboxPolicy {
        SandboxPolicy {
            create: StepPolicy {
                max_tries: self.max_create_tries.unwrap_or(base.create.max_tries),
                timeout: self.create_timeout.unwrap_or(base.create.timeout),
            },
            boot: StepPolicy::once(self.boot_timeout.unwrap_or(base.boot.timeout)),
            install: StepPolicy {
                max_tries: self.max_install_tries.unwrap_or(base.install.max_tries),
                timeout: self.install_timeout.unwrap_or(base.install.timeout),
            },
            launch: StepPolicy {
                max_tries: self.max_launch_tries.unwrap_or(base.launch.max_tries),
                timeout: self.launch_timeout.unwrap_or(base.launch.timeout),
            },
            delete_timeout: self.delete_timeout.unwrap_or(base.delete_timeout),
            keep_instances: self.keep_instances.unwrap_or(base.keep_instances),
        }
    }
}
