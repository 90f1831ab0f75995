// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::elements::{
    FailureTolerance, LaneCount, RetryPolicy, SandboxConfigImpl, SandboxPolicy,
    deserialize_retry_policy,
};
use crate::{
    errors::{ConfigParseError, ConfigParseErrorKind, ProfileNotFound},
    monitor::WatchdogIntervals,
    runner::LanePolicy,
    universe::{NoSplitGroup, TestFilter, TestSelector},
};
use camino::{Utf8Path, Utf8PathBuf};
use config::{
    Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState,
};
use indexmap::IndexMap;
use serde::Deserialize;
use std::{collections::BTreeSet, time::Duration};
use tracing::{debug, warn};

/// Overall configuration for simlane.
///
/// This is the root data structure for simlane configuration. Most runner-specific configuration
/// is managed through [profiles](SimlaneProfile), obtained through the [`profile`](Self::profile)
/// method.
///
/// For more about configuration, see the default config in `default-config.toml`.
#[derive(Clone, Debug)]
pub struct SimlaneConfig {
    config_file: Utf8PathBuf,
    inner: SimlaneConfigImpl,
}

impl SimlaneConfig {
    /// The default location of the config within the working directory: `.config/simlane.toml`.
    pub const CONFIG_PATH: &'static str = ".config/simlane.toml";

    /// Contains the default config as a TOML file.
    ///
    /// Repository-specific configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../default-config.toml");

    /// The name of the default profile.
    pub const DEFAULT_PROFILE: &'static str = "default";

    /// Reads the simlane config from the given file, or if not specified from
    /// `.config/simlane.toml` within `root`. A missing default file is not an error.
    pub fn from_sources(
        root: &Utf8Path,
        file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (config, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;

        if !unknown.is_empty() {
            let keys: Vec<_> = unknown.into_iter().collect();
            warn!(
                "ignoring unknown configuration keys in {config_file}: {}",
                keys.join(", ")
            );
        }
        debug!(%config_file, "loaded simlane config");

        Ok(Self {
            config_file,
            inner: config.into_config_impl(),
        })
    }

    /// Returns the default simlane config, without reading any files.
    pub fn default_config() -> Self {
        let builder = Self::make_default_config();
        let (config, _unknown) = Self::build_and_deserialize_config(&builder)
            .expect("default config is always valid");
        Self {
            config_file: Utf8PathBuf::from(Self::CONFIG_PATH),
            inner: config.into_config_impl(),
        }
    }

    /// Returns the path to the config file that was (or would have been) read.
    pub fn config_file(&self) -> &Utf8Path {
        &self.config_file
    }

    /// Returns the profile with the given name, or an error if a profile was
    /// specified but not found.
    pub fn profile(&self, name: impl AsRef<str>) -> Result<SimlaneProfile<'_>, ProfileNotFound> {
        let name = name.as_ref();
        let custom_profile = self.inner.get_profile(name)?;
        Ok(SimlaneProfile {
            name: name.to_owned(),
            default_profile: &self.inner.default_profile,
            custom_profile,
        })
    }

    // ---
    // Helper methods
    // ---

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(SimlaneConfigDeserialize, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: SimlaneConfigDeserialize = serde_path_to_error::deserialize(ignored_de)
            .map_err(|error| {
                // serde_path_to_error already reports the key, so drop it from the config error.
                let path = error.path().clone();
                let config_error = error.into_inner();
                let error = match config_error {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((config, ignored))
    }
}

/// A simlane profile, with every key resolved against the default profile.
///
/// Returned by [`SimlaneConfig::profile`].
#[derive(Clone, Debug)]
pub struct SimlaneProfile<'cfg> {
    name: String,
    default_profile: &'cfg DefaultProfileImpl,
    custom_profile: Option<&'cfg CustomProfileImpl>,
}

impl<'cfg> SimlaneProfile<'cfg> {
    /// Returns the name of the profile.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of lanes to run.
    pub fn lanes(&self) -> LaneCount {
        self.custom_profile
            .and_then(|profile| profile.lanes)
            .unwrap_or(self.default_profile.lanes)
    }

    /// Returns the retry policy for the run.
    pub fn error_retries(&self) -> RetryPolicy {
        self.custom_profile
            .and_then(|profile| profile.error_retries)
            .unwrap_or(self.default_profile.error_retries)
    }

    /// Returns the failure tolerance.
    pub fn failure_tolerance(&self) -> FailureTolerance {
        self.custom_profile
            .and_then(|profile| profile.failure_tolerance)
            .unwrap_or(self.default_profile.failure_tolerance)
    }

    /// Returns true if retries should only run failing tests.
    pub fn only_retry_failed(&self) -> bool {
        self.custom_profile
            .and_then(|profile| profile.only_retry_failed)
            .unwrap_or(self.default_profile.only_retry_failed)
    }

    /// Returns the no-output watchdog interval.
    pub fn no_output_timeout(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.no_output_timeout)
            .unwrap_or(self.default_profile.no_output_timeout)
    }

    /// Returns the max-execution watchdog budget.
    pub fn max_execution_timeout(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.max_execution_timeout)
            .unwrap_or(self.default_profile.max_execution_timeout)
    }

    /// Returns how long a terminated workload is given to exit.
    pub fn termination_grace(&self) -> Duration {
        self.custom_profile
            .and_then(|profile| profile.termination_grace)
            .unwrap_or(self.default_profile.termination_grace)
    }

    /// Returns the sandbox step policy.
    pub fn sandbox_policy(&self) -> SandboxPolicy {
        match self.custom_profile {
            Some(profile) => profile.sandbox.overlay(self.default_profile.sandbox),
            None => self.default_profile.sandbox,
        }
    }

    /// Returns the policy each lane runs with.
    pub fn lane_policy(&self) -> LanePolicy {
        LanePolicy {
            watchdogs: WatchdogIntervals {
                no_output: self.no_output_timeout(),
                max_execution: self.max_execution_timeout(),
            },
            termination_grace: self.termination_grace(),
            sandbox: self.sandbox_policy(),
        }
    }

    /// Returns the no-split groups, in configuration order.
    pub fn no_split_groups(&self) -> Vec<NoSplitGroup> {
        let groups = self
            .custom_profile
            .and_then(|profile| profile.no_split.as_ref())
            .unwrap_or(&self.default_profile.no_split);
        groups
            .iter()
            .map(|(name, entries)| NoSplitGroup::new(name.clone(), entries.clone()))
            .collect()
    }

    /// Returns the include and exclude filter.
    pub fn test_filter(&self) -> TestFilter {
        let include = self
            .custom_profile
            .and_then(|profile| profile.include.as_ref())
            .unwrap_or(&self.default_profile.include);
        let exclude = self
            .custom_profile
            .and_then(|profile| profile.exclude.as_ref())
            .unwrap_or(&self.default_profile.exclude);
        TestFilter::new(include.clone(), exclude.clone())
    }
}

#[derive(Clone, Debug)]
struct SimlaneConfigImpl {
    default_profile: DefaultProfileImpl,
    other_profiles: IndexMap<String, CustomProfileImpl>,
}

impl SimlaneConfigImpl {
    fn get_profile(&self, profile: &str) -> Result<Option<&CustomProfileImpl>, ProfileNotFound> {
        let custom_profile = match profile {
            SimlaneConfig::DEFAULT_PROFILE => None,
            other => Some(
                self.other_profiles
                    .get(other)
                    .ok_or_else(|| ProfileNotFound::new(profile, self.all_profiles()))?,
            ),
        };
        Ok(custom_profile)
    }

    fn all_profiles(&self) -> impl Iterator<Item = &str> {
        self.other_profiles
            .keys()
            .map(|key| key.as_str())
            .chain(std::iter::once(SimlaneConfig::DEFAULT_PROFILE))
    }
}

/// Deserialized form of simlane config before post-processing.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SimlaneConfigDeserialize {
    #[serde(rename = "profile")]
    profiles: IndexMap<String, CustomProfileImpl>,
}

impl SimlaneConfigDeserialize {
    fn into_config_impl(mut self) -> SimlaneConfigImpl {
        let p = self
            .profiles
            .shift_remove(SimlaneConfig::DEFAULT_PROFILE)
            .expect("default profile should exist");
        let default_profile = DefaultProfileImpl::new(p);

        SimlaneConfigImpl {
            default_profile,
            other_profiles: self.profiles,
        }
    }
}

#[derive(Clone, Debug)]
struct DefaultProfileImpl {
    lanes: LaneCount,
    error_retries: RetryPolicy,
    failure_tolerance: FailureTolerance,
    only_retry_failed: bool,
    no_output_timeout: Duration,
    max_execution_timeout: Duration,
    termination_grace: Duration,
    sandbox: SandboxPolicy,
    no_split: IndexMap<String, Vec<TestSelector>>,
    include: Vec<TestSelector>,
    exclude: Vec<TestSelector>,
}

impl DefaultProfileImpl {
    fn new(p: CustomProfileImpl) -> Self {
        Self {
            lanes: p.lanes.expect("lanes present in default profile"),
            error_retries: p
                .error_retries
                .expect("error-retries present in default profile"),
            failure_tolerance: p
                .failure_tolerance
                .expect("failure-tolerance present in default profile"),
            only_retry_failed: p
                .only_retry_failed
                .expect("only-retry-failed present in default profile"),
            no_output_timeout: p
                .no_output_timeout
                .expect("no-output-timeout present in default profile"),
            max_execution_timeout: p
                .max_execution_timeout
                .expect("max-execution-timeout present in default profile"),
            termination_grace: p
                .termination_grace
                .expect("termination-grace present in default profile"),
            sandbox: p.sandbox.for_default_profile(),
            no_split: p.no_split.unwrap_or_default(),
            include: p.include.unwrap_or_default(),
            exclude: p.exclude.unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CustomProfileImpl {
    #[serde(default)]
    lanes: Option<LaneCount>,
    #[serde(default, deserialize_with = "deserialize_retry_policy")]
    error_retries: Option<RetryPolicy>,
    #[serde(default)]
    failure_tolerance: Option<FailureTolerance>,
    #[serde(default)]
    only_retry_failed: Option<bool>,
    #[serde(default, with = "humantime_serde")]
    no_output_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    max_execution_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    termination_grace: Option<Duration>,
    #[serde(default)]
    sandbox: SandboxConfigImpl,
    #[serde(default)]
    no_split: Option<IndexMap<String, Vec<TestSelector>>>,
    #[serde(default)]
    include: Option<Vec<TestSelector>>,
    #[serde(default)]
    exclude: Option<Vec<TestSelector>>,
}
