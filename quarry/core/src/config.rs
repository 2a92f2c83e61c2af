// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//

//! Quarry configuration

use std::collections::HashMap;
use std::result;

use crate::error::{QuarryError, Result};

/// Master switch for application-level executor/node blacklisting.
pub const QUARRY_BLACKLIST_ENABLED: &str = "quarry.blacklist.enabled";
/// Number of distinct failed tasks, in successful task sets, after which an
/// executor is blacklisted for the whole application.
pub const QUARRY_BLACKLIST_MAX_FAILED_TASKS_PER_EXECUTOR: &str =
    "quarry.blacklist.application.max_failed_tasks_per_executor";
/// Number of blacklisted executors after which their node is blacklisted too.
pub const QUARRY_BLACKLIST_MAX_FAILED_EXECUTORS_PER_NODE: &str =
    "quarry.blacklist.application.max_failed_executors_per_node";
/// How long a blacklist entry is retained, as a time string such as "1h".
pub const QUARRY_BLACKLIST_TIMEOUT: &str = "quarry.blacklist.timeout";
/// Pre-blacklist timeout knob in bare milliseconds. Kept so configurations
/// written against older releases keep working; the `quarry.blacklist.*`
/// keys win whenever both are set.
pub const QUARRY_LEGACY_EXECUTOR_TASK_BLACKLIST_TIME: &str =
    "quarry.scheduler.executor_task_blacklist_time";

pub type ParseResult<T> = result::Result<T, String>;

/// Value types a configuration entry can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigDataType {
    Boolean,
    UInt64,
    /// A time string: a bare integer (milliseconds) or an integer with one
    /// of the suffixes `ms`, `s`, `m`, `h`, `d`.
    TimeString,
}

/// Configuration option meta-data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    name: String,
    _description: String,
    data_type: ConfigDataType,
    default_value: Option<String>,
}

impl ConfigEntry {
    fn new(
        name: String,
        _description: String,
        data_type: ConfigDataType,
        default_value: Option<String>,
    ) -> Self {
        Self {
            name,
            _description,
            data_type,
            default_value,
        }
    }
}

/// Configuration with values in a valid String format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidConfiguration {
    settings: HashMap<String, String>,
    valid_entries: HashMap<String, ConfigEntry>,
}

impl ValidConfiguration {
    // When constructing a ValidConfiguration, necessary validation check will be done
    fn new(
        settings: HashMap<String, String>,
        valid_entries: Vec<ConfigEntry>,
    ) -> Result<Self> {
        let valid_entries = valid_entries
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect::<HashMap<_, _>>();

        // Firstly, check whether the entries in settings are valid or not
        for (name, _) in settings.iter() {
            if !valid_entries.contains_key(name) {
                return Err(QuarryError::General(format!(
                    "The configuration setting '{name}' is not valid"
                )));
            }
        }

        // Secondly, check each entry in the valid_entries: a user-supplied
        // value must parse to the declared data type, and so must a default
        // value when one exists. Entries with neither are optional and read
        // back as `None`.
        for (name, entry) in valid_entries.iter() {
            if let Some(v) = settings.get(&entry.name) {
                Self::parse_value(v.as_str(), entry.data_type).map_err(|e| {
                    QuarryError::General(format!(
                        "Failed to parse user-supplied value '{v}' for configuration setting '{name}': {e}"
                    ))
                })?;
            } else if let Some(v) = entry.default_value.as_ref() {
                Self::parse_value(v.as_str(), entry.data_type).map_err(|e| {
                    QuarryError::General(format!(
                        "Failed to parse default value '{v}' for configuration setting '{name}': {e}"
                    ))
                })?;
            }
        }

        Ok(Self {
            settings,
            valid_entries,
        })
    }

    /// The user-supplied value for `key`, or its default, if either exists.
    fn raw_setting(&self, key: &str) -> Option<&String> {
        self.settings.get(key).or_else(|| {
            self.valid_entries
                .get(key)
                .and_then(|e| e.default_value.as_ref())
        })
    }

    pub fn get_u64_setting(&self, key: &str) -> u64 {
        // infallible because we validate all configs in the constructor and
        // the entry carries a default
        self.get_opt_u64_setting(key).unwrap()
    }

    pub fn get_opt_u64_setting(&self, key: &str) -> Option<u64> {
        // infallible because we validate all configs in the constructor
        self.raw_setting(key).map(|v| v.parse().unwrap())
    }

    pub fn get_opt_bool_setting(&self, key: &str) -> Option<bool> {
        // infallible because we validate all configs in the constructor
        self.raw_setting(key).map(|v| v.parse().unwrap())
    }

    pub fn get_opt_time_setting_ms(&self, key: &str) -> Option<u64> {
        // infallible because we validate all configs in the constructor
        self.raw_setting(key)
            .map(|v| parse_time_string_ms(v).unwrap())
    }

    /// Error when the value is not able to parsed to the data type
    fn parse_value(val: &str, data_type: ConfigDataType) -> ParseResult<()> {
        match data_type {
            ConfigDataType::UInt64 => {
                val.parse::<u64>().map_err(|e| format!("{e:?}"))?;
            }
            ConfigDataType::Boolean => {
                val.parse::<bool>().map_err(|e| format!("{e:?}"))?;
            }
            ConfigDataType::TimeString => {
                parse_time_string_ms(val)?;
            }
        }

        Ok(())
    }
}

#[derive(Default)]
pub struct ValidConfigurationBuilder {
    settings: HashMap<String, String>,
}

impl ValidConfigurationBuilder {
    /// Create a new config with an additional setting
    pub fn set(&self, k: &str, v: &str) -> Self {
        let mut settings = self.settings.clone();
        settings.insert(k.to_owned(), v.to_owned());
        Self { settings }
    }

    pub fn build(&self, valid_entries: Vec<ConfigEntry>) -> Result<ValidConfiguration> {
        ValidConfiguration::new(self.settings.clone(), valid_entries)
    }
}

/// Quarry configuration builder
#[derive(Default)]
pub struct QuarryConfigBuilder {
    valid_config_builder: ValidConfigurationBuilder,
}

impl QuarryConfigBuilder {
    /// Create a new configuration based on key-value pairs
    pub fn with_settings(settings: HashMap<String, String>) -> Self {
        Self {
            valid_config_builder: ValidConfigurationBuilder { settings },
        }
    }

    /// Create a new config with an additional setting
    pub fn set(&self, k: &str, v: &str) -> Self {
        Self {
            valid_config_builder: self.valid_config_builder.set(k, v),
        }
    }

    pub fn build(&self) -> Result<QuarryConfig> {
        self.valid_config_builder
            .build(Self::valid_entries())
            .map(|valid_config| QuarryConfig { valid_config })
    }

    /// All available configuration options
    pub fn valid_entries() -> Vec<ConfigEntry> {
        vec![
            ConfigEntry::new(
                QUARRY_BLACKLIST_ENABLED.to_string(),
                "Sets whether executor/node blacklisting is enabled; when unset, a non-zero legacy timeout enables it".to_string(),
                ConfigDataType::Boolean,
                None,
            ),
            ConfigEntry::new(
                QUARRY_BLACKLIST_MAX_FAILED_TASKS_PER_EXECUTOR.to_string(),
                "Sets the number of distinct failed tasks after which an executor is blacklisted".to_string(),
                ConfigDataType::UInt64,
                Some("2".to_string()),
            ),
            ConfigEntry::new(
                QUARRY_BLACKLIST_MAX_FAILED_EXECUTORS_PER_NODE.to_string(),
                "Sets the number of blacklisted executors after which their node is blacklisted".to_string(),
                ConfigDataType::UInt64,
                Some("2".to_string()),
            ),
            ConfigEntry::new(
                QUARRY_BLACKLIST_TIMEOUT.to_string(),
                "Sets how long a blacklist entry is retained before the executor or node is usable again".to_string(),
                ConfigDataType::TimeString,
                None,
            ),
            ConfigEntry::new(
                QUARRY_LEGACY_EXECUTOR_TASK_BLACKLIST_TIME.to_string(),
                "Legacy blacklist timeout in milliseconds; superseded by quarry.blacklist.timeout".to_string(),
                ConfigDataType::UInt64,
                None,
            ),
        ]
    }
}

/// Quarry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarryConfig {
    /// Settings stored in map for easy serde
    valid_config: ValidConfiguration,
}

impl QuarryConfig {
    /// Create a configuration builder
    pub fn builder() -> QuarryConfigBuilder {
        QuarryConfigBuilder::default()
    }

    /// Create a default configuration
    pub fn new() -> Result<Self> {
        Self::with_settings(HashMap::new())
    }

    /// Create a new configuration based on key-value pairs
    pub fn with_settings(settings: HashMap<String, String>) -> Result<Self> {
        QuarryConfigBuilder::with_settings(settings).build()
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        &self.valid_config.settings
    }

    /// The explicit blacklist master switch, when set.
    pub fn blacklist_enabled(&self) -> Option<bool> {
        self.valid_config
            .get_opt_bool_setting(QUARRY_BLACKLIST_ENABLED)
    }

    pub fn blacklist_max_failed_tasks_per_executor(&self) -> u64 {
        self.valid_config
            .get_u64_setting(QUARRY_BLACKLIST_MAX_FAILED_TASKS_PER_EXECUTOR)
    }

    pub fn blacklist_max_failed_executors_per_node(&self) -> u64 {
        self.valid_config
            .get_u64_setting(QUARRY_BLACKLIST_MAX_FAILED_EXECUTORS_PER_NODE)
    }

    /// The explicit blacklist timeout in milliseconds, when set.
    pub fn blacklist_timeout_ms(&self) -> Option<u64> {
        self.valid_config
            .get_opt_time_setting_ms(QUARRY_BLACKLIST_TIMEOUT)
    }

    /// The legacy blacklist timeout in milliseconds, when set.
    pub fn legacy_executor_task_blacklist_time(&self) -> Option<u64> {
        self.valid_config
            .get_opt_u64_setting(QUARRY_LEGACY_EXECUTOR_TASK_BLACKLIST_TIME)
    }
}

/// Parses a time string into milliseconds.
///
/// Accepts a bare integer, meaning milliseconds, or an integer followed by
/// one of the suffixes `ms`, `s`, `m`, `h`, `d`.
pub fn parse_time_string_ms(s: &str) -> ParseResult<u64> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(format!("invalid time string '{s}': no numeric part"));
    }
    let value = number
        .parse::<u64>()
        .map_err(|e| format!("invalid time string '{s}': {e}"))?;
    let millis_per_unit: u64 = match suffix {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => {
            return Err(format!("invalid time string '{s}': unknown unit '{other}'"));
        }
    };
    value
        .checked_mul(millis_per_unit)
        .ok_or_else(|| format!("time string '{s}' overflows u64 milliseconds"))
}
