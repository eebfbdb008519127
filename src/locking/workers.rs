// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::num::NonZeroUsize;
use std::thread;

/// Requested size of the worker lease pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxWorkersValue {
    /// One worker per available CPU.
    #[default]
    Auto,
    Fixed(NonZeroUsize),
}

impl MaxWorkersValue {
    /// Returns `None` for zero, which can never grant a lease.
    pub fn fixed(workers: usize) -> Option<Self> {
        NonZeroUsize::new(workers).map(Self::Fixed)
    }

    pub fn worker_count(&self) -> usize {
        match self {
            MaxWorkersValue::Fixed(workers) => workers.get(),
            MaxWorkersValue::Auto => thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }
}

impl fmt::Display for MaxWorkersValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxWorkersValue::Auto => f.write_str("auto"),
            MaxWorkersValue::Fixed(workers) => write!(f, "{workers}"),
        }
    }
}

/// Source precedence used when resolving the effective pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxWorkersSource {
    #[default]
    Default,
    Config,
    Environment,
}

impl fmt::Display for MaxWorkersSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MaxWorkersSource::Default => "built-in default",
            MaxWorkersSource::Config => "configuration file",
            MaxWorkersSource::Environment => "environment variable",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxWorkersResolution {
    pub value: MaxWorkersValue,
    pub source: MaxWorkersSource,
}

impl MaxWorkersResolution {
    pub fn worker_count(&self) -> usize {
        self.value.worker_count()
    }
}

/// Error produced when parsing a max-workers override fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxWorkersParseError {
    message: String,
}

impl fmt::Display for MaxWorkersParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MaxWorkersParseError {}

impl MaxWorkersParseError {
    fn invalid_value(value: &str) -> Self {
        Self {
            message: format!(
                "Max workers value '{value}' is invalid. Use a positive integer or the word 'auto'."
            ),
        }
    }
}

/// Parses a max-workers override from the environment or configuration.
pub fn parse_max_workers(value: &str) -> Result<MaxWorkersValue, MaxWorkersParseError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("auto") {
        return Ok(MaxWorkersValue::Auto);
    }

    trimmed
        .parse::<usize>()
        .ok()
        .and_then(MaxWorkersValue::fixed)
        .ok_or_else(|| MaxWorkersParseError::invalid_value(trimmed))
}

/// Resolves the effective pool size based on env > config > default precedence.
pub struct MaxWorkersResolver<'a> {
    env_override: Option<&'a str>,
    config_value: MaxWorkersValue,
    default_value: MaxWorkersValue,
}

impl<'a> MaxWorkersResolver<'a> {
    pub fn new(
        env_override: Option<&'a str>,
        config_value: MaxWorkersValue,
        default_value: MaxWorkersValue,
    ) -> Self {
        Self {
            env_override,
            config_value,
            default_value,
        }
    }

    pub fn resolve(self) -> Result<MaxWorkersResolution, MaxWorkersParseError> {
        if let Some(env_value) = self.env_override {
            let value = parse_max_workers(env_value)?;
            return Ok(MaxWorkersResolution {
                value,
                source: MaxWorkersSource::Environment,
            });
        }

        if self.config_value != self.default_value {
            return Ok(MaxWorkersResolution {
                value: self.config_value,
                source: MaxWorkersSource::Config,
            });
        }

        Ok(MaxWorkersResolution {
            value: self.default_value,
            source: MaxWorkersSource::Default,
        })
    }
}
