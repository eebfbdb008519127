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

use crate::error::LockError;
use std::fmt;

pub struct ErrorContext<'a> {
    pub error: &'a LockError,
    pub suggestion: Option<String>,
    pub details: Option<String>,
}

impl<'a> ErrorContext<'a> {
    pub fn new(error: &'a LockError) -> Self {
        let (suggestion, details) = match error {
            LockError::Deadlock(report) => {
                let suggestion = Some(
                    "Acquire locks in a consistent order, or release worker leases before \
                     blocking on project state owned by another worker."
                        .to_string(),
                );
                let details = Some(format!(
                    "{} thread(s) are waiting on each other",
                    report.threads().len()
                ));
                (suggestion, details)
            }
            LockError::NotHeldByCurrentThread { .. } => {
                let suggestion = Some(
                    "Only locks acquired by the calling thread can be released temporarily. \
                     Releasing locks owned elsewhere could lead to orphaned locks."
                        .to_string(),
                );
                (suggestion, None)
            }
            LockError::UnsupportedOperation(msg) => {
                let suggestion = Some(
                    "Leases and shared-resource permits must be released by the thread that \
                     acquired them."
                        .to_string(),
                );
                let details = Some(msg.clone());
                (suggestion, details)
            }
            LockError::InvalidPermitCount {
                resource,
                capacity,
                ..
            } => {
                let suggestion = Some(format!(
                    "Request at most {capacity} permits of '{resource}', or register the resource \
                     with a larger capacity."
                ));
                (suggestion, None)
            }
            LockError::UnknownSharedResource(name) => {
                let suggestion = Some(format!(
                    "Register '{name}' with the shared resource registry before requesting leases."
                ));
                (suggestion, None)
            }
            LockError::LockChangesDisallowed { .. } => {
                let suggestion = Some(
                    "The calling code runs in a scope that forbids changing held locks. Acquire \
                     or release locks before entering that scope."
                        .to_string(),
                );
                (suggestion, None)
            }
            LockError::NestedStateLock(_) => {
                let suggestion = Some(
                    "Lock transforms cannot start another transform. Perform all lock changes in \
                     a single transform."
                        .to_string(),
                );
                (suggestion, None)
            }
            LockError::ProjectAccessDenied { project, .. } => {
                let suggestion = Some(format!(
                    "Acquire the lock for the {project} before accessing its mutable state."
                ));
                (suggestion, None)
            }
            LockError::InvalidConfig(msg) | LockError::ConfigFile(msg) => {
                let suggestion = Some(
                    "Check locking.toml and the WORKLEASE_MAX_WORKERS environment variable."
                        .to_string(),
                );
                let details = Some(msg.clone());
                (suggestion, details)
            }
            _ => (None, None),
        };

        ErrorContext {
            error,
            suggestion,
            details,
        }
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }
}

impl<'a> fmt::Display for ErrorContext<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: {}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\n\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}
