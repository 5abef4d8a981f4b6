// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Error;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log section in config.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Log {
    /// Also print log to console.
    ///
    /// Default is true.
    #[serde(default = "Log::default_console_log")]
    console_log: bool,

    /// Log file path. Empty path disables the file appender.
    #[serde(default = "Log::default_log_file")]
    log_file: PathBuf,

    /// Default is `info`.
    #[serde(default = "Log::default_log_level")]
    log_level: LogLevel,
}

impl Log {
    #[must_use]
    pub const fn default_console_log() -> bool {
        true
    }

    #[must_use]
    pub fn default_log_file() -> PathBuf {
        PathBuf::new()
    }

    #[must_use]
    pub const fn default_log_level() -> LogLevel {
        LogLevel::Info
    }

    #[must_use]
    pub const fn console_log(&self) -> bool {
        self.console_log
    }

    #[must_use]
    pub fn log_file(&self) -> Option<&Path> {
        if self.log_file.as_os_str().is_empty() {
            None
        } else {
            Some(&self.log_file)
        }
    }

    #[must_use]
    pub const fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if the log directory cannot be used.
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(log_file) = self.log_file() {
            if let Some(parent) = log_file.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            console_log: Self::default_console_log(),
            log_file: Self::default_log_file(),
            log_level: Self::default_log_level(),
        }
    }
}
