// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Logging utilities
//!
//! Thin wrappers over `env_logger`. Both initializers may be called any number
//! of times (every rank thread of a test may call them); only the first call
//! installs the logger.

/// Initialize logging from `RUST_LOG`, defaulting to `info`
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Initialize logging with specific level
pub fn init_logging_with_level(level: log::LevelFilter) {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}

/// Log macros that prefix the calling rank
#[macro_export]
macro_rules! rank_info {
    ($rank:expr, $($arg:tt)*) => {
        log::info!("[rank {}] {}", $rank, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! rank_debug {
    ($rank:expr, $($arg:tt)*) => {
        log::debug!("[rank {}] {}", $rank, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! rank_warn {
    ($rank:expr, $($arg:tt)*) => {
        log::warn!("[rank {}] {}", $rank, format_args!($($arg)*))
    };
}
