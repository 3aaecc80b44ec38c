// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `tracing` subscriber initialisation.
//!
//! One registry carries a reloadable target filter and up to three layers:
//! stdout, an hourly rolling file, and an error-only rolling file. Records
//! emitted through the `log` facade are bridged in with [`LogTracer`].

use std::{
    env,
    io::IsTerminal,
    sync::{Mutex, Once},
};

use bon::Builder;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Deserializer, Serialize, de};
use smart_default::SmartDefault;
use tracing::Subscriber;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter, layer::SubscriberExt, registry::LookupSpan,
};

/// Deserializes a string, treating the empty string as `T::default()`.
pub fn empty_string_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let s = String::deserialize(deserializer)?;
    if s.is_empty() {
        Ok(T::default())
    } else {
        T::deserialize(de::value::StrDeserializer::new(&s)).map_err(|e: de::value::Error| {
            de::Error::custom(format!("invalid value, expect empty string, err: {e}"))
        })
    }
}

/// Handle for changing the level filter after initialisation.
///
/// Set by the first [`init_global_logging`] call.
pub static RELOAD_HANDLE: OnceCell<tracing_subscriber::reload::Handle<filter::Targets, Registry>> =
    OnceCell::new();

/// Filter used when neither [`LoggingOptions::level`] nor `RUST_LOG` is set.
const DEFAULT_LOG_TARGETS: &str = "info";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, SmartDefault, Builder)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for rolling log files. Empty disables file logging.
    #[default = ""]
    #[builder(into, default)]
    pub dir: String,

    /// Target filter such as `"info,spillway_queue=debug"`. Falls back to
    /// `RUST_LOG`, then to `info`.
    #[builder(into)]
    pub level: Option<String>,

    #[serde(default, deserialize_with = "empty_string_as_default")]
    #[builder(default)]
    pub log_format: LogFormat,

    /// Rotated files kept per log, hourly rotation. 720 is 30 days.
    #[default = 720]
    #[builder(default = 720)]
    pub max_log_files: usize,

    #[default = true]
    #[builder(default = true)]
    pub append_stdout: bool,
}

#[derive(
    Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize, Default, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, with the current span and span list.
    Json,
    /// Human-readable lines. ANSI colours only on a terminal stdout.
    #[default]
    Text,
}

/// Initialises logging for test binaries.
///
/// Logs go to `UNITTEST_LOG_DIR` (default `/tmp/__unittest_logs`) at
/// `UNITTEST_LOG_LEVEL` (default `debug`). Safe to call from every test; only
/// the first call does anything.
pub fn init_default_ut_logging() {
    static START: Once = Once::new();

    START.call_once(|| {
        let dir =
            env::var("UNITTEST_LOG_DIR").unwrap_or_else(|_| "/tmp/__unittest_logs".to_string());
        let level = env::var("UNITTEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let opts = LoggingOptions {
            dir: dir.clone(),
            level: Some(level),
            append_stdout: false,
            ..Default::default()
        };
        let guards = init_global_logging("unittest", &opts);
        if let Ok(mut slot) = GLOBAL_UT_LOG_GUARD.lock() {
            *slot = Some(guards);
        }

        tracing::info!(dir, "Unit test logging initialised");
    });
}

/// Keeps the unit test writers alive for the life of the test binary.
static GLOBAL_UT_LOG_GUARD: Lazy<Mutex<Option<Vec<WorkerGuard>>>> = Lazy::new(|| Mutex::new(None));

/// Installs the global subscriber.
///
/// `app_name` prefixes the log file names (`<app_name>.<hour>` and
/// `<app_name>-err.<hour>`). The returned guards flush the non-blocking
/// writers when dropped, so hold them for the life of the process. Only the
/// first call in a process has any effect; later calls return no guards.
///
/// # Panics
///
/// Panics if the log directory cannot be used, the level string does not
/// parse, or another global subscriber is already installed.
#[must_use]
pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    static START: Once = Once::new();
    let mut guards = vec![];

    START.call_once(|| {
        LogTracer::init().expect("log tracer must be valid");

        let stdout_layer = opts.append_stdout.then(|| {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            guards.push(guard);
            fmt_layer(writer, opts.log_format, std::io::stdout().is_terminal())
        });

        let file_layer = (!opts.dir.is_empty()).then(|| {
            let (writer, guard) = rolling_writer(&opts.dir, app_name, opts.max_log_files);
            guards.push(guard);
            fmt_layer(writer, opts.log_format, false)
        });

        let err_file_layer = (!opts.dir.is_empty()).then(|| {
            let prefix = format!("{app_name}-err");
            let (writer, guard) = rolling_writer(&opts.dir, &prefix, opts.max_log_files);
            guards.push(guard);
            fmt_layer(writer, opts.log_format, false)
                .with_filter(filter::LevelFilter::ERROR)
                .boxed()
        });

        let targets = opts
            .level
            .as_deref()
            .or(env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
            .unwrap_or(DEFAULT_LOG_TARGETS)
            .parse::<filter::Targets>()
            .expect("error parsing log level string");
        let (dyn_filter, reload_handle) = tracing_subscriber::reload::Layer::new(targets);

        RELOAD_HANDLE
            .set(reload_handle)
            .expect("reload handle already set, maybe init_global_logging get called twice?");

        let subscriber = Registry::default()
            .with(dyn_filter)
            .with(stdout_layer)
            .with(file_layer)
            .with(err_file_layer);

        tracing::subscriber::set_global_default(subscriber)
            .expect("error setting global tracing subscriber");
    });

    guards
}

fn rolling_writer(dir: &str, prefix: &str, max_log_files: usize) -> (NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(prefix)
        .max_log_files(max_log_files)
        .build(dir)
        .unwrap_or_else(|e| panic!("initializing rolling file appender at {dir} failed: {e}"));
    tracing_appender::non_blocking(appender)
}

fn fmt_layer<S>(
    writer: NonBlocking,
    format: LogFormat,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::Layer::new()
        .with_writer(writer)
        .with_ansi(ansi);
    match format {
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Text => layer.boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = LoggingOptions::default();
        assert!(opts.dir.is_empty());
        assert_eq!(opts.level, None);
        assert_eq!(opts.log_format, LogFormat::Text);
        assert_eq!(opts.max_log_files, 720);
        assert!(opts.append_stdout);
    }

    #[test]
    fn test_builder_matches_defaults() {
        assert_eq!(LoggingOptions::builder().build(), LoggingOptions::default());

        let opts = LoggingOptions::builder()
            .dir("/var/log/spillway")
            .level("debug")
            .log_format(LogFormat::Json)
            .build();
        assert_eq!(opts.dir, "/var/log/spillway");
        assert_eq!(opts.level.as_deref(), Some("debug"));
        assert_eq!(opts.log_format, LogFormat::Json);
    }

    #[test]
    fn test_deserialize_partial_options() {
        let opts: LoggingOptions =
            serde_json::from_str(r#"{"dir": "logs", "log_format": "json"}"#).unwrap();
        assert_eq!(opts.dir, "logs");
        assert_eq!(opts.log_format, LogFormat::Json);
        assert_eq!(opts.max_log_files, 720);
    }

    #[test]
    fn test_empty_log_format_is_default() {
        let opts: LoggingOptions = serde_json::from_str(r#"{"log_format": ""}"#).unwrap();
        assert_eq!(opts.log_format, LogFormat::Text);
    }

    #[test]
    fn test_log_format_display() {
        assert_eq!(LogFormat::Json.to_string(), "Json");
        assert_eq!(LogFormat::Text.to_string(), "Text");
    }
}
