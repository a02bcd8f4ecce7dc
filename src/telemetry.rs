use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

pub type TracingReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Span and event fields that carry user content or identifiers.
const PRIVATE_FIELDS: &[&str] = &["reply_token", "sender", "user_id", "text", "user_text"];

const FILTERED: &str = "[Filtered]";

/// Console output, plus rotated info and error files when a log directory is
/// configured. The returned handle swaps the global filter at runtime.
pub fn init_tracing(config: &LoggingConfig) -> Result<TracingReloadHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    let file_layers = match &config.directory {
        Some(directory) => {
            let info_file = daily_appender(directory, "info", config.max_files)?;
            let error_file = daily_appender(directory, "error", config.max_files)?;

            let info_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(info_file)
                .with_filter(LevelFilter::INFO);
            let error_layer = fmt::layer()
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(error_file)
                .with_filter(LevelFilter::ERROR);

            Some(info_layer.and_then(error_layer))
        }
        None => None,
    };

    let registry = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .with(file_layers);

    #[cfg(feature = "sentry")]
    let registry = registry.with(sentry_tracing::layer());

    registry.init();
    tracing::log::info!("build version: {}", crate::VERSION);
    if let Some(directory) = &config.directory {
        tracing::log::info!("Writing log files to {directory:?}");
    }

    Ok(reload_handle)
}

fn daily_appender(directory: &Path, prefix: &str, max_files: usize) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory: {directory:?}"))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(max_files)
        .build(directory)
        .with_context(|| format!("Failed to open {prefix} log file in {directory:?}"))
}

fn is_private(key: &str) -> bool {
    PRIVATE_FIELDS.contains(&key)
}

/// Replaces private fields with a placeholder, descending into nested objects.
#[cfg_attr(not(feature = "sentry"), allow(dead_code))]
fn scrub_fields<'a>(fields: impl Iterator<Item = (&'a String, &'a mut Value)>) {
    for (key, value) in fields {
        if is_private(key) {
            *value = Value::String(FILTERED.to_string());
            continue;
        }
        match value {
            Value::Object(map) => scrub_fields(map.iter_mut()),
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if let Value::Object(map) = item {
                        scrub_fields(map.iter_mut());
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(feature = "sentry")]
pub fn init_sentry(config: &crate::config::SentryConfig) -> Result<sentry::ClientInitGuard> {
    use sentry::protocol::{Breadcrumb, Event};
    use std::borrow::Cow;
    use std::sync::Arc;

    tracing::log::debug!("Initializing Sentry integration");

    let panic_integration = sentry_panic::PanicIntegration::default().add_extractor(|_| None);
    let scrub = !config.send_default_pii;

    let guard = sentry::init((
        config.dsn.clone(),
        sentry::ClientOptions {
            environment: config.environment.clone().map(Cow::Owned),
            server_name: config.server_name.clone().map(Cow::Owned),
            debug: config.debug,
            send_default_pii: config.send_default_pii,
            release: sentry::release_name!(),
            integrations: vec![Arc::new(panic_integration)],
            before_send: Some(Arc::new(move |event: Event<'static>| {
                let event = if scrub { scrub_event(event) } else { event };
                tracing::log::warn!(
                    "Reporting to Sentry: {}",
                    event
                        .message
                        .as_deref()
                        .or_else(|| event.exception.values.first().and_then(|e| e.value.as_deref()))
                        .unwrap_or("no message")
                );
                Some(event)
            })),
            before_breadcrumb: Some(Arc::new(move |mut breadcrumb: Breadcrumb| {
                if scrub {
                    scrub_fields(breadcrumb.data.iter_mut());
                }
                Some(breadcrumb)
            })),
            ..Default::default()
        },
    ));

    tracing::log::info!(
        "Sentry integration initialized{}",
        if scrub { ", private fields filtered" } else { "" }
    );
    Ok(guard)
}

/// Strips reply tokens, user ids and message text recorded as tracing fields.
#[cfg(feature = "sentry")]
fn scrub_event(mut event: sentry::protocol::Event<'static>) -> sentry::protocol::Event<'static> {
    use sentry::protocol::Context;

    scrub_fields(event.extra.iter_mut());
    for context in event.contexts.values_mut() {
        if let Context::Other(map) = context {
            scrub_fields(map.iter_mut());
        }
    }
    for (key, value) in event.tags.iter_mut() {
        if is_private(key) {
            *value = FILTERED.to_string();
        }
    }
    for breadcrumb in event.breadcrumbs.values.iter_mut() {
        scrub_fields(breadcrumb.data.iter_mut());
    }
    event.user = None;
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_scrubs_private_fields() {
        let mut fields = json!({
            "reply_token": "nHuyWiB7yP5Zw52FIkcQobQuGDXCTA",
            "sender": "U4af4980629",
            "delivery_id": "0b4b9a4e",
            "model": "openai/gpt-4",
            "span": { "text": "solve 2x+5=9", "reply_length": 5 },
            "events": [{ "user_id": "U4af4980629", "attempt": 2 }]
        });
        let Value::Object(map) = &mut fields else {
            unreachable!()
        };
        scrub_fields(map.iter_mut());

        assert_eq!(
            fields,
            json!({
                "reply_token": "[Filtered]",
                "sender": "[Filtered]",
                "delivery_id": "0b4b9a4e",
                "model": "openai/gpt-4",
                "span": { "text": "[Filtered]", "reply_length": 5 },
                "events": [{ "user_id": "[Filtered]", "attempt": 2 }]
            })
        );
    }

    #[test]
    fn test_daily_appender_creates_directory() {
        let directory = std::env::temp_dir()
            .join(format!("homework-bot-logs-{}", uuid::Uuid::new_v4()))
            .join("nested");

        let mut appender = daily_appender(&directory, "error", 5).unwrap();
        appender.write_all(b"failure\n").unwrap();
        appender.flush().unwrap();

        let files: Vec<String> = std::fs::read_dir(&directory)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("error."), "{files:?}");
        assert!(files[0].ends_with(".log"), "{files:?}");

        let _ = std::fs::remove_dir_all(directory.parent().unwrap());
    }
}
