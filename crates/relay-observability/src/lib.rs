use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_PREFIX: &str = "relay.engine";

/// A lifecycle event of a run, bus or tool call. Unset fields are logged as
/// empty strings so every record has the same shape.
#[derive(Debug, Clone, Default)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub correlation_id: Option<&'a str>,
    pub thread_id: Option<&'a str>,
    pub run_id: Option<&'a str>,
    pub agent_name: Option<&'a str>,
    pub node_name: Option<&'a str>,
    pub call_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Replaces user text with its length and a hash.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", trimmed.len(), short_hash(trimmed))
}

fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

// `tracing::event!` needs the level as a constant.
macro_rules! observability_event {
    ($level:expr, $event:expr) => {
        tracing::event!(
            target: "relay.obs",
            $level,
            component = $event.component,
            event = $event.event,
            correlation_id = $event.correlation_id.unwrap_or(""),
            thread_id = $event.thread_id.unwrap_or(""),
            run_id = $event.run_id.unwrap_or(""),
            agent_name = $event.agent_name.unwrap_or(""),
            node_name = $event.node_name.unwrap_or(""),
            call_id = $event.call_id.unwrap_or(""),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => observability_event!(Level::ERROR, event),
        Level::WARN => observability_event!(Level::WARN, event),
        Level::INFO => observability_event!(Level::INFO, event),
        Level::DEBUG => observability_event!(Level::DEBUG, event),
        _ => observability_event!(Level::TRACE, event),
    }
}

/// Installs the global subscriber: compact console logs on stderr plus daily
/// JSONL files under `logs_dir`. Files older than `retention_days` are
/// removed first.
pub fn init_logging(logs_dir: &Path, retention_days: u64) -> anyhow::Result<WorkerGuard> {
    fs::create_dir_all(logs_dir)?;
    cleanup_old_jsonl(logs_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    // stdout carries the event stream, so console logs go to stderr
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(guard)
}

fn cleanup_old_jsonl(logs_dir: &Path, retention_days: u64) -> anyhow::Result<()> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days as i64)).date_naive();
    let prefix = format!("{LOG_PREFIX}.");

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let Some(date_part) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(&prefix))
            .and_then(|rest| rest.strip_suffix(".jsonl"))
        else {
            continue;
        };
        let Ok(date) = chrono::NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };
        if date < cutoff && path.is_file() {
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}

pub fn logs_dir_in(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn redact_text_masks_content() {
        let raw = "lsv2-secret-key-123";
        let redacted = redact_text(raw);
        assert!(redacted.contains("[redacted len=19"));
        assert!(!redacted.contains("lsv2-secret-key-123"));
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn events_keep_level_and_fill_unset_fields() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(Level::TRACE)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            emit_event(
                Level::WARN,
                ObservabilityEvent {
                    event: "run.failed",
                    component: "remote.run",
                    thread_id: Some("t1"),
                    error_code: Some("NETWORK_ERROR"),
                    ..Default::default()
                },
            );
            emit_event(
                Level::TRACE,
                ObservabilityEvent {
                    event: "bus.publish",
                    component: "core.event_bus",
                    ..Default::default()
                },
            );
        });

        let output = String::from_utf8(captured.0.lock().expect("lock").clone()).expect("utf8");
        let records = output
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("json line"))
            .collect::<Vec<_>>();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["level"], "WARN");
        assert_eq!(records[0]["target"], "relay.obs");
        assert_eq!(records[0]["fields"]["event"], "run.failed");
        assert_eq!(records[0]["fields"]["thread_id"], "t1");
        assert_eq!(records[0]["fields"]["run_id"], "");
        assert_eq!(records[1]["level"], "TRACE");
    }

    #[test]
    fn cleanup_removes_only_expired_engine_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let expired = dir.path().join("relay.engine.2001-01-01.jsonl");
        let foreign = dir.path().join("other.engine.2001-01-01.jsonl");
        let today = dir
            .path()
            .join(format!("relay.engine.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        for path in [&expired, &foreign, &today] {
            fs::write(path, "{}\n").expect("write log");
        }

        cleanup_old_jsonl(dir.path(), 14).expect("cleanup");

        assert!(!expired.exists());
        assert!(foreign.exists());
        assert!(today.exists());
        assert_eq!(logs_dir_in(dir.path()), dir.path().join("logs"));
    }
}
