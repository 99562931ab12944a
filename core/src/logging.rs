use std::sync::{Arc, OnceLock};

use r2d2_sqlite::rusqlite::{params, Connection};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;

use crate::db::DbPool;

pub fn log_event(
    conn: &Connection,
    level: &str,
    code: Option<&str>,
    module: &str,
    message: &str,
    explain: Option<&str>,
    data: Option<Value>,
) -> rusqlite::Result<()> {
    let id = Uuid::new_v4().to_string();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let data_str = data.map(|v| v.to_string());
    conn.execute(
        "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ts, level, code, module, message, explain, data_str],
    )?;
    Ok(())
}

/// Write an event from async code without blocking the caller.
pub fn spawn_log_event(
    pool: &DbPool,
    level: &'static str,
    code: &'static str,
    module: &'static str,
    message: &'static str,
    data: Value,
) {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        if let Ok(conn) = pool.get() {
            let _ = log_event(&conn, level, Some(code), module, message, None, Some(data));
        }
    });
}

/// Collects an event's message and structured fields.
#[derive(Default)]
struct EventFields {
    message: Option<String>,
    data: serde_json::Map<String, Value>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.data
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.data.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.data.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.data.insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.data
                .insert(field.name().to_string(), Value::String(format!("{value:?}")));
        }
    }
}

/// Layer mirroring warnings and errors into `event_log`. The pool is
/// attached after the subscriber is installed; until then events are only
/// printed by the stderr layer.
#[derive(Clone, Default)]
pub struct EventLogLayer {
    pool: Arc<OnceLock<DbPool>>,
}

impl EventLogLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(pool: DbPool) -> Self {
        let layer = Self::new();
        layer.attach(pool);
        layer
    }

    /// Start mirroring into `pool`. Only the first attached pool is used.
    pub fn attach(&self, pool: DbPool) -> bool {
        self.pool.set(pool).is_ok()
    }
}

impl<S> Layer<S> for EventLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::WARN {
            return;
        }
        // try_get: an event must never wait on a pooled connection the
        // current thread may already hold.
        let Some(conn) = self.pool.get().and_then(|pool| pool.try_get()) else {
            return;
        };
        let mut fields = EventFields::default();
        event.record(&mut fields);
        let data = (!fields.data.is_empty()).then(|| Value::Object(fields.data));
        let level = metadata.level().as_str().to_lowercase();
        let _ = log_event(
            &conn,
            &level,
            None,
            metadata.target(),
            fields.message.as_deref().unwrap_or_default(),
            None,
            data,
        );
    }
}

/// `CHORUS_LOG`-style directives, falling back to `info`.
pub fn env_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber: compact stderr output filtered by
/// `directives` plus the event-log mirror. Returns the mirror so a database
/// can be attached once it is open. Calling it twice is a no-op.
pub fn install(directives: Option<&str>) -> EventLogLayer {
    let mirror = EventLogLayer::new();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();
    let _ = tracing_subscriber::registry()
        .with(env_filter(directives))
        .with(fmt_layer)
        .with(mirror.clone())
        .try_init();
    mirror
}
