use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(cfg.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout may carry command output; keep diagnostics on stderr.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Optional machine-readable lifecycle stream, one JSON object per line.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    sink: Sink,
}

#[derive(Clone, Debug)]
enum Sink {
    Off,
    Stderr,
    #[cfg(test)]
    Memory(std::sync::Arc<parking_lot::Mutex<Vec<Value>>>),
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        let sink = if json_output { Sink::Stderr } else { Sink::Off };
        Self { sink }
    }

    #[cfg(test)]
    pub(crate) fn recording() -> Self {
        Self {
            sink: Sink::Memory(Default::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn recorded(&self) -> Vec<Value> {
        match &self.sink {
            Sink::Memory(lines) => lines.lock().clone(),
            _ => Vec::new(),
        }
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        match &self.sink {
            Sink::Off => {}
            Sink::Stderr => {
                let line = event_line(event_type, payload);
                let mut stderr = io::stderr().lock();
                let _ = writeln!(stderr, "{line}");
            }
            #[cfg(test)]
            Sink::Memory(lines) => lines.lock().push(event_line(event_type, payload)),
        }
    }
}

fn event_line<T: Serialize>(event_type: &str, payload: T) -> Value {
    json!({
        "ts": Utc::now().to_rfc3339(),
        "type": event_type,
        "payload": payload,
    })
}
