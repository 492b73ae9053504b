//! JSONL event log persistence on teardown (spec §6.3).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::Serialize;

use rig_domain::Environment;
use rig_eventlog::event::{Event, EventType};

const PRUNE_AGE: Duration = Duration::from_secs(72 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Crashed,
}

#[derive(Serialize)]
struct LogHeader {
    #[serde(rename = "type")]
    header_type: &'static str,
    environment: String,
    outcome: Outcome,
    services: Vec<String>,
    duration_ms: f64,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Derives the run outcome from the full event set (spec §6.3's ordered
/// rule list; the first matching rule wins).
pub fn derive_outcome(events: &[Event]) -> Outcome {
    if events.iter().any(|e| e.event_type == EventType::EnvironmentFailing) {
        Outcome::Crashed
    } else if events.iter().any(|e| e.event_type == EventType::TestFailed) {
        Outcome::Failed
    } else if events.iter().any(|e| e.event_type == EventType::TestNote) {
        Outcome::Failed
    } else {
        Outcome::Passed
    }
}

/// Writes `<rigDir>/logs/<name>-<id>.jsonl` (and a human-readable `.log`
/// sibling) with the synthetic header line first, then one event per
/// line. Prunes anything in the log directory older than 72 h, best
/// effort.
pub fn write_log(rig_dir: &Path, environment: &Environment, id: &str, events: &[Event]) -> Result<PathBuf> {
    let log_dir = rig_dir.join("logs");
    std::fs::create_dir_all(&log_dir).context("creating log directory")?;

    let outcome = derive_outcome(events);
    let duration_ms = events
        .last()
        .zip(events.first())
        .map(|(last, first)| (last.timestamp - first.timestamp).num_milliseconds() as f64)
        .unwrap_or(0.0);

    let header = LogHeader {
        header_type: "log.header",
        environment: environment.name.clone(),
        outcome,
        services: environment.services.keys().cloned().collect(),
        duration_ms,
        timestamp: chrono::Utc::now(),
    };

    let jsonl_path = log_dir.join(format!("{}-{id}.jsonl", environment.name));
    let mut jsonl = std::fs::File::create(&jsonl_path).context("creating jsonl log")?;
    writeln!(jsonl, "{}", serde_json::to_string(&header)?)?;
    for event in events {
        writeln!(jsonl, "{}", serde_json::to_string(event)?)?;
    }

    let text_path = log_dir.join(format!("{}-{id}.log", environment.name));
    let mut text = std::fs::File::create(&text_path).context("creating human-readable log")?;
    writeln!(
        text,
        "environment={} outcome={:?} services={}",
        environment.name,
        outcome,
        header.services.join(",")
    )?;
    for event in events {
        writeln!(
            text,
            "[{}] seq={} {:?} service={:?}{}",
            event.timestamp.to_rfc3339(),
            event.seq,
            event.event_type,
            event.service,
            event.message.as_deref().map(|m| format!(" message={m}")).unwrap_or_default(),
        )?;
    }

    prune_old_logs(&log_dir);

    Ok(jsonl_path)
}

fn prune_old_logs(log_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        if now.duration_since(modified).unwrap_or_default() > PRUNE_AGE {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}
