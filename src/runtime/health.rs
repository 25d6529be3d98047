use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub updated_at: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Per-component status map owned by the runtime.
pub struct HealthRegistry {
    started_at: Instant,
    components: RwLock<BTreeMap<String, ComponentHealth>>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            components: RwLock::new(BTreeMap::new()),
        }
    }

    fn upsert<F>(&self, component: &str, update: F)
    where
        F: FnOnce(&mut ComponentHealth),
    {
        if let Ok(mut map) = self.components.write() {
            let now = now_rfc3339();
            let entry = map
                .entry(component.to_string())
                .or_insert_with(|| ComponentHealth {
                    status: "starting".into(),
                    updated_at: now.clone(),
                    last_ok: None,
                    last_error: None,
                });
            update(entry);
            entry.updated_at = now;
        }
    }

    pub fn mark_ok(&self, component: &str) {
        self.upsert(component, |entry| {
            entry.status = "ok".into();
            entry.last_ok = Some(now_rfc3339());
            entry.last_error = None;
        });
    }

    #[allow(clippy::needless_pass_by_value)]
    pub fn mark_error(&self, component: &str, error: impl ToString) {
        let err = error.to_string();
        self.upsert(component, move |entry| {
            entry.status = "error".into();
            entry.last_error = Some(err);
        });
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let components = self
            .components
            .read()
            .map_or_else(|_| BTreeMap::new(), |map| map.clone());

        HealthSnapshot {
            pid: std::process::id(),
            updated_at: now_rfc3339(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            components,
        }
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| {
            serde_json::json!({
                "status": "error",
                "message": "failed to serialize health snapshot"
            })
        })
    }
}
