#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use loopguard::Config;
use loopguard::decision::{Decision, DecisionContext, DecisionFunction, DecisionFuture};
use loopguard::error::DecisionError;
use loopguard::events::{DEFAULT_MAX_BYTES, EventStore};
use loopguard::kernel::Kernel;

pub type Step = Result<Decision, DecisionError>;

pub fn ok(decision: &str, confidence: f64) -> Step {
    Ok(Decision::new(decision, confidence, "scripted"))
}

pub fn fail(reason: &str) -> Step {
    Err(DecisionError::Failed(reason.into()))
}

/// Plays back scripted results; the last one repeats forever.
pub struct ScriptedDecider {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedDecider {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            delay: None,
        })
    }

    pub fn slow(steps: Vec<Step>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DecisionFunction for ScriptedDecider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn decide<'a>(&'a self, _context: &'a DecisionContext) -> DecisionFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut steps = self.steps.lock().unwrap();
            if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                steps.front().cloned().expect("script must not be empty")
            }
        };
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            next
        })
    }
}

/// Config rooted in `tmp` with fast backoff and in-memory events.
pub fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config {
        workspace_dir: tmp.path().to_path_buf(),
        config_path: tmp.path().join("config.toml"),
        ..Config::default()
    };
    config.recovery.base_backoff_ms = 1;
    config.recovery.max_backoff_ms = 4;
    config.events.persist = false;
    std::fs::create_dir_all(tmp.path().join("state")).unwrap();
    config
}

pub fn build_kernel(config: &Config, decider: Arc<dyn DecisionFunction>) -> (Kernel, Arc<EventStore>) {
    let events = Arc::new(EventStore::in_memory(10_000, DEFAULT_MAX_BYTES));
    let kernel = Kernel::new(config, decider, Arc::clone(&events));
    (kernel, events)
}

pub fn write_state(path: &Path, decision: &str, confidence: f64) {
    let body = format!(
        "[decision]\nlast_decision = \"{decision}\"\nconfidence_score = {confidence:?}\n\
         justification = \"seeded\"\ntimestamp = \"2026-01-01T00:00:00Z\"\n"
    );
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}
