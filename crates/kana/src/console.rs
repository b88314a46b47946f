use std::collections::HashSet;
use std::sync::Mutex;

use kana_docker::{ProgressSink, PullProgress};

/// Prints image pulls to stderr, one line per layer state change.
#[derive(Default)]
pub struct ConsoleProgress {
    seen: Mutex<HashSet<(String, String)>>,
}

impl ProgressSink for ConsoleProgress {
    fn pull_started(&self, reference: &str) {
        eprintln!("Pulling {reference}");
    }

    fn pull_progress(&self, _reference: &str, event: &PullProgress) {
        let Some(layer) = &event.id else {
            eprintln!("{}", event.status);
            return;
        };
        // Byte-level "Downloading" updates repeat the same status many times.
        let key = (layer.clone(), event.status.clone());
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.insert(key) {
            eprintln!("  {layer}: {}", event.status);
        }
    }
}
