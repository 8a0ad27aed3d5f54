//! Scalar logging sink.
//!
//! Training records `(tag, value, global_step)` triples every step. They are
//! kept in memory and exported once, at the end of training, as
//! `{tag: [[wall_time, step, value], ...]}`.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tag of the per-step reconstruction loss.
pub const REC_LOSS_TAG: &str = "train/rec_loss";
/// Tag of the per-step KL loss.
pub const KLD_LOSS_TAG: &str = "train/kld_loss";

/// One recorded value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent(
    /// Seconds since the Unix epoch.
    pub f64,
    /// Global step.
    pub u64,
    /// Value.
    pub f64,
);

impl ScalarEvent {
    /// Global step of the event.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.1
    }

    /// Recorded value.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.2
    }
}

/// In-memory scalar store.
#[derive(Debug, Default, Clone)]
pub struct ScalarWriter {
    scalars: BTreeMap<String, Vec<ScalarEvent>>,
}

impl ScalarWriter {
    /// Create an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` for `tag` at `step`.
    pub fn add_scalar(&mut self, tag: &str, value: f64, step: u64) {
        let wall_time = Utc::now().timestamp_micros() as f64 / 1e6;
        self.scalars
            .entry(tag.to_string())
            .or_default()
            .push(ScalarEvent(wall_time, step, value));
    }

    /// Events recorded for `tag`, oldest first.
    #[must_use]
    pub fn scalars(&self, tag: &str) -> &[ScalarEvent] {
        self.scalars.get(tag).map_or(&[], Vec::as_slice)
    }

    /// Recorded tags.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.scalars.keys().map(String::as_str)
    }

    /// Write every recorded scalar to `path` as JSON.
    pub fn export_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(&self.scalars)?;
        std::fs::write(path, json)?;
        tracing::info!("Exported scalars to {}", path.display());
        Ok(())
    }

    /// Read scalars back from a file written by [`ScalarWriter::export_json`].
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let scalars = serde_json::from_str(&content)?;
        Ok(Self { scalars })
    }
}
