//! Wake word gating
//!
//! Each configured phrase has a keyword model producing one probability per
//! feature frame and a [`WakeGate`] smoothing those probabilities over a
//! sliding window. Detection fires on the window mean, not single-frame
//! spikes. The session debounces simultaneous fires across phrases.

use std::collections::VecDeque;
use std::path::Path;

use serde::Deserialize;

use crate::protocol::api::{VoiceAssistantConfigurationResponse, VoiceAssistantWakeWord};
use crate::voice::models::WakeModel;
use crate::{Error, Result};

/// Sliding-window edge detector over per-frame probabilities
#[derive(Debug)]
pub struct WakeGate {
    window: VecDeque<f32>,
    capacity: usize,
    cutoff: f32,
}

impl WakeGate {
    /// Create a gate with the given window size and mean cutoff.
    #[must_use]
    pub fn new(capacity: usize, cutoff: f32) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            cutoff,
        }
    }

    /// Push one probability and report whether detection fired on this call.
    ///
    /// Fires only once the window is at capacity and its arithmetic mean
    /// exceeds the cutoff.
    pub fn observe(&mut self, probability: f32) -> bool {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(probability);

        if self.window.len() < self.capacity {
            return false;
        }

        #[allow(clippy::cast_precision_loss)]
        let mean = self.window.iter().sum::<f32>() / self.window.len() as f32;
        mean > self.cutoff
    }

    /// Drop all buffered probabilities.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// Whether a phrase wakes the satellite or stops the active turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeKind {
    Wake,
    Stop,
}

/// Edge event produced by the bank for one frame cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeEdge {
    pub kind: WakeKind,
    pub phrase: String,
}

/// Static metadata for one configured phrase
#[derive(Debug, Clone)]
pub struct WakeWordMeta {
    pub id: String,
    pub phrase: String,
    pub trained_languages: Vec<String>,
    pub cutoff: f32,
    pub window_size: usize,
}

/// Model manifest layout shipped next to each keyword model
#[derive(Debug, Deserialize)]
struct Manifest {
    wake_word: String,
    #[serde(default)]
    trained_languages: Vec<String>,
    micro: ManifestMicro,
}

#[derive(Debug, Deserialize)]
struct ManifestMicro {
    probability_cutoff: f32,
    sliding_window_size: usize,
}

impl WakeWordMeta {
    /// Load metadata from a JSON manifest file. The file stem becomes the id,
    /// and `cutoff_override` (if set) replaces the manifest cutoff.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_manifest(path: &Path, cutoff_override: Option<f32>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&content)?;
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| Error::WakeWord(format!("bad manifest path: {}", path.display())))?;

        Ok(Self {
            id,
            phrase: manifest.wake_word,
            trained_languages: manifest.trained_languages,
            cutoff: cutoff_override.unwrap_or(manifest.micro.probability_cutoff),
            window_size: manifest.micro.sliding_window_size,
        })
    }
}

struct BankEntry {
    meta: WakeWordMeta,
    kind: WakeKind,
    active: bool,
    model: Box<dyn WakeModel>,
    gate: WakeGate,
}

/// One gate+model pair per configured phrase
///
/// Wake phrases are only evaluated while the satellite is idle; stop phrases
/// are evaluated on every frame so a turn in progress can be interrupted.
pub struct WakeWordBank {
    entries: Vec<BankEntry>,
}

impl WakeWordBank {
    /// Create an empty bank.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a phrase with its model. The first wake phrase added starts
    /// out active.
    pub fn add(&mut self, meta: WakeWordMeta, kind: WakeKind, model: Box<dyn WakeModel>) {
        let active = kind == WakeKind::Stop
            || !self
                .entries
                .iter()
                .any(|e| e.kind == WakeKind::Wake && e.active);
        let gate = WakeGate::new(meta.window_size, meta.cutoff);
        self.entries.push(BankEntry {
            meta,
            kind,
            active,
            model,
            gate,
        });
    }

    /// Run one audio frame through the active models and collect edges.
    ///
    /// `idle` selects whether wake phrases participate; stop phrases always
    /// do.
    pub fn observe(&mut self, samples: &[i16], idle: bool) -> Vec<WakeEdge> {
        let mut edges = Vec::new();
        for entry in &mut self.entries {
            if !entry.active {
                continue;
            }
            if entry.kind == WakeKind::Wake && !idle {
                continue;
            }
            let probability = entry.model.predict(samples);
            if entry.gate.observe(probability) {
                edges.push(WakeEdge {
                    kind: entry.kind,
                    phrase: entry.meta.phrase.clone(),
                });
            }
        }
        edges
    }

    /// Clear every gate window.
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.gate.reset();
        }
    }

    /// Build the wake word configuration advertised to the hub.
    #[must_use]
    pub fn configuration(&self) -> VoiceAssistantConfigurationResponse {
        let available_wake_words = self
            .entries
            .iter()
            .filter(|e| e.kind == WakeKind::Wake)
            .map(|e| VoiceAssistantWakeWord {
                id: e.meta.id.clone(),
                wake_word: e.meta.phrase.clone(),
                trained_languages: e.meta.trained_languages.clone(),
            })
            .collect();
        let active_wake_words = self
            .entries
            .iter()
            .filter(|e| e.kind == WakeKind::Wake && e.active)
            .map(|e| e.meta.id.clone())
            .collect();

        VoiceAssistantConfigurationResponse {
            available_wake_words,
            active_wake_words,
            max_active_wake_words: 1,
        }
    }

    /// Activate the given wake phrase ids, ignoring unknown ones.
    ///
    /// Returns the ids that were ignored.
    pub fn set_active(&mut self, ids: &[String]) -> Vec<String> {
        let known: Vec<String> = ids
            .iter()
            .filter(|id| self.entries.iter().any(|e| e.meta.id == **id))
            .cloned()
            .collect();

        if !known.is_empty() {
            for entry in &mut self.entries {
                if entry.kind == WakeKind::Wake {
                    entry.active = known.contains(&entry.meta.id);
                    entry.gate.reset();
                }
            }
        }

        ids.iter()
            .filter(|id| !known.contains(id))
            .cloned()
            .collect()
    }
}

impl Default for WakeWordBank {
    fn default() -> Self {
        Self::new()
    }
}
