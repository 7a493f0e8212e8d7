//! Closed set of routing domains and the per-request intent built from them.
//!
//! New domains are added as a variant here plus a registry entry; there is
//! no dynamic discovery of capabilities.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    General,
    ProteinStructure,
    GenomicSequence,
    SpectralAnalysis,
    MaterialsGeneration,
    FieldSimulation,
}

impl Domain {
    pub const ALL: [Domain; 6] = [
        Domain::General,
        Domain::ProteinStructure,
        Domain::GenomicSequence,
        Domain::SpectralAnalysis,
        Domain::MaterialsGeneration,
        Domain::FieldSimulation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::General => "general",
            Domain::ProteinStructure => "protein_structure",
            Domain::GenomicSequence => "genomic_sequence",
            Domain::SpectralAnalysis => "spectral_analysis",
            Domain::MaterialsGeneration => "materials_generation",
            Domain::FieldSimulation => "field_simulation",
        }
    }

    /// Human readable label used in degraded-answer notes.
    pub fn label(&self) -> &'static str {
        match self {
            Domain::General => "general scientific model",
            Domain::ProteinStructure => "protein model",
            Domain::GenomicSequence => "genomic sequence model",
            Domain::SpectralAnalysis => "spectral analysis model",
            Domain::MaterialsGeneration => "materials generation model",
            Domain::FieldSimulation => "field simulation model",
        }
    }

    pub fn is_specialized(&self) -> bool {
        !matches!(self, Domain::General)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .iter()
            .copied()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown domain: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Structured parameters pulled out of the prompt. Every field that could
/// not be parsed is `None` so the backend applies its own default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum IntentParams {
    /// Free-form chat, answered by an OpenAI-compatible model.
    Chat,
    ProteinCompletion {
        sequence: String,
        left_len: Option<u32>,
        right_len: Option<u32>,
        /// Further independent sequences completed with the same lengths.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        extra_sequences: Vec<String>,
    },
    ProteinStructure {
        sequences: Vec<String>,
    },
    DnaContinuation {
        sequence: String,
        num_tokens: Option<u32>,
    },
    Spectrum {
        query: String,
    },
    Materials {
        batch_size: Option<u32>,
        num_batches: Option<u32>,
        properties: Option<serde_json::Map<String, serde_json::Value>>,
    },
    Field {
        geometry_url: Option<String>,
        velocity: Option<Vector3>,
        wind: Option<Vector3>,
    },
}

impl IntentParams {
    pub fn task_name(&self) -> &'static str {
        match self {
            IntentParams::Chat => "chat",
            IntentParams::ProteinCompletion { .. } => "protein_completion",
            IntentParams::ProteinStructure { .. } => "protein_structure",
            IntentParams::DnaContinuation { .. } => "dna_continuation",
            IntentParams::Spectrum { .. } => "spectrum",
            IntentParams::Materials { .. } => "materials",
            IntentParams::Field { .. } => "field",
        }
    }

    /// Split a batched task into one task per independent input.
    pub fn split(&self) -> Vec<IntentParams> {
        match self {
            IntentParams::ProteinCompletion {
                sequence,
                left_len,
                right_len,
                extra_sequences,
            } if !extra_sequences.is_empty() => std::iter::once(sequence)
                .chain(extra_sequences.iter())
                .map(|seq| IntentParams::ProteinCompletion {
                    sequence: seq.clone(),
                    left_len: *left_len,
                    right_len: *right_len,
                    extra_sequences: Vec::new(),
                })
                .collect(),
            other => vec![other.clone()],
        }
    }
}

/// Result of classifying one request. Request-scoped, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainIntent {
    pub domain: Domain,
    pub confidence: f32,
    pub params: IntentParams,
}

impl DomainIntent {
    pub fn general(confidence: f32) -> Self {
        Self {
            domain: Domain::General,
            confidence: confidence.clamp(0.0, 1.0),
            params: IntentParams::Chat,
        }
    }

    pub fn new(domain: Domain, confidence: f32, params: IntentParams) -> Self {
        Self {
            domain,
            confidence: confidence.clamp(0.0, 1.0),
            params,
        }
    }

    pub fn meets(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }
}
