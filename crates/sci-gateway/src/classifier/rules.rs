//! Keyword and pattern rules that score a prompt against each domain.
//!
//! Signals combine as a noisy-or, `1 - Π(1 - w)`, so every extra matching
//! signal raises the score without ever passing 1.0. The built-in rule set
//! can be replaced with a JSON policy file.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::Domain;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedTerm {
    pub term: String,
    pub weight: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub domain: Domain,
    /// Case-insensitive substrings.
    #[serde(default)]
    pub keywords: Vec<WeightedTerm>,
    /// Regular expressions.
    #[serde(default)]
    pub patterns: Vec<WeightedTerm>,
}

fn default_tie_margin() -> f32 {
    0.05
}

fn default_sequence_weight() -> f32 {
    0.6
}

fn default_hint_weight() -> f32 {
    0.5
}

fn default_unparsed_penalty() -> f32 {
    0.9
}

/// Serializable form of a classification policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySpec {
    /// Top two scores closer than this are a tie.
    #[serde(default = "default_tie_margin")]
    pub tie_margin: f32,
    /// Weight of an embedded protein or DNA sequence.
    #[serde(default = "default_sequence_weight")]
    pub sequence_weight: f32,
    /// Weight of an explicit `domain_hint` on the request.
    #[serde(default = "default_hint_weight")]
    pub hint_weight: f32,
    /// Multiplier applied once per parameter that could not be parsed.
    #[serde(default = "default_unparsed_penalty")]
    pub unparsed_penalty: f32,
    pub rules: Vec<RuleSpec>,
}

fn terms(items: &[(&str, f32)]) -> Vec<WeightedTerm> {
    items
        .iter()
        .map(|(term, weight)| WeightedTerm {
            term: term.to_string(),
            weight: *weight,
        })
        .collect()
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self {
            tie_margin: default_tie_margin(),
            sequence_weight: default_sequence_weight(),
            hint_weight: default_hint_weight(),
            unparsed_penalty: default_unparsed_penalty(),
            rules: vec![
                RuleSpec {
                    domain: Domain::ProteinStructure,
                    keywords: terms(&[
                        ("protein", 0.35), ("蛋白", 0.35), ("amino acid", 0.3), ("氨基酸", 0.3),
                        ("residue", 0.2), ("残基", 0.2), ("peptide", 0.3), ("多肽", 0.3),
                        ("esm3", 0.5), ("alphafold", 0.5), ("补全", 0.2), ("折叠", 0.15),
                        ("folding", 0.15), ("multimer", 0.3),
                    ]),
                    patterns: terms(&[(r"(?i)\b[nc][- ]?terminus\b|[NnCc]端", 0.25)]),
                },
                RuleSpec {
                    domain: Domain::GenomicSequence,
                    keywords: terms(&[
                        ("dna", 0.4), ("基因", 0.3), ("genome", 0.35), ("genomic", 0.35),
                        ("nucleotide", 0.35), ("核苷酸", 0.35), ("碱基", 0.35), ("evo2", 0.5),
                        ("脱氧核糖核酸", 0.4),
                    ]),
                    patterns: terms(&[(r"(?i)\b\d+\s*(?:bp|kb)\b", 0.25)]),
                },
                RuleSpec {
                    domain: Domain::SpectralAnalysis,
                    keywords: terms(&[
                        ("spectrum", 0.4), ("spectra", 0.4), ("spectroscopy", 0.4), ("光谱", 0.4),
                        ("谱图", 0.4), ("nmr", 0.5), ("核磁", 0.5), ("mass spec", 0.45), ("质谱", 0.45),
                        ("红外", 0.35), ("raman", 0.4), ("拉曼", 0.4), ("xrd", 0.45),
                        ("diffraction", 0.35), ("衍射", 0.35), ("smiles", 0.3), ("peaks", 0.15),
                        ("峰", 0.15), ("crystal system", 0.2),
                    ]),
                    patterns: terms(&[
                        (r"(?i)\d+(?:\.\d+)?\s*(?:cm-1|cm⁻¹|cm\^-1|ppm|m/z)", 0.45),
                        (r"(?i)\b(?:1h|13c)[- ]?nmr\b|\bir\s+spectr", 0.45),
                        (r"2θ|2theta", 0.35),
                    ]),
                },
                RuleSpec {
                    domain: Domain::MaterialsGeneration,
                    keywords: terms(&[
                        ("mattergen", 0.6), ("crystal", 0.3), ("晶体", 0.3), ("material", 0.25),
                        ("材料", 0.25), ("inorganic", 0.25), ("无机", 0.25), ("dft_mag_density", 0.45),
                        ("magnetic density", 0.35), ("磁密度", 0.35), ("band gap", 0.25), ("带隙", 0.25),
                        ("chemical system", 0.3), ("化学体系", 0.3), ("space group", 0.3), ("空间群", 0.3),
                        ("cif", 0.2), ("generate", 0.1), ("生成", 0.1),
                    ]),
                    patterns: terms(&[]),
                },
                RuleSpec {
                    domain: Domain::FieldSimulation,
                    keywords: terms(&[
                        ("aerodynamic", 0.45), ("气动", 0.45), ("flow field", 0.45), ("流场", 0.45),
                        ("pressure field", 0.4), ("压力场", 0.4), ("cfd", 0.4), ("drag", 0.25),
                        ("阻力", 0.25), ("升力", 0.25), ("lift coefficient", 0.3), ("crosswind", 0.3),
                        ("横风", 0.3), ("high-speed train", 0.3), ("高铁", 0.2), ("列车", 0.2),
                        ("geometry", 0.2), ("几何", 0.2), ("point cloud", 0.25), ("点云", 0.25),
                    ]),
                    patterns: terms(&[(r"(?i)https?://\S+\.(?:txt|xyz|csv|ply)\b", 0.3)]),
                },
            ],
        }
    }
}

struct CompiledRule {
    domain: Domain,
    keywords: Vec<(String, f32)>,
    patterns: Vec<(Regex, f32)>,
}

/// Compiled classification policy.
pub struct ClassifierPolicy {
    pub tie_margin: f32,
    pub sequence_weight: f32,
    pub hint_weight: f32,
    pub unparsed_penalty: f32,
    rules: Vec<CompiledRule>,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        // The built-in patterns are constants; compiling them cannot fail.
        Self::compile(PolicySpec::default()).unwrap_or_else(|_| Self::empty())
    }
}

impl ClassifierPolicy {
    fn empty() -> Self {
        let spec = PolicySpec { rules: Vec::new(), ..PolicySpec::default() };
        Self {
            tie_margin: spec.tie_margin,
            sequence_weight: spec.sequence_weight,
            hint_weight: spec.hint_weight,
            unparsed_penalty: spec.unparsed_penalty,
            rules: Vec::new(),
        }
    }

    pub fn compile(spec: PolicySpec) -> Result<Self> {
        let mut rules = Vec::with_capacity(spec.rules.len());
        for rule in spec.rules {
            if rule.domain == Domain::General {
                anyhow::bail!("general is the default domain and takes no rules");
            }
            let patterns = rule
                .patterns
                .iter()
                .map(|p| {
                    Regex::new(&p.term)
                        .map(|re| (re, p.weight.clamp(0.0, 1.0)))
                        .with_context(|| format!("invalid pattern for {}: {}", rule.domain, p.term))
                })
                .collect::<Result<Vec<_>>>()?;
            rules.push(CompiledRule {
                domain: rule.domain,
                keywords: rule
                    .keywords
                    .iter()
                    .map(|k| (k.term.to_lowercase(), k.weight.clamp(0.0, 1.0)))
                    .collect(),
                patterns,
            });
        }
        Ok(Self {
            tie_margin: spec.tie_margin.max(0.0),
            sequence_weight: spec.sequence_weight.clamp(0.0, 1.0),
            hint_weight: spec.hint_weight.clamp(0.0, 1.0),
            unparsed_penalty: spec.unparsed_penalty.clamp(0.0, 1.0),
            rules,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let spec: PolicySpec = serde_json::from_str(raw).context("classifier policy is not valid JSON")?;
        Self::compile(spec)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read classifier policy {}", path.display()))?;
        Self::from_json(&raw)
    }

    /// Keyword and pattern score of every specialized domain with at least
    /// one matching signal.
    pub fn score(&self, text: &str) -> Vec<(Domain, f32)> {
        let lowered = text.to_lowercase();
        self.rules
            .iter()
            .filter_map(|rule| {
                let weights = rule
                    .keywords
                    .iter()
                    .filter(|(kw, _)| lowered.contains(kw.as_str()))
                    .map(|(_, w)| *w)
                    .chain(rule.patterns.iter().filter(|(re, _)| re.is_match(text)).map(|(_, w)| *w));
                let score = noisy_or(weights);
                (score > 0.0).then_some((rule.domain, score))
            })
            .collect()
    }
}

pub fn noisy_or(weights: impl IntoIterator<Item = f32>) -> f32 {
    1.0 - weights.into_iter().fold(1.0, |miss, w| miss * (1.0 - w.clamp(0.0, 1.0)))
}
