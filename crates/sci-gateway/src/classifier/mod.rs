//! Intent classification: maps a chat request to a routing domain, a
//! confidence score and the structured parameters the domain backend needs.
//!
//! Classification is a pure function of the request. Anything that is
//! unclear (weak signals, a tie, a missing required input) resolves to the
//! general model rather than an error.

pub mod extract;
pub mod rules;

use tracing::debug;

use crate::domain::{Domain, DomainIntent, IntentParams};
use crate::error::GatewayError;
use crate::protocol::ChatRequest;
pub use rules::{ClassifierPolicy, PolicySpec};

pub struct IntentClassifier {
    policy: ClassifierPolicy,
    threshold: f32,
}

impl IntentClassifier {
    pub fn new(policy: ClassifierPolicy, threshold: f32) -> Self {
        Self {
            policy,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn with_threshold(threshold: f32) -> Self {
        Self::new(ClassifierPolicy::default(), threshold)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Scores of every specialized domain with any signal, highest first.
    pub fn score(&self, text: &str, hint: Option<Domain>) -> Vec<(Domain, f32)> {
        let mut scores = self.policy.score(text);
        let found = extract::sequences(text);

        // Runs shorter than MIN_BARE_SEQUENCE count only next to a keyword or hint.
        let announced = |domain: Domain| hint == Some(domain) || scores.iter().any(|(d, _)| *d == domain);
        let counts = |domain: Domain, runs: &[String]| {
            !runs.is_empty()
                && (announced(domain) || runs.iter().any(|s| s.len() >= extract::MIN_BARE_SEQUENCE))
        };
        let protein_found = counts(Domain::ProteinStructure, &found.proteins);
        let dna_found = counts(Domain::GenomicSequence, &found.dna);

        let mut boost = |domain: Domain, weight: f32| match scores.iter_mut().find(|(d, _)| *d == domain) {
            Some((_, score)) => *score = rules::noisy_or([*score, weight]),
            None => scores.push((domain, weight)),
        };
        if protein_found {
            boost(Domain::ProteinStructure, self.policy.sequence_weight);
        }
        if dna_found {
            boost(Domain::GenomicSequence, self.policy.sequence_weight);
        }
        if let Some(domain) = hint.filter(|d| d.is_specialized()) {
            boost(domain, self.policy.hint_weight);
        }

        scores.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scores
    }

    pub fn classify(&self, request: &ChatRequest) -> Result<DomainIntent, GatewayError> {
        let text = request
            .latest_user_message()
            .ok_or_else(|| GatewayError::InvalidRequest("request contains no user message".to_string()))?;

        if request.domain_hint == Some(Domain::General) {
            return Ok(DomainIntent::general(1.0));
        }

        let scores = self.score(text, request.domain_hint);
        let Some(&(domain, top)) = scores.first() else {
            return Ok(DomainIntent::general(1.0));
        };
        if top < self.threshold {
            debug!("Top domain {} scored {:.2}, below threshold {:.2}", domain, top, self.threshold);
            return Ok(DomainIntent::general(1.0 - top));
        }
        if let Some(&(runner_up, second)) = scores.get(1) {
            if top - second < self.policy.tie_margin {
                debug!("Tie between {} ({:.2}) and {} ({:.2})", domain, top, runner_up, second);
                return Ok(DomainIntent::general(1.0 - top));
            }
        }

        let Some((params, unparsed)) = build_params(domain, text) else {
            debug!("{} matched but its required input is missing", domain);
            return Ok(DomainIntent::general(1.0 - top));
        };

        let confidence = top * self.policy.unparsed_penalty.powi(unparsed as i32);
        if confidence < self.threshold {
            debug!(
                "{} confidence {:.2} fell below threshold after {} unparsed parameter(s)",
                domain, confidence, unparsed
            );
            return Ok(DomainIntent::general(1.0 - confidence));
        }

        debug!("Classified as {} ({:.2}), task {}", domain, confidence, params.task_name());
        Ok(DomainIntent::new(domain, confidence, params))
    }
}

/// Parameters for `domain`, plus the count of mentioned-but-unparsed values.
/// `None` when an input the backend cannot work without is absent.
fn build_params(domain: Domain, text: &str) -> Option<(IntentParams, u32)> {
    match domain {
        Domain::General => Some((IntentParams::Chat, 0)),
        Domain::ProteinStructure => {
            let mut proteins = extract::sequences(text).proteins;
            if proteins.is_empty() {
                return None;
            }
            let structure = extract::wants_structure(text)
                || (proteins.len() > 1 && !extract::wants_completion(text));
            if structure {
                return Some((IntentParams::ProteinStructure { sequences: proteins }, 0));
            }
            let flanks = extract::flank_lengths(text);
            let (left_len, right_len) = flanks.value;
            let sequence = proteins.remove(0);
            Some((
                IntentParams::ProteinCompletion {
                    sequence,
                    left_len,
                    right_len,
                    extra_sequences: proteins,
                },
                flanks.unparsed,
            ))
        }
        Domain::GenomicSequence => {
            let sequence = extract::sequences(text).dna.into_iter().next()?;
            let tokens = extract::dna_num_tokens(text);
            Some((
                IntentParams::DnaContinuation {
                    sequence,
                    num_tokens: tokens.value,
                },
                tokens.unparsed,
            ))
        }
        Domain::SpectralAnalysis => Some((IntentParams::Spectrum { query: text.to_string() }, 0)),
        Domain::MaterialsGeneration => {
            let found = extract::materials(text);
            let request = found.value;
            Some((
                IntentParams::Materials {
                    batch_size: request.batch_size,
                    num_batches: request.num_batches,
                    properties: (!request.properties.is_empty()).then_some(request.properties),
                },
                found.unparsed,
            ))
        }
        Domain::FieldSimulation => {
            let found = extract::field(text);
            let request = found.value;
            request.geometry_url.as_ref()?;
            Some((
                IntentParams::Field {
                    geometry_url: request.geometry_url,
                    velocity: request.velocity,
                    wind: request.wind,
                },
                found.unparsed,
            ))
        }
    }
}
