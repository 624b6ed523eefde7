//! Ollama-backed implementations of the engine's collaborator ports.
//!
//! Prompts instruct the model to answer with JSON only; parsing is
//! defensive, tolerating code fences and stray prose around the object.
//! Where a port promises degraded behavior on failure (extraction), the
//! adapter returns the empty value and logs; where the caller handles the
//! failure (assessment), the error propagates.
use std::sync::Arc;

use anyhow::Context;
use tracing::warn;

use crate::embeddings::EmbeddingProvider;
use crate::extractor::{Analysis, Concept, Entity, SemanticExtractor};
use crate::models::TagId;
use crate::refiner::{Assessment, Relevance, RelevanceAssessor, TagJudgment, TagSuggestion};

use super::OllamaClientTrait;

/// Prompt for concept and entity extraction.
///
/// Few-shot examples pin the output shape; instructions keep names in the
/// registry's normalized form so downstream resolution is cheap.
const EXTRACTION_PROMPT: &str = r#"Analyze the document below and identify what it is about. Return ONLY a JSON object with "concepts" and "entities" arrays. Do not include any explanatory text.

INSTRUCTIONS:
1. Concepts are the primary topics the document is ABOUT, not things mentioned in passing
2. Identify 3-7 concepts depending on document complexity
3. Use lowercase concept names with hyphens instead of spaces (e.g., "machine-learning")
4. Score each concept's importance from 0.0 to 1.0 by how central it is
5. Entities are named things (people, technologies, organizations) with a short kind

EXAMPLE:

Input: "Learning async Rust. The tokio runtime makes concurrent programming much easier than manual thread management."
Output: {"concepts": [{"name": "async", "importance": 0.95, "description": "asynchronous programming"}, {"name": "rust", "importance": 0.95, "description": null}, {"name": "concurrency", "importance": 0.75, "description": null}], "entities": [{"name": "tokio", "kind": "technology", "description": "async runtime"}]}

DOCUMENT:
{content}

JSON OUTPUT:"#;

/// Prompt for judging an existing tag set and proposing additions.
const ASSESSMENT_PROMPT: &str = r#"Judge how relevant each current tag is to the document below, and suggest tags the document should carry but does not. Return ONLY a JSON object. Do not include any explanatory text.

INSTRUCTIONS:
1. For every current tag, assign a relevance of "high", "medium" or "low"
2. "low" means the tag does not fit the document's content
3. Suggest at most 3 new tags, each with a relevance and a one-sentence reasoning
4. Use lowercase suggestion names with hyphens instead of spaces

OUTPUT FORMAT:
{"judgments": {"tag-name": "high"}, "suggestions": [{"name": "new-tag", "relevance": "high", "reasoning": "why it fits"}]}

CURRENT TAGS:
{tags}

DOCUMENT:
{content}

JSON OUTPUT:"#;

/// Extracts the first balanced-looking JSON object from a model response,
/// tolerating markdown fences and surrounding prose.
fn extract_json(response: &str) -> Option<&str> {
    let trimmed = response.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (start <= end).then(|| &trimmed[start..=end])
}

fn parse_relevance(s: &str) -> Option<Relevance> {
    match s.to_lowercase().as_str() {
        "high" => Some(Relevance::High),
        "medium" => Some(Relevance::Medium),
        "low" => Some(Relevance::Low),
        _ => None,
    }
}

/// [`EmbeddingProvider`] backed by Ollama's `/api/embeddings`.
pub struct OllamaEmbedding {
    client: Arc<dyn OllamaClientTrait>,
    model: String,
}

impl OllamaEmbedding {
    pub fn new(client: Arc<dyn OllamaClientTrait>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

impl EmbeddingProvider for OllamaEmbedding {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.client
            .embed(&self.model, text)
            .context("embedding request failed")
    }
}

/// [`SemanticExtractor`] backed by Ollama generation.
///
/// Any failure, transport or parse, yields an empty analysis so tagging
/// proceeds without the extractor's input.
pub struct OllamaExtractor {
    client: Arc<dyn OllamaClientTrait>,
    model: String,
}

impl OllamaExtractor {
    pub fn new(client: Arc<dyn OllamaClientTrait>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

impl SemanticExtractor for OllamaExtractor {
    fn analyze(&self, text: &str) -> anyhow::Result<Analysis> {
        let prompt = EXTRACTION_PROMPT.replace("{content}", text);

        let response = match self.client.generate(&self.model, &prompt) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "extraction request failed, returning empty analysis");
                return Ok(Analysis::default());
            }
        };

        let Some(json_str) = extract_json(&response) else {
            warn!("no JSON object in extraction response, returning empty analysis");
            return Ok(Analysis::default());
        };
        let json: serde_json::Value = match serde_json::from_str(json_str) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "malformed extraction JSON, returning empty analysis");
                return Ok(Analysis::default());
            }
        };

        Ok(parse_analysis(&json))
    }
}

fn parse_analysis(json: &serde_json::Value) -> Analysis {
    let concepts = json
        .get("concepts")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let name = item.get("name")?.as_str()?.trim();
                    if name.is_empty() {
                        return None;
                    }
                    let importance = item
                        .get("importance")
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.5)
                        .clamp(0.0, 1.0);
                    Some(Concept {
                        name: name.to_string(),
                        importance,
                        description: item
                            .get("description")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let entities = json
        .get("entities")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let name = item.get("name")?.as_str()?.trim();
                    if name.is_empty() {
                        return None;
                    }
                    Some(Entity {
                        name: name.to_string(),
                        kind: item
                            .get("kind")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                        description: item
                            .get("description")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Analysis { concepts, entities }
}

/// [`RelevanceAssessor`] backed by Ollama generation.
///
/// Transport and parse failures propagate as errors; the refiner turns
/// them into a skipped pass.
pub struct OllamaAssessor {
    client: Arc<dyn OllamaClientTrait>,
    model: String,
}

impl OllamaAssessor {
    pub fn new(client: Arc<dyn OllamaClientTrait>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

impl RelevanceAssessor for OllamaAssessor {
    fn assess(
        &self,
        content: &str,
        current_tags: &[(TagId, String)],
    ) -> anyhow::Result<Assessment> {
        let tag_list = current_tags
            .iter()
            .map(|(_, name)| format!("- {name}"))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = ASSESSMENT_PROMPT
            .replace("{tags}", &tag_list)
            .replace("{content}", content);

        let response = self
            .client
            .generate(&self.model, &prompt)
            .context("assessment request failed")?;
        let json_str =
            extract_json(&response).context("no JSON object in assessment response")?;
        let json: serde_json::Value =
            serde_json::from_str(json_str).context("malformed assessment JSON")?;

        // Judgments come back keyed by tag name; map them to ids, dropping
        // names the model invented.
        let mut tag_judgments = Vec::new();
        if let Some(judgments) = json.get("judgments").and_then(|v| v.as_object()) {
            for (name, value) in judgments {
                let Some(relevance) = value.as_str().and_then(parse_relevance) else {
                    continue;
                };
                let matched = current_tags
                    .iter()
                    .find(|(_, tag_name)| tag_name.eq_ignore_ascii_case(name));
                if let Some((tag_id, _)) = matched {
                    tag_judgments.push(TagJudgment {
                        tag_id: *tag_id,
                        relevance,
                    });
                }
            }
        }

        let suggestions = json
            .get("suggestions")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let name = item.get("name")?.as_str()?.trim();
                        if name.is_empty() {
                            return None;
                        }
                        let relevance = item
                            .get("relevance")
                            .and_then(|v| v.as_str())
                            .and_then(parse_relevance)?;
                        Some(TagSuggestion {
                            name: name.to_string(),
                            relevance,
                            reasoning: item
                                .get("reasoning")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Assessment {
            tag_judgments,
            suggestions,
        })
    }
}
