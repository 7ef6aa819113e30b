// Personality profile derived from keyword hits in a user's chat history.
//
// Each dimension is a weighted keyword dictionary. Text is scanned once
// against the combined dictionary, longest keyword first, so overlapping
// keywords ("不要你管" vs a shorter prefix) count once. Accumulated scores are
// divided by the total reply length and squashed through a base-2 sigmoid.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{DimensionConfig, PersonalityConfig};
use crate::store::{ChatStore, ChatTurn};

/// Score every dimension gets when there is nothing to analyze.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// User messages count for half as much as replies.
const USER_MESSAGE_FACTOR: f64 = 0.5;

/// Sigmoid steepness and offset: `1 / (1 + 2^(-STEEPNESS * x + OFFSET))`.
const SIGMOID_STEEPNESS: f64 = 10.0;
const SIGMOID_OFFSET: f64 = 3.0;

const BASE_TEMPERATURE: f64 = 0.6;
const TSUNDERE_TEMPERATURE_GAIN: f64 = 0.3;
const HARSHNESS_TEMPERATURE_PENALTY: f64 = 0.2;

/// Compiled size cap for the combined keyword matcher.
pub const MATCHER_SIZE_LIMIT: usize = 10 * (1 << 20);

/// Compile one alternation over `keywords`, longest first so a keyword wins
/// over its own prefixes. Blank entries are skipped; `Ok(None)` means there is
/// nothing to match.
pub fn keyword_matcher<'a>(
    keywords: impl IntoIterator<Item = &'a str>,
    size_limit: usize,
) -> Result<Option<Regex>, regex::Error> {
    let mut keywords: Vec<&str> = keywords.into_iter().map(str::trim).filter(|k| !k.is_empty()).collect();
    if keywords.is_empty() {
        return Ok(None);
    }
    // The alternation is leftmost-first.
    keywords.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
    keywords.dedup();

    let pattern = keywords.iter().map(|k| regex::escape(k)).collect::<Vec<_>>().join("|");
    RegexBuilder::new(&pattern).size_limit(size_limit).build().map(Some)
}

#[derive(Debug, Clone)]
struct Dimension {
    id: String,
    label: String,
    weight: f64,
}

pub struct PersonalityAnalyzer {
    dimensions: Vec<Dimension>,
    matcher: Option<Regex>,
    /// keyword -> indices of the dimensions listing it
    owners: HashMap<String, Vec<usize>>,
}

impl PersonalityAnalyzer {
    pub fn new(config: &PersonalityConfig) -> Self {
        Self::from_dimensions(&config.dimensions)
    }

    pub fn from_dimensions(dims: &[DimensionConfig]) -> Self {
        let mut owners: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, dim) in dims.iter().enumerate() {
            for kw in dim.keywords.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
                let entry = owners.entry(kw.to_string()).or_default();
                if !entry.contains(&idx) {
                    entry.push(idx);
                }
            }
        }

        let matcher = match keyword_matcher(owners.keys().map(String::as_str), MATCHER_SIZE_LIMIT) {
            Ok(matcher) => matcher,
            Err(e) => {
                warn!(error = %e, keywords = owners.len(), "keyword dictionary rejected, scoring disabled");
                None
            }
        };

        let dimensions = dims
            .iter()
            .map(|d| Dimension {
                id: d.id.clone(),
                label: d.label.clone(),
                weight: d.weight,
            })
            .collect();

        Self {
            dimensions,
            matcher,
            owners,
        }
    }

    /// Dimension ids in configuration order.
    pub fn dimension_ids(&self) -> impl Iterator<Item = &str> {
        self.dimensions.iter().map(|d| d.id.as_str())
    }

    /// Unweighted keyword hit counts per dimension, in configuration order.
    pub fn keyword_hits(&self, text: &str) -> Vec<usize> {
        let mut hits = vec![0usize; self.dimensions.len()];
        let Some(matcher) = &self.matcher else {
            return hits;
        };
        for m in matcher.find_iter(text) {
            if let Some(idxs) = self.owners.get(m.as_str()) {
                for &idx in idxs {
                    hits[idx] += 1;
                }
            }
        }
        hits
    }

    /// Weighted scores per dimension for a single text.
    pub fn analyze_text(&self, text: &str) -> Vec<f64> {
        self.keyword_hits(text)
            .into_iter()
            .zip(&self.dimensions)
            .map(|(hits, dim)| hits as f64 * dim.weight)
            .collect()
    }

    /// Build a normalized profile from chat turns (any order).
    pub fn profile_from_turns(&self, turns: &[ChatTurn]) -> PersonalityProfile {
        if turns.is_empty() {
            return self.default_profile();
        }

        let mut totals = vec![0.0f64; self.dimensions.len()];
        let mut reply_length = 0usize;

        for turn in turns {
            let reply_scores = self.analyze_text(&turn.reply);
            let user_scores = self.analyze_text(&turn.user_message);
            for (total, (reply, user)) in totals.iter_mut().zip(reply_scores.into_iter().zip(user_scores)) {
                *total += reply + user * USER_MESSAGE_FACTOR;
            }
            reply_length += turn.reply.chars().count();
        }

        if reply_length == 0 {
            return self.default_profile();
        }

        let entries = self
            .dimensions
            .iter()
            .zip(totals)
            .map(|(dim, total)| ProfileEntry {
                id: dim.id.clone(),
                label: dim.label.clone(),
                score: normalize(total, reply_length),
            })
            .collect();

        PersonalityProfile { entries }
    }

    /// Profile from the last `window` turns of `user_id`'s history. Store
    /// failures degrade to the neutral profile.
    pub async fn generate_profile(
        &self,
        store: &dyn ChatStore,
        user_id: &str,
        window: usize,
    ) -> PersonalityProfile {
        match store.latest(user_id, window).await {
            Ok(turns) => {
                debug!(user_id, turns = turns.len(), "computing personality profile");
                self.profile_from_turns(&turns)
            }
            Err(e) => {
                warn!(user_id, error = %e, "history unavailable, using neutral profile");
                self.default_profile()
            }
        }
    }

    pub fn default_profile(&self) -> PersonalityProfile {
        PersonalityProfile {
            entries: self
                .dimensions
                .iter()
                .map(|dim| ProfileEntry {
                    id: dim.id.clone(),
                    label: dim.label.clone(),
                    score: NEUTRAL_SCORE,
                })
                .collect(),
        }
    }
}

fn normalize(score: f64, text_length: usize) -> f64 {
    let base = score / text_length as f64;
    let squashed = 1.0 / (1.0 + 2f64.powf(-SIGMOID_STEEPNESS * base + SIGMOID_OFFSET));
    round2(squashed)
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEntry {
    pub id: String,
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersonalityProfile {
    entries: Vec<ProfileEntry>,
}

impl PersonalityProfile {
    pub fn entries(&self) -> &[ProfileEntry] {
        &self.entries
    }

    /// Score for dimension `id`, if configured.
    pub fn get(&self, id: &str) -> Option<f64> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.score)
    }

    /// `{label: score}` in configuration order, as quoted to the model.
    pub fn to_prompt_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|e| (e.label.clone(), Value::from(e.score)))
            .collect();
        Value::Object(map)
    }

    /// Sampling temperature: more tsundere runs hotter, less gentle runs
    /// cooler. Unconfigured dimensions count as neutral.
    pub fn sampling_temperature(&self) -> f64 {
        let tsundere = self.get("tsundere").unwrap_or(NEUTRAL_SCORE);
        let gentleness = self.get("gentleness").unwrap_or(NEUTRAL_SCORE);
        BASE_TEMPERATURE + tsundere * TSUNDERE_TEMPERATURE_GAIN
            - (1.0 - gentleness) * HARSHNESS_TEMPERATURE_PENALTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChatRecord, SqliteStore};

    fn analyzer() -> PersonalityAnalyzer {
        PersonalityAnalyzer::new(&PersonalityConfig::default())
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn hits_match_keyword_list() {
        let a = analyzer();
        assert_eq!(a.keyword_hits("笨蛋！哼，讨厌"), vec![3, 0, 0]);
        assert_eq!(a.keyword_hits("谢谢，辛苦了，没关系"), vec![0, 3, 0]);
        assert_eq!(a.keyword_hits("敌人发动攻击，准备防御"), vec![0, 0, 3]);
        assert_eq!(a.keyword_hits("今天天气不错"), vec![0, 0, 0]);
    }

    #[test]
    fn repeated_keywords_count_each_time() {
        let a = analyzer();
        assert_eq!(a.keyword_hits("哼哼哼"), vec![3, 0, 0]);
    }

    #[test]
    fn longest_keyword_wins_and_hits_do_not_overlap() {
        let dims = vec![
            DimensionConfig {
                id: "long".into(),
                label: "long".into(),
                weight: 1.0,
                keywords: vec!["不要你管".into()],
            },
            DimensionConfig {
                id: "short".into(),
                label: "short".into(),
                weight: 1.0,
                keywords: vec!["不要".into()],
            },
        ];
        let a = PersonalityAnalyzer::from_dimensions(&dims);
        assert_eq!(a.keyword_hits("不要你管"), vec![1, 0]);
        assert_eq!(a.keyword_hits("不要走"), vec![0, 1]);
    }

    #[test]
    fn shared_keyword_counts_for_every_owner() {
        let dims = vec![
            DimensionConfig {
                id: "a".into(),
                label: "a".into(),
                weight: 1.0,
                keywords: vec!["x".into()],
            },
            DimensionConfig {
                id: "b".into(),
                label: "b".into(),
                weight: 2.0,
                keywords: vec!["x".into(), "".into()],
            },
        ];
        let a = PersonalityAnalyzer::from_dimensions(&dims);
        assert_eq!(a.keyword_hits("xx"), vec![2, 2]);
        assert_eq!(a.analyze_text("x"), vec![1.0, 2.0]);
    }

    #[test]
    fn keywords_are_matched_literally() {
        let dims = vec![DimensionConfig {
            id: "p".into(),
            label: "p".into(),
            weight: 1.0,
            keywords: vec!["a.b".into()],
        }];
        let a = PersonalityAnalyzer::from_dimensions(&dims);
        assert_eq!(a.keyword_hits("axb a.b"), vec![1]);
    }

    #[test]
    fn matcher_skips_blank_keywords() {
        assert!(keyword_matcher(["", "  "], MATCHER_SIZE_LIMIT).unwrap().is_none());
        let m = keyword_matcher(["哼", " 哼 ", "哼哼"], MATCHER_SIZE_LIMIT).unwrap().unwrap();
        assert_eq!(m.find("哼哼").map(|m| m.as_str()), Some("哼哼"));
    }

    #[test]
    fn oversized_dictionary_is_an_error() {
        let words: Vec<String> = (0..200).map(|i| format!("关键词{i}")).collect();
        assert!(keyword_matcher(words.iter().map(String::as_str), 64).is_err());
        assert!(keyword_matcher(words.iter().map(String::as_str), MATCHER_SIZE_LIMIT).is_ok());
    }

    #[test]
    fn analyze_text_applies_weights() {
        let scores = analyzer().analyze_text("笨蛋，谢谢，攻击");
        assert!(approx(scores[0], 1.2));
        assert!(approx(scores[1], 1.0));
        assert!(approx(scores[2], 0.8));
    }

    #[test]
    fn empty_history_is_neutral() {
        let profile = analyzer().profile_from_turns(&[]);
        assert!(profile.entries().iter().all(|e| e.score == NEUTRAL_SCORE));
        assert_eq!(profile.entries().len(), 3);
    }

    #[test]
    fn empty_replies_are_neutral() {
        let profile = analyzer().profile_from_turns(&[ChatTurn::new("笨蛋", "")]);
        assert_eq!(profile, analyzer().default_profile());
    }

    #[test]
    fn profile_normalizes_by_reply_length() {
        // gentleness: 1 hit / 3 chars -> 1 / (1 + 2^(-10/3 + 3)) = 0.5575...
        // others: 0 hits -> 1 / (1 + 2^3) = 0.111...
        let profile = analyzer().profile_from_turns(&[ChatTurn::new("你好", "谢谢你")]);
        assert_eq!(profile.get("gentleness"), Some(0.56));
        assert_eq!(profile.get("tsundere"), Some(0.11));
        assert_eq!(profile.get("combativeness"), Some(0.11));
    }

    #[test]
    fn user_messages_count_half() {
        // tsundere: 0.5 * 1.2 = 0.6 over 3 chars -> 1 / (1 + 2^1) = 0.333...
        let profile = analyzer().profile_from_turns(&[ChatTurn::new("笨蛋", "谢谢你")]);
        assert_eq!(profile.get("tsundere"), Some(0.33));
    }

    #[test]
    fn scores_stay_in_unit_range() {
        let turns = vec![ChatTurn::new("哼哼哼哼", "哼"), ChatTurn::new("", "。")];
        let profile = analyzer().profile_from_turns(&turns);
        for e in profile.entries() {
            assert!((0.0..=1.0).contains(&e.score), "{} out of range: {}", e.id, e.score);
        }
        assert_eq!(profile.get("tsundere"), Some(1.0));
    }

    #[test]
    fn prompt_json_keeps_labels_in_order() {
        let json = analyzer().default_profile().to_prompt_json();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["傲娇指数", "温柔度", "战斗倾向"]);
        assert_eq!(json["温柔度"], 0.5);
    }

    #[test]
    fn neutral_temperature() {
        let t = analyzer().default_profile().sampling_temperature();
        assert!(approx(t, 0.65), "got {t}");
    }

    #[test]
    fn temperature_tracks_tsundere_and_gentleness() {
        let hot = PersonalityProfile {
            entries: vec![
                ProfileEntry { id: "tsundere".into(), label: "t".into(), score: 1.0 },
                ProfileEntry { id: "gentleness".into(), label: "g".into(), score: 1.0 },
            ],
        };
        assert!(approx(hot.sampling_temperature(), 0.9));

        let cold = PersonalityProfile {
            entries: vec![
                ProfileEntry { id: "tsundere".into(), label: "t".into(), score: 0.0 },
                ProfileEntry { id: "gentleness".into(), label: "g".into(), score: 0.0 },
            ],
        };
        assert!(approx(cold.sampling_temperature(), 0.4));
    }

    #[tokio::test]
    async fn generate_profile_reads_store_window() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.append(&ChatRecord::now("1", "你好", "笨蛋笨蛋笨蛋")).await.unwrap();
        store.append(&ChatRecord::now("1", "你好", "谢谢你")).await.unwrap();

        let a = analyzer();
        let last_only = a.generate_profile(&store, "1", 1).await;
        assert_eq!(last_only.get("tsundere"), Some(0.11));

        let both = a.generate_profile(&store, "1", 50).await;
        assert!(both.get("tsundere").unwrap() > 0.5);

        let stranger = a.generate_profile(&store, "2", 50).await;
        assert_eq!(stranger, a.default_profile());
    }
}
