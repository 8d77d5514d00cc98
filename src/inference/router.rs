//! Lane router: picks an LLM back-end per request and drives it.
//!
//! Selection is either explicit (`current lane`) or automatic: a
//! complexity score in `[0, 1]` derived from the last user message routes
//! to the `smart`, `fast`, or `local` lane. Lane configuration round-trips
//! through a YAML file so model changes survive restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::resolve_env_ref;

use super::{
    anthropic, ollama, openai, InferenceError, Lane, LaneEngine, LaneInfo, ThinkChunk,
    ThinkRequest, ThinkResponse,
};

/// Total HTTP timeout for engine calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Chunk channel capacity for streamed replies.
const STREAM_BUFFER: usize = 32;

/// Complexity at or above which the `smart` lane is chosen.
const SMART_THRESHOLD: f32 = 0.7;

/// Complexity at or above which the `fast` lane is chosen.
const FAST_THRESHOLD: f32 = 0.3;

/// Keywords that raise the complexity score. Matched as word prefixes so
/// inflections count (`architect` matches `architectural`).
const COMPLEX_KEYWORDS: &[&str] = &[
    "analyze",
    "explain",
    "compare",
    "design",
    "architect",
    "implement",
    "debug",
    "refactor",
    "optimize",
    "review",
    "complex",
    "detailed",
    "comprehensive",
    "in-depth",
    "multiple",
    "several",
    "all",
    "every",
    "entire",
];

/// Single-word dampeners, matched as whole words.
const SIMPLE_WORDS: &[&str] = &[
    "quick", "simple", "just", "hello", "hi", "thanks", "yes", "no", "ok",
];

/// Phrase dampeners, matched as substrings.
const SIMPLE_PHRASES: &[&str] = &["what is", "how to"];

// ---------------------------------------------------------------------------
// Persisted file shape
// ---------------------------------------------------------------------------

/// On-disk inference configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceFile {
    pub version: u32,
    pub inference: InferenceSettings,
}

/// The `inference:` section of the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub default_lane: Option<String>,
    pub auto_llm: bool,
    pub lanes: HashMap<String, Lane>,
}

// ---------------------------------------------------------------------------
// Engine target
// ---------------------------------------------------------------------------

/// Fully resolved parameters for one engine call. Credentials are resolved
/// here and never logged.
#[derive(Clone)]
pub struct EngineTarget {
    pub engine: LaneEngine,
    pub model: String,
    pub base_url: String,
    pub api_key: String,
}

impl std::fmt::Debug for EngineTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineTarget")
            .field("engine", &self.engine)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

fn default_base_url(engine: LaneEngine) -> &'static str {
    match engine {
        LaneEngine::Ollama => "http://localhost:11434",
        LaneEngine::OpenAi => "https://api.openai.com",
        LaneEngine::Anthropic => "https://api.anthropic.com",
        LaneEngine::Groq => "https://api.groq.com/openai",
    }
}

fn engine_key_fallback(engine: LaneEngine) -> Option<&'static str> {
    match engine {
        LaneEngine::Groq => Some("GROQ_API_KEY"),
        LaneEngine::Anthropic => Some("ANTHROPIC_API_KEY"),
        LaneEngine::Ollama | LaneEngine::OpenAi => None,
    }
}

fn resolve_target(lane: &Lane) -> EngineTarget {
    let base_url = lane
        .url
        .clone()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| default_base_url(lane.engine).to_owned())
        .trim_end_matches('/')
        .to_owned();

    let api_key = lane
        .api_key
        .as_deref()
        .map(resolve_env_ref)
        .filter(|k| !k.is_empty())
        .or_else(|| {
            engine_key_fallback(lane.engine).and_then(|name| std::env::var(name).ok())
        })
        .unwrap_or_default();

    EngineTarget {
        engine: lane.engine,
        model: lane.model.clone(),
        base_url,
        api_key,
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RouterState {
    lanes: HashMap<String, Lane>,
    current: Option<String>,
    auto_llm: bool,
    version: u32,
}

/// Thread-safe lane router. Cheap to share behind an [`Arc`].
pub struct LaneRouter {
    state: RwLock<RouterState>,
    /// Where to persist lane changes; `None` disables persistence.
    path: Option<PathBuf>,
    client: reqwest::Client,
}

impl LaneRouter {
    /// Build a router from in-memory settings, persisting to `path` when given.
    pub fn new(settings: InferenceSettings, path: Option<PathBuf>) -> Self {
        let mut lanes = settings.lanes;
        for (name, lane) in lanes.iter_mut() {
            lane.name = name.clone();
        }
        let current = settings
            .default_lane
            .filter(|name| lanes.contains_key(name));

        Self {
            state: RwLock::new(RouterState {
                lanes,
                current,
                auto_llm: settings.auto_llm,
                version: 1,
            }),
            path,
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Load the router from a YAML inference file.
    ///
    /// A missing file yields an empty router (no lanes, no default).
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let settings = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let file: InferenceFile = serde_yaml::from_str(&contents)?;
                info!(path = %path.display(), lanes = file.inference.lanes.len(), "loaded inference config");
                file.inference
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no inference config, starting without lanes");
                InferenceSettings::default()
            }
            Err(e) => return Err(anyhow::anyhow!("failed to read inference config: {e}")),
        };
        Ok(Self::new(settings, Some(path)))
    }

    // ── Lane management ──

    /// Switch the current lane.
    ///
    /// # Errors
    ///
    /// [`InferenceError::UnknownLane`] when no lane has this name.
    pub fn set_lane(&self, name: &str) -> Result<(), InferenceError> {
        let mut state = self.state.write().map_err(|_| InferenceError::NoLane)?;
        if !state.lanes.contains_key(name) {
            return Err(InferenceError::UnknownLane(name.to_owned()));
        }
        state.current = Some(name.to_owned());
        info!(lane = name, "current lane changed");
        Ok(())
    }

    /// The current lane, if one is configured.
    pub fn get_lane(&self) -> Option<LaneInfo> {
        let state = self.state.read().ok()?;
        let current = state.current.clone()?;
        state.lanes.get(&current).map(|lane| LaneInfo {
            name: lane.name.clone(),
            engine: lane.engine,
            model: lane.model.clone(),
            active: true,
        })
    }

    /// All configured lanes, sorted by name.
    pub fn list_lanes(&self) -> Vec<LaneInfo> {
        let Ok(state) = self.state.read() else {
            return Vec::new();
        };
        let mut infos: Vec<LaneInfo> = state
            .lanes
            .values()
            .map(|lane| LaneInfo {
                name: lane.name.clone(),
                engine: lane.engine,
                model: lane.model.clone(),
                active: state.current.as_deref() == Some(lane.name.as_str()),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Enable or disable complexity-based routing.
    pub fn set_auto_llm(&self, enabled: bool) {
        if let Ok(mut state) = self.state.write() {
            state.auto_llm = enabled;
        }
    }

    /// Whether complexity-based routing is on.
    pub fn auto_llm(&self) -> bool {
        self.state.read().map(|s| s.auto_llm).unwrap_or(false)
    }

    /// Change a lane's model and persist the configuration.
    ///
    /// # Errors
    ///
    /// [`InferenceError::UnknownLane`] for unknown names; persistence
    /// failures are logged but do not fail the call (state is updated).
    pub fn set_model(&self, lane: &str, model: &str) -> Result<(), InferenceError> {
        let mut state = self.state.write().map_err(|_| InferenceError::NoLane)?;
        let entry = state
            .lanes
            .get_mut(lane)
            .ok_or_else(|| InferenceError::UnknownLane(lane.to_owned()))?;
        entry.model = model.to_owned();
        info!(lane, model, "lane model changed");

        if let Some(path) = &self.path {
            if let Err(e) = persist(path, &state) {
                warn!(error = %e, "failed to persist inference config");
            }
        }
        Ok(())
    }

    // ── Lane selection ──

    /// Pick the lane for one request.
    fn select_lane(&self, request: &ThinkRequest) -> Result<Lane, InferenceError> {
        let state = self.state.read().map_err(|_| InferenceError::NoLane)?;

        if state.auto_llm {
            let score = complexity_score(request.last_user_text());
            let tier = if score >= SMART_THRESHOLD {
                "smart"
            } else if score >= FAST_THRESHOLD {
                "fast"
            } else {
                "local"
            };
            debug!(score = f64::from(score), tier, "auto-llm routing");
            if let Some(lane) = state.lanes.get(tier) {
                return Ok(lane.clone());
            }
            // Tier lane missing: fall back to the current lane.
        }

        state
            .current
            .as_ref()
            .and_then(|name| state.lanes.get(name))
            .cloned()
            .ok_or(InferenceError::NoLane)
    }

    // ── Inference ──

    /// One complete (non-streaming) think call on the selected lane.
    ///
    /// # Errors
    ///
    /// [`InferenceError::NoLane`] without configuration, otherwise the
    /// engine's transport/HTTP/parse error.
    pub async fn think(&self, request: &ThinkRequest) -> Result<ThinkResponse, InferenceError> {
        let lane = self.select_lane(request)?;
        let target = resolve_target(&lane);
        debug!(lane = %lane.name, engine = %target.engine, model = %target.model, "think");

        match target.engine {
            LaneEngine::Ollama => ollama::think(&self.client, &target, request).await,
            LaneEngine::OpenAi | LaneEngine::Groq => {
                openai::think(&self.client, &target, request).await
            }
            LaneEngine::Anthropic => anthropic::think(&self.client, &target, request).await,
        }
    }

    /// Streamed think call.
    ///
    /// Returns a lazy chunk sequence terminated by exactly one `done` or
    /// `error` chunk. Dropping the receiver aborts the producer task and
    /// cancels the underlying HTTP request.
    pub fn think_stream(&self, request: ThinkRequest) -> mpsc::Receiver<ThinkChunk> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let lane = match self.select_lane(&request) {
            Ok(lane) => lane,
            Err(e) => {
                // Surface the selection failure as the stream's terminal chunk.
                let _ = tx.try_send(ThinkChunk::error(e.to_string()));
                return rx;
            }
        };
        let target = resolve_target(&lane);
        let client = self.client.clone();

        tokio::spawn(async move {
            match target.engine {
                LaneEngine::Ollama => ollama::stream(&client, &target, &request, tx).await,
                LaneEngine::OpenAi | LaneEngine::Groq => {
                    openai::stream(&client, &target, &request, tx).await
                }
                LaneEngine::Anthropic => {
                    // Non-streaming engine: emit the whole reply as one chunk.
                    match anthropic::think(&client, &target, &request).await {
                        Ok(response) => {
                            if tx.send(ThinkChunk::text(response.content)).await.is_ok() {
                                let _ = tx.send(ThinkChunk::done()).await;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(ThinkChunk::error(e.to_string())).await;
                        }
                    }
                }
            }
        });

        rx
    }

    /// Reachability probe of the current lane's base URL.
    ///
    /// Any HTTP round-trip counts as reachable; only transport failures
    /// (connection refused, DNS, timeout) are errors.
    ///
    /// # Errors
    ///
    /// [`InferenceError::NoLane`] or [`InferenceError::Transport`].
    pub async fn ping(&self) -> Result<(), InferenceError> {
        let lane = {
            let state = self.state.read().map_err(|_| InferenceError::NoLane)?;
            state
                .current
                .as_ref()
                .and_then(|name| state.lanes.get(name))
                .cloned()
                .ok_or(InferenceError::NoLane)?
        };
        let target = resolve_target(&lane);
        self.client
            .get(&target.base_url)
            .send()
            .await
            .map_err(|source| InferenceError::Transport {
                engine: target.engine,
                source,
            })?;
        Ok(())
    }
}

/// Atomic persist of the router state in the on-disk file shape.
fn persist(path: &Path, state: &RouterState) -> anyhow::Result<()> {
    let file = InferenceFile {
        version: state.version,
        inference: InferenceSettings {
            default_lane: state.current.clone(),
            auto_llm: state.auto_llm,
            lanes: state.lanes.clone(),
        },
    };
    let serialized = serde_yaml::to_string(&file)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("yaml.tmp");
    std::fs::write(&tmp_path, serialized)?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Complexity heuristic
// ---------------------------------------------------------------------------

/// Score the complexity of a user message in `[0, 1]`.
///
/// Deterministic for identical input:
/// - length ≥ 500 chars adds 0.30; 200–499 adds 0.15
/// - each complex keyword present (word-prefix match) adds 0.10
/// - each simple keyword present subtracts 0.10
pub fn complexity_score(text: &str) -> f32 {
    let lower = text.to_lowercase();
    let mut score: f32 = 0.0;

    let length = lower.chars().count();
    if length >= 500 {
        score += 0.30;
    } else if length >= 200 {
        score += 0.15;
    }

    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect();

    for keyword in COMPLEX_KEYWORDS {
        if words.iter().any(|w| w.starts_with(keyword)) {
            score += 0.10;
        }
    }
    for keyword in SIMPLE_WORDS {
        if words.iter().any(|w| w == keyword) {
            score -= 0.10;
        }
    }
    for phrase in SIMPLE_PHRASES {
        if lower.contains(phrase) {
            score -= 0.10;
        }
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn lane(name: &str, engine: LaneEngine, model: &str) -> (String, Lane) {
        (
            name.to_owned(),
            Lane {
                name: name.to_owned(),
                engine,
                model: model.to_owned(),
                url: None,
                api_key: None,
            },
        )
    }

    fn three_tier_settings(auto_llm: bool) -> InferenceSettings {
        InferenceSettings {
            default_lane: Some("local".to_owned()),
            auto_llm,
            lanes: [
                lane("local", LaneEngine::Ollama, "llama3"),
                lane("fast", LaneEngine::Groq, "llama-3.1-8b"),
                lane("smart", LaneEngine::Anthropic, "claude-sonnet-4-20250514"),
            ]
            .into_iter()
            .collect(),
        }
    }

    // ── Complexity scoring ──

    #[test]
    fn trivial_question_scores_low() {
        let score = complexity_score("What is 2+2?");
        assert!(score < FAST_THRESHOLD, "score was {score}");
    }

    #[test]
    fn greetings_score_zero() {
        assert_eq!(complexity_score("hi"), 0.0);
        assert_eq!(complexity_score("thanks, ok!"), 0.0);
    }

    #[test]
    fn loaded_request_scores_high() {
        let text = "Please analyze and compare the architectural trade-offs of these five \
                    designs in-depth. I want a detailed and comprehensive review of every \
                    component, including how multiple subsystems interact across the entire \
                    stack, and a summary of the risks each design carries for the team.";
        assert!(text.len() >= 200);
        let score = complexity_score(text);
        assert!(score >= SMART_THRESHOLD, "score was {score}");
    }

    #[test]
    fn scoring_is_deterministic() {
        let text = "explain how to refactor this module";
        assert_eq!(complexity_score(text), complexity_score(text));
    }

    #[test]
    fn keyword_prefix_matches_inflections() {
        // "architectural" counts for "architect", "designs" for "design".
        let a = complexity_score("architectural designs");
        let b = complexity_score("architect design");
        assert_eq!(a, b);
    }

    // ── Lane selection ──

    #[test]
    fn auto_routes_trivial_to_local() {
        let router = Arc::new(LaneRouter::new(three_tier_settings(true), None));
        let request = ThinkRequest {
            messages: vec![crate::inference::ChatTurn::user("What is 2+2?")],
            ..Default::default()
        };
        let lane = router.select_lane(&request).expect("lane");
        assert_eq!(lane.name, "local");
    }

    #[test]
    fn auto_routes_complex_to_smart() {
        let router = Arc::new(LaneRouter::new(three_tier_settings(true), None));
        let text = "Please analyze and compare the architectural trade-offs of these five \
                    designs in-depth. I want a detailed and comprehensive review of every \
                    component, including how multiple subsystems interact across the entire \
                    stack, and a summary of the risks each design carries for the team.";
        let request = ThinkRequest {
            messages: vec![crate::inference::ChatTurn::user(text)],
            ..Default::default()
        };
        let lane = router.select_lane(&request).expect("lane");
        assert_eq!(lane.name, "smart");
    }

    #[test]
    fn auto_with_missing_tier_falls_back_to_current() {
        let mut settings = three_tier_settings(true);
        settings.lanes.remove("local");
        settings.default_lane = Some("fast".to_owned());
        let router = LaneRouter::new(settings, None);

        let request = ThinkRequest {
            messages: vec![crate::inference::ChatTurn::user("hi")],
            ..Default::default()
        };
        let lane = router.select_lane(&request).expect("fallback lane");
        assert_eq!(lane.name, "fast");
    }

    #[test]
    fn manual_mode_uses_current_lane() {
        let router = LaneRouter::new(three_tier_settings(false), None);
        router.set_lane("smart").expect("set lane");
        let request = ThinkRequest {
            messages: vec![crate::inference::ChatTurn::user("hi")],
            ..Default::default()
        };
        assert_eq!(router.select_lane(&request).expect("lane").name, "smart");
    }

    #[test]
    fn no_lane_configured_is_an_error() {
        let router = LaneRouter::new(InferenceSettings::default(), None);
        let request = ThinkRequest::default();
        assert!(matches!(
            router.select_lane(&request),
            Err(InferenceError::NoLane)
        ));
    }

    #[test]
    fn set_lane_rejects_unknown_names() {
        let router = LaneRouter::new(three_tier_settings(false), None);
        assert!(matches!(
            router.set_lane("warp"),
            Err(InferenceError::UnknownLane(_))
        ));
    }

    #[test]
    fn list_lanes_marks_active() {
        let router = LaneRouter::new(three_tier_settings(false), None);
        let lanes = router.list_lanes();
        assert_eq!(lanes.len(), 3);
        let active: Vec<_> = lanes.iter().filter(|l| l.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "local");
    }

    // ── Persistence ──

    #[test]
    fn set_model_persists_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inference.yaml");
        let router = LaneRouter::new(three_tier_settings(false), Some(path.clone()));

        router.set_model("fast", "llama-3.3-70b").expect("set model");

        let reloaded = LaneRouter::load(&path).expect("reload");
        let lanes = reloaded.list_lanes();
        let fast = lanes.iter().find(|l| l.name == "fast").expect("fast lane");
        assert_eq!(fast.model, "llama-3.3-70b");
    }

    #[test]
    fn load_missing_file_yields_empty_router() {
        let dir = tempfile::tempdir().expect("tempdir");
        let router = LaneRouter::load(dir.path().join("absent.yaml")).expect("load");
        assert!(router.get_lane().is_none());
        assert!(router.list_lanes().is_empty());
    }

    // ── Target resolution ──

    #[test]
    fn target_defaults_per_engine() {
        let (_, groq) = lane("fast", LaneEngine::Groq, "m");
        assert_eq!(
            resolve_target(&groq).base_url,
            "https://api.groq.com/openai"
        );

        let (_, local) = lane("local", LaneEngine::Ollama, "m");
        assert_eq!(resolve_target(&local).base_url, "http://localhost:11434");
    }

    #[test]
    fn target_strips_trailing_slash() {
        let mut l = lane("x", LaneEngine::OpenAi, "m").1;
        l.url = Some("https://proxy.internal/v1gateway/".to_owned());
        assert_eq!(
            resolve_target(&l).base_url,
            "https://proxy.internal/v1gateway"
        );
    }

    #[test]
    fn target_debug_never_shows_key() {
        let mut l = lane("x", LaneEngine::OpenAi, "m").1;
        l.api_key = Some("sk-secret-value".to_owned());
        let rendered = format!("{:?}", resolve_target(&l));
        assert!(!rendered.contains("sk-secret-value"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
