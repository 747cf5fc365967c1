//! AI engine abstraction.
//!
//! An [`Engine`] turns an instruction into changes on the files inside a
//! sandbox workspace by driving a coding CLI. The [`EngineRegistry`] maps
//! engine type names to implementations; jobs carry the name, not the
//! implementation.
//!
//! A nonzero exit code from the engine CLI is recorded but is not an
//! error: many engine CLIs exit nonzero after having made useful changes,
//! and the commit stage decides whether anything came out of the run.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::EngineError;
use crate::models::Verbosity;
use crate::sandbox::SandboxManager;

/// USD per million tokens, matched by model name prefix. Used when the
/// engine does not report a cost itself.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("claude-opus", 15.0, 75.0),
    ("claude-sonnet", 3.0, 15.0),
    ("claude-haiku", 0.80, 4.0),
    ("gpt-5", 1.25, 10.0),
    ("gpt-4", 2.50, 10.0),
];

/// Estimate run cost from token counts, by model prefix.
pub fn estimate_cost(model: &str, input_tokens: i64, output_tokens: i64) -> Option<f64> {
    MODEL_PRICING
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, input_rate, output_rate)| {
            (input_tokens as f64 * input_rate + output_tokens as f64 * output_rate) / 1_000_000.0
        })
}

#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub instruction: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub max_turns: u32,
    pub verbosity: Verbosity,
    pub env: HashMap<String, String>,
}

/// Outcome of a completed engine run.
#[derive(Debug, Clone, Default)]
pub struct EngineRun {
    pub exit_code: i32,
    pub output: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
}

pub type OnLine = Arc<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the instruction inside the sandbox workspace, streaming raw
    /// output lines to `on_line`.
    async fn run(
        &self,
        sandbox: &SandboxManager,
        sandbox_id: &str,
        request: &EngineRequest,
        on_line: OnLine,
    ) -> Result<EngineRun, EngineError>;
}

// ── Stream-json result parsing ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamResultLine {
    #[serde(rename = "type")]
    kind: String,
    result: Option<String>,
    usage: Option<StreamUsage>,
    total_cost_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
}

/// Scan stream-json output for the final `result` record and pull out the
/// result text, token usage, and reported cost.
fn parse_stream_result(stdout: &str) -> (Option<String>, Option<i64>, Option<i64>, Option<f64>) {
    for line in stdout.lines().rev() {
        let Ok(parsed) = serde_json::from_str::<StreamResultLine>(line) else {
            continue;
        };
        if parsed.kind == "result" {
            let (input, output) = parsed
                .usage
                .map(|u| (u.input_tokens, u.output_tokens))
                .unwrap_or((None, None));
            return (parsed.result, input, output, parsed.total_cost_usd);
        }
    }
    (None, None, None, None)
}

fn finish_run(
    exit_code: i32,
    stdout: String,
    stderr: String,
    model: Option<&str>,
) -> EngineRun {
    let (result_text, input_tokens, output_tokens, reported_cost) = parse_stream_result(&stdout);

    let cost_usd = reported_cost.or_else(|| match (model, input_tokens, output_tokens) {
        (Some(model), Some(input), Some(output)) => estimate_cost(model, input, output),
        _ => None,
    });

    let output = match result_text {
        Some(text) if !text.is_empty() => text,
        _ if !stdout.is_empty() => stdout,
        _ => stderr,
    };

    EngineRun {
        exit_code,
        output,
        input_tokens,
        output_tokens,
        cost_usd,
    }
}

// ── Engines ──────────────────────────────────────────────────────────

/// Drives the `claude` CLI in non-interactive stream-json mode.
pub struct ClaudeCodeEngine;

#[async_trait]
impl Engine for ClaudeCodeEngine {
    fn name(&self) -> &'static str {
        "claude-code"
    }

    async fn run(
        &self,
        sandbox: &SandboxManager,
        sandbox_id: &str,
        request: &EngineRequest,
        on_line: OnLine,
    ) -> Result<EngineRun, EngineError> {
        let program = std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string());

        let mut args: Vec<String> = vec![
            "--print".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--max-turns".to_string(),
            request.max_turns.to_string(),
        ];
        if request.verbosity == Verbosity::Verbose {
            args.push("--verbose".to_string());
        }
        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(system_prompt) = &request.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system_prompt.clone());
        }
        args.push("-p".to_string());
        args.push(request.instruction.clone());

        let result = sandbox
            .exec(sandbox_id, &program, &args, &request.env, move |line| {
                on_line(line)
            })
            .await?;

        Ok(finish_run(
            result.exit_code,
            result.stdout,
            result.stderr,
            request.model.as_deref(),
        ))
    }
}

/// Drives the `codex` CLI in non-interactive mode.
pub struct CodexEngine;

#[async_trait]
impl Engine for CodexEngine {
    fn name(&self) -> &'static str {
        "codex"
    }

    async fn run(
        &self,
        sandbox: &SandboxManager,
        sandbox_id: &str,
        request: &EngineRequest,
        on_line: OnLine,
    ) -> Result<EngineRun, EngineError> {
        let program = std::env::var("CODEX_CMD").unwrap_or_else(|_| "codex".to_string());

        let mut args: Vec<String> = vec![
            "exec".to_string(),
            "--json".to_string(),
            "--full-auto".to_string(),
        ];
        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push(request.instruction.clone());

        let result = sandbox
            .exec(sandbox_id, &program, &args, &request.env, move |line| {
                on_line(line)
            })
            .await?;

        Ok(finish_run(
            result.exit_code,
            result.stdout,
            result.stderr,
            request.model.as_deref(),
        ))
    }
}

// ── Registry ─────────────────────────────────────────────────────────

pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn Engine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    /// Registry with the built-in engines.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeCodeEngine));
        registry.register(Arc::new(CodexEngine));
        registry
    }

    pub fn register(&mut self, engine: Arc<dyn Engine>) {
        self.engines.insert(engine.name().to_string(), engine);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Engine>, EngineError> {
        self.engines
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Unknown {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.engines.keys().map(String::as_str).collect()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ── Test engine ──────────────────────────────────────────────────────

/// Scripted engine for tests: writes a file into the workspace and
/// returns a canned run, or fails.
#[cfg(test)]
pub struct FakeEngine {
    pub fail: bool,
    pub exit_code: i32,
    pub output: String,
    pub write_file: Option<(String, String)>,
}

#[cfg(test)]
impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            fail: false,
            exit_code: 0,
            output: "done".to_string(),
            write_file: Some(("engine.txt".to_string(), "changed\n".to_string())),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Engine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn run(
        &self,
        sandbox: &SandboxManager,
        sandbox_id: &str,
        _request: &EngineRequest,
        on_line: OnLine,
    ) -> Result<EngineRun, EngineError> {
        if self.fail {
            return Err(EngineError::Run("scripted engine failure".to_string()));
        }
        let workspace = sandbox.workspace(sandbox_id)?;
        if let Some((name, contents)) = &self.write_file {
            std::fs::write(workspace.join(name), contents).map_err(crate::errors::SandboxError::Io)?;
        }
        on_line(&self.output);
        Ok(EngineRun {
            exit_code: self.exit_code,
            output: self.output.clone(),
            input_tokens: Some(120),
            output_tokens: Some(450),
            cost_usd: Some(0.0123),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_and_rejects_unknown() {
        let registry = EngineRegistry::with_defaults();
        assert_eq!(registry.get("claude-code").unwrap().name(), "claude-code");
        assert_eq!(registry.get("codex").unwrap().name(), "codex");
        assert!(matches!(
            registry.get("gpt-nonsense"),
            Err(EngineError::Unknown { .. })
        ));
    }

    #[test]
    fn parse_stream_result_extracts_usage_and_cost() {
        let stdout = concat!(
            "{\"type\":\"system\",\"subtype\":\"init\"}\n",
            "{\"type\":\"assistant\",\"message\":{}}\n",
            "{\"type\":\"result\",\"result\":\"Added the endpoint\",",
            "\"usage\":{\"input_tokens\":1200,\"output_tokens\":340},",
            "\"total_cost_usd\":0.0456}\n",
        );
        let (text, input, output, cost) = parse_stream_result(stdout);
        assert_eq!(text.as_deref(), Some("Added the endpoint"));
        assert_eq!(input, Some(1200));
        assert_eq!(output, Some(340));
        assert_eq!(cost, Some(0.0456));
    }

    #[test]
    fn parse_stream_result_tolerates_non_json_output() {
        let (text, input, output, cost) = parse_stream_result("plain text\nno json here\n");
        assert!(text.is_none());
        assert!(input.is_none());
        assert!(output.is_none());
        assert!(cost.is_none());
    }

    #[test]
    fn finish_run_falls_back_to_estimated_cost() {
        let stdout = concat!(
            "{\"type\":\"result\",\"result\":\"ok\",",
            "\"usage\":{\"input_tokens\":1000000,\"output_tokens\":1000000}}\n",
        );
        let run = finish_run(0, stdout.to_string(), String::new(), Some("claude-sonnet-4"));
        assert_eq!(run.cost_usd, Some(18.0));
        assert_eq!(run.output, "ok");
    }

    #[test]
    fn finish_run_uses_stderr_when_stdout_empty() {
        let run = finish_run(1, String::new(), "command not found".to_string(), None);
        assert_eq!(run.exit_code, 1);
        assert_eq!(run.output, "command not found");
    }

    #[test]
    fn estimate_cost_matches_by_prefix() {
        let cost = estimate_cost("claude-opus-4", 1_000_000, 0).unwrap();
        assert!((cost - 15.0).abs() < f64::EPSILON);
        assert!(estimate_cost("mystery-model", 100, 100).is_none());
    }

    #[tokio::test]
    async fn fake_engine_writes_into_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let settings = crate::config::SandboxSettings {
            workspace_dir: dir.path().join("ws").to_string_lossy().to_string(),
            timeout_seconds: 30,
            kill_grace_seconds: 1,
        };
        let manager = SandboxManager::new(&settings).unwrap();
        let id = manager.create().unwrap();

        let engine = FakeEngine::default();
        let request = EngineRequest {
            instruction: "touch a file".to_string(),
            system_prompt: None,
            model: None,
            max_turns: 50,
            verbosity: Verbosity::Normal,
            env: HashMap::new(),
        };
        let run = engine
            .run(&manager, &id, &request, Arc::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(run.exit_code, 0);
        assert!(manager.workspace(&id).unwrap().join("engine.txt").exists());
    }
}
