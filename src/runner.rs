//! Executes question parameter generators (`server.js` / `server.py`).
//!
//! The generator is written to a temporary directory next to a tiny harness that loads
//! it, calls `generate()` and prints a sentinel line followed by the JSON result. Only
//! the text after the last sentinel is parsed, so `console.log`/`print` calls inside
//! generated code do not break us.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::error::{AppError, AppResult};
use crate::util::trunc_for_log;

const SENTINEL: &str = "__GESTALT_GENERATE_RESULT__";

const NODE_HARNESS: &str = r#"const mod = require('./server.js');
const generate = typeof mod === 'function' ? mod : (mod.generate || (mod.default && mod.default.generate));
if (typeof generate !== 'function') {
  console.error('server.js does not export generate()');
  process.exit(3);
}
const data = { params: {}, correct_answers: {} };
Promise.resolve(generate.length > 0 ? generate(data) : generate())
  .then((res) => {
    process.stdout.write('\n__GESTALT_GENERATE_RESULT__\n' + JSON.stringify(res === undefined ? data : res) + '\n');
  })
  .catch((err) => {
    console.error(err && err.stack ? err.stack : String(err));
    process.exit(1);
  });
"#;

const PYTHON_HARNESS: &str = r#"import importlib.util, inspect, json, sys
spec = importlib.util.spec_from_file_location("server", "server.py")
mod = importlib.util.module_from_spec(spec)
spec.loader.exec_module(mod)
if not hasattr(mod, "generate"):
    sys.stderr.write("server.py does not define generate()\n")
    sys.exit(3)
data = {"params": {}, "correct_answers": {}}
takes_data = len(inspect.signature(mod.generate).parameters) > 0
res = mod.generate(data) if takes_data else mod.generate()
sys.stdout.write("\n__GESTALT_GENERATE_RESULT__\n" + json.dumps(data if res is None else res, default=str) + "\n")
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Runtime {
  Node,
  Python,
}

impl Runtime {
  /// Runtime for a generator file name; only `server.js` and `server.py` are runnable.
  pub fn for_file(name: &str) -> AppResult<Self> {
    match name {
      "server.js" => Ok(Runtime::Node),
      "server.py" => Ok(Runtime::Python),
      other => Err(AppError::BadRequest(format!("Unsupported file type: {other}"))),
    }
  }

  fn file_name(self) -> &'static str {
    match self {
      Runtime::Node => "server.js",
      Runtime::Python => "server.py",
    }
  }

  fn harness(self) -> (&'static str, &'static str) {
    match self {
      Runtime::Node => ("harness.js", NODE_HARNESS),
      Runtime::Python => ("harness.py", PYTHON_HARNESS),
    }
  }
}

/// What a generator returned. Anything beyond params/correct_answers lands in `extra`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct GeneratorOutput {
  #[serde(default)]
  pub params: Map<String, Value>,
  #[serde(default)]
  pub correct_answers: Map<String, Value>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Pull the JSON result out of harness stdout.
pub fn parse_output(stdout: &str) -> AppResult<GeneratorOutput> {
  let Some(pos) = stdout.rfind(SENTINEL) else {
    return Err(AppError::Runner(format!("generator produced no result: {}", trunc_for_log(stdout, 300))));
  };
  let payload = stdout[pos + SENTINEL.len()..].trim();
  let value: Value = serde_json::from_str(payload)
    .map_err(|e| AppError::Runner(format!("generator result is not JSON: {e}")))?;
  match value {
    Value::Object(_) => serde_json::from_value(value)
      .map_err(|e| AppError::Runner(format!("generator result has the wrong shape: {e}"))),
    Value::Null => Ok(GeneratorOutput::default()),
    other => Err(AppError::Runner(format!("generator returned {other} instead of an object"))),
  }
}

#[derive(Clone, Debug)]
pub struct CodeRunner {
  node_bin: String,
  python_bin: String,
  timeout: Duration,
}

impl CodeRunner {
  pub fn new(settings: &Settings) -> Self {
    Self {
      node_bin: settings.node_bin.clone(),
      python_bin: settings.python_bin.clone(),
      timeout: Duration::from_secs(settings.runner_timeout_secs.max(1)),
    }
  }

  fn program(&self, runtime: Runtime) -> &str {
    match runtime {
      Runtime::Node => &self.node_bin,
      Runtime::Python => &self.python_bin,
    }
  }

  /// Run generator source in a scratch directory and return what `generate()` produced.
  #[instrument(level = "info", skip(self, code), fields(code_len = code.len()))]
  pub async fn run(&self, runtime: Runtime, code: &str) -> AppResult<GeneratorOutput> {
    let dir = tempfile::TempDir::new()?;
    let (harness_name, harness) = runtime.harness();
    tokio::fs::write(dir.path().join(runtime.file_name()), code).await?;
    tokio::fs::write(dir.path().join(harness_name), harness).await?;

    let program = self.program(runtime);
    let child = Command::new(program)
      .arg(harness_name)
      .current_dir(dir.path())
      .kill_on_drop(true)
      .output();

    let output = match tokio::time::timeout(self.timeout, child).await {
      Ok(Ok(out)) => out,
      Ok(Err(e)) => return Err(AppError::Runner(format!("failed to start {program}: {e}"))),
      Err(_) => {
        warn!(target: "runner", timeout_secs = self.timeout.as_secs(), "Generator timed out");
        return Err(AppError::Runner(format!("generator timed out after {}s", self.timeout.as_secs())));
      }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
      warn!(target: "runner", status = ?output.status.code(), stderr = %trunc_for_log(&stderr, 500), "Generator failed");
      let detail = if stderr.trim().is_empty() { stdout.trim().to_string() } else { stderr.trim().to_string() };
      return Err(AppError::Runner(trunc_for_log(&detail, 2000)));
    }
    if !stderr.trim().is_empty() {
      debug!(target: "runner", stderr = %trunc_for_log(&stderr, 500), "Generator wrote to stderr");
    }

    let result = parse_output(&stdout)?;
    info!(target: "runner", params = result.params.len(), correct_answers = result.correct_answers.len(), "Generator finished");
    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn runner() -> CodeRunner {
    CodeRunner::new(&Settings { runner_timeout_secs: 10, ..Settings::default() })
  }

  fn has(bin: &str) -> bool {
    std::process::Command::new(bin).arg("--version").output().map(|o| o.status.success()).unwrap_or(false)
  }

  #[test]
  fn dispatch_by_file_name() {
    assert_eq!(Runtime::for_file("server.js").unwrap(), Runtime::Node);
    assert_eq!(Runtime::for_file("server.py").unwrap(), Runtime::Python);
    assert!(matches!(Runtime::for_file("question.html"), Err(AppError::BadRequest(_))));
  }

  #[test]
  fn parse_ignores_stray_output_before_sentinel() {
    let stdout = format!(
      "{{ params: 'noise' }}\n{SENTINEL}\n{}\n",
      json!({ "params": { "v": 12 }, "correct_answers": { "t": "1.20" }, "nDigits": 3 })
    );
    let out = parse_output(&stdout).unwrap();
    assert_eq!(out.params["v"], json!(12));
    assert_eq!(out.correct_answers["t"], json!("1.20"));
    assert_eq!(out.extra["nDigits"], json!(3));
  }

  #[test]
  fn parse_rejects_missing_sentinel_and_non_objects() {
    assert!(matches!(parse_output("hello"), Err(AppError::Runner(_))));
    assert!(matches!(parse_output(&format!("{SENTINEL}\n[1,2]")), Err(AppError::Runner(_))));
    assert_eq!(parse_output(&format!("{SENTINEL}\nnull")).unwrap(), GeneratorOutput::default());
  }

  #[tokio::test]
  async fn missing_interpreter_is_runner_error() {
    let r = CodeRunner::new(&Settings { node_bin: "/nonexistent/node".into(), ..Settings::default() });
    let err = r.run(Runtime::Node, "module.exports = { generate: () => ({}) };").await.unwrap_err();
    assert!(matches!(err, AppError::Runner(_)));
  }

  #[tokio::test]
  async fn python_generator_round_trip() {
    if !has("python3") {
      return;
    }
    let code = "def generate():\n    print('debug')\n    return {'params': {'h': 20}, 'correct_answers': {'t': 2.02}, 'sigfigs': 3}\n";
    let out = runner().run(Runtime::Python, code).await.unwrap();
    assert_eq!(out.params["h"], json!(20));
    assert_eq!(out.extra["sigfigs"], json!(3));
  }

  #[tokio::test]
  async fn python_generator_mutating_data() {
    if !has("python3") {
      return;
    }
    let code = "def generate(data):\n    data['params']['m'] = 5\n    data['correct_answers']['f'] = 49.0\n";
    let out = runner().run(Runtime::Python, code).await.unwrap();
    assert_eq!(out.params["m"], json!(5));
    assert_eq!(out.correct_answers["f"], json!(49.0));
  }

  #[tokio::test]
  async fn python_failure_reports_stderr() {
    if !has("python3") {
      return;
    }
    let err = runner().run(Runtime::Python, "def generate():\n    raise ValueError('bad unit')\n").await.unwrap_err();
    assert!(err.to_string().contains("bad unit"), "{err}");
  }

  #[tokio::test]
  async fn node_generator_with_console_noise() {
    if !has("node") {
      return;
    }
    let code = "const generate = () => ({ params: { v: 3 }, correct_answers: { x: '1.5' } });\nmodule.exports = { generate };\nconsole.log(generate());\n";
    let out = runner().run(Runtime::Node, code).await.unwrap();
    assert_eq!(out.params["v"], json!(3));
  }

  #[tokio::test]
  async fn node_generator_mutating_data() {
    if !has("node") {
      return;
    }
    let code = "module.exports.generate = (data) => {\n  data.params.m = 5;\n  data.correct_answers.f = 49;\n};\n";
    let out = runner().run(Runtime::Node, code).await.unwrap();
    assert_eq!(out.params["m"], json!(5));
    assert_eq!(out.correct_answers["f"], json!(49));
  }

  #[tokio::test]
  async fn slow_generator_is_killed_after_timeout() {
    if !has("python3") {
      return;
    }
    let r = CodeRunner::new(&Settings { runner_timeout_secs: 1, ..Settings::default() });
    let started = std::time::Instant::now();
    let err = r
      .run(Runtime::Python, "import time\n\ndef generate():\n    time.sleep(30)\n    return {}\n")
      .await
      .unwrap_err();
    assert!(matches!(err, AppError::Runner(_)));
    assert!(err.to_string().contains("timed out after 1s"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
  }
}
