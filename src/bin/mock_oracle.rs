//! Stand-in analysis oracle for integration tests.
//!
//! Speaks the same line-delimited JSON-RPC as a real oracle and fakes just
//! enough analysis to be observable: declarations ending in `;` become
//! symbols, `inherit X;` lines become parents. Requests are answered
//! concurrently, so a slow call never blocks a fast one.
//!
//! Environment:
//! - `MOCK_ORACLE_FAIL_FACETS`: comma-separated facets that always fail
//! - `MOCK_ORACLE_ANALYZE_DELAY_MS`: delay before answering `analyze`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const MODULE_NOT_FOUND: i64 = -32001;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const COMPILE_FAILED: i64 = -32002;

type Reply = Result<Value, (i64, String)>;

struct MockOracle {
    started: Instant,
    fail_facets: Vec<String>,
    analyze_delay: Duration,
    calls: Mutex<BTreeMap<String, u64>>,
    last_analyze_text: Mutex<Option<String>>,
    programs: AtomicU64,
}

impl MockOracle {
    fn from_env() -> Self {
        let fail_facets = std::env::var("MOCK_ORACLE_FAIL_FACETS")
            .map(|value| {
                value
                    .split(',')
                    .map(|facet| facet.trim().to_string())
                    .filter(|facet| !facet.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let analyze_delay = std::env::var("MOCK_ORACLE_ANALYZE_DELAY_MS")
            .ok()
            .and_then(|ms| ms.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or_default();
        Self {
            started: Instant::now(),
            fail_facets,
            analyze_delay,
            calls: Mutex::new(BTreeMap::new()),
            last_analyze_text: Mutex::new(None),
            programs: AtomicU64::new(0),
        }
    }

    fn count(&self, method: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(method.to_string()).or_insert(0) += 1;
        }
    }

    async fn handle(&self, method: &str, params: Value) -> Reply {
        match method {
            "get_version" => Ok(json!({ "version": "mock-oracle 1.0" })),
            "analyze" => self.analyze(params).await,
            "parse" => Ok(json!({ "tokens": tokenize(text_param(&params)?) })),
            "introspect" => Ok(introspect(text_param(&params)?)),
            "resolveStdlib" => resolve_module(&params),
            "get_inherited" => {
                let text = params.get("text").and_then(Value::as_str).unwrap_or("");
                Ok(introspect(text)["inherits"].clone())
            }
            "sleep" => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept": ms }))
            }
            "crash" => {
                eprintln!("mock-oracle: crashing on request");
                std::process::exit(3);
            }
            "get_call_counts" => {
                let calls = self.calls.lock().map(|c| c.clone()).unwrap_or_default();
                let last = self
                    .last_analyze_text
                    .lock()
                    .map(|t| t.clone())
                    .unwrap_or_default();
                Ok(json!({ "calls": calls, "lastAnalyzeText": last }))
            }
            "get_startup_metrics" => Ok(json!({
                "pid": std::process::id(),
                "uptimeMs": self.started.elapsed().as_millis() as u64,
            })),
            "get_cache_stats" => Ok(json!({ "programs": self.programs.load(Ordering::SeqCst) })),
            other => Err((METHOD_NOT_FOUND, format!("unknown method {}", other))),
        }
    }

    async fn analyze(&self, params: Value) -> Reply {
        if !self.analyze_delay.is_zero() {
            tokio::time::sleep(self.analyze_delay).await;
        }
        let text = text_param(&params)?;
        if let Ok(mut last) = self.last_analyze_text.lock() {
            *last = Some(text.to_string());
        }
        if text.contains("#error") {
            return Err((COMPILE_FAILED, "compilation failed".to_string()));
        }

        let include: Vec<String> = params
            .get("include")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut result = serde_json::Map::new();
        let mut failures = serde_json::Map::new();
        for facet in include {
            if self.fail_facets.contains(&facet) {
                failures.insert(
                    facet.clone(),
                    json!({ "kind": "compile", "message": format!("{} failed", facet) }),
                );
                continue;
            }
            let value = match facet.as_str() {
                "parse" => json!({ "declarations": declarations(text).len() }),
                "introspect" => introspect(text),
                "diagnostics" => json!([]),
                "tokenize" => json!(tokenize(text)),
                _ => continue,
            };
            result.insert(facet, value);
        }

        let handle = self.programs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({
            "handle": format!("program-{}", handle),
            "result": result,
            "failures": failures,
        }))
    }
}

fn text_param(params: &Value) -> Result<&str, (i64, String)> {
    params
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| (INVALID_PARAMS, "missing text".to_string()))
}

fn declarations(text: &str) -> Vec<&str> {
    text.split(';')
        .map(str::trim)
        .filter(|decl| !decl.is_empty())
        .collect()
}

fn tokenize(text: &str) -> Vec<&str> {
    text.split(|c: char| c.is_whitespace() || c == ';')
        .filter(|token| !token.is_empty())
        .collect()
}

fn introspect(text: &str) -> Value {
    let mut symbols = Vec::new();
    let mut inherits = Vec::new();
    for decl in declarations(text) {
        if let Some(parent) = decl.strip_prefix("inherit ") {
            inherits.push(parent.trim().to_string());
            continue;
        }
        let kind = if decl.contains('(') { "function" } else { "variable" };
        let head = decl.split('(').next().unwrap_or(decl);
        if let Some(name) = head.split_whitespace().last() {
            symbols.push(json!({ "name": name, "kind": kind }));
        }
    }
    json!({ "symbols": symbols, "inherits": inherits })
}

fn resolve_module(params: &Value) -> Reply {
    let module = params
        .get("module")
        .and_then(Value::as_str)
        .ok_or_else(|| (INVALID_PARAMS, "missing module".to_string()))?;
    let (symbols, inherits): (Vec<(&str, &str)>, Vec<&str>) = match module {
        "Stdio" => (vec![("File", "class"), ("stdout", "variable")], vec![]),
        "Stdio.File" => (vec![("read", "function"), ("write", "function")], vec!["Stdio.Stream"]),
        "Stdio.Stream" => (vec![("close", "function")], vec![]),
        "Array" => (vec![("sum", "function"), ("uniq", "function")], vec![]),
        "String" => (vec![("trim", "function")], vec![]),
        "Cycle.A" => (vec![("a", "function")], vec!["Cycle.B"]),
        "Cycle.B" => (vec![("b", "function")], vec!["Cycle.A"]),
        _ => return Err((MODULE_NOT_FOUND, format!("module {} not found", module))),
    };
    Ok(json!({
        "path": format!("/usr/lib/mock/{}.pmod", module.replace('.', "/")),
        "symbols": symbols
            .into_iter()
            .map(|(name, kind)| json!({ "name": name, "kind": kind }))
            .collect::<Vec<_>>(),
        "inherits": inherits,
    }))
}

#[tokio::main]
async fn main() {
    let oracle = Arc::new(MockOracle::from_env());
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    eprintln!("mock-oracle: ready");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            eprintln!("mock-oracle: malformed request");
            continue;
        };
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        oracle.count(&method);

        let oracle = Arc::clone(&oracle);
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = match oracle.handle(&method, params).await {
                Ok(result) => json!({ "id": id, "result": result }),
                Err((code, message)) => {
                    json!({ "id": id, "error": { "code": code, "message": message } })
                }
            };
            let _ = tx.send(reply.to_string());
        });
    }

    drop(tx);
    let _ = writer.await;
}
