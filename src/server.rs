//! Line-delimited JSON front end.
//!
//! Reads one request object per line, answers each with one response line
//! and pushes the results of debounced edits as `analysis` notifications.
//! Requests are handled concurrently; responses may arrive out of order and
//! are matched by `id`. Messages without an `id` get no response.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use url::Url;

use crate::cache::{Resolution, ResolvedModule};
use crate::error::{ErrorCodes, OracleError, ResponseError, error_chain};
use crate::scheduler::{Priority, Scheduled};
use crate::service::{AnalysisResult, AnalyzeParams, Service};

const LOG_TARGET: &str = "oracle_ls::server";

/// Method of the notification carrying a delivered edit analysis.
pub const ANALYSIS_NOTIFICATION: &str = "analysis";

#[derive(Debug, Deserialize)]
struct IncomingRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OutgoingMessage {
    Success {
        id: Value,
        result: Value,
    },
    Failure {
        id: Value,
        error: ResponseError,
    },
    Notification {
        method: &'static str,
        params: Value,
    },
}

#[derive(Debug, Error)]
enum HandlerError {
    #[error("invalid params: {0}")]
    InvalidParams(#[from] serde_json::Error),

    #[error("unknown method `{0}`")]
    MethodNotFound(String),

    #[error(transparent)]
    Oracle(#[from] OracleError),
}

impl HandlerError {
    fn to_response_error(&self) -> ResponseError {
        match self {
            HandlerError::InvalidParams(_) => {
                ResponseError::new(ErrorCodes::INVALID_PARAMS, self.to_string())
            }
            HandlerError::MethodNotFound(_) => {
                ResponseError::new(ErrorCodes::METHOD_NOT_FOUND, self.to_string())
            }
            HandlerError::Oracle(e) => e.to_response_error(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DidChangeParams {
    #[serde(flatten)]
    analyze: AnalyzeParams,
    #[serde(default)]
    priority: Priority,
}

#[derive(Debug, Deserialize)]
struct UriParams {
    uri: Url,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolveModuleParams {
    module: String,
    #[serde(default)]
    inherited: bool,
}

#[derive(Debug, Deserialize)]
struct FindSymbolParams {
    name: String,
}

type Outbox = mpsc::UnboundedSender<String>;

fn post(outbox: &Outbox, message: &OutgoingMessage) {
    match serde_json::to_string(message) {
        Ok(line) => {
            let _ = outbox.send(line);
        }
        Err(e) => warn!(target: LOG_TARGET, "Failed to encode outgoing message: {}", e),
    }
}

/// Serve requests from `input` until EOF or a `shutdown` request, then shut
/// the service down.
pub async fn serve<R, W>(service: Arc<Service>, input: R, output: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, outgoing) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(output, outgoing));

    let mut handlers = JoinSet::new();
    let read_result = read_requests(&service, input, &outbox, &mut handlers).await;

    service.shutdown().await;
    while handlers.join_next().await.is_some() {}
    drop(outbox);

    let write_result = writer
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)));
    info!(target: LOG_TARGET, "Front end stopped");
    read_result.and(write_result)
}

async fn read_requests<R: AsyncRead + Unpin>(
    service: &Arc<Service>,
    input: R,
    outbox: &Outbox,
    handlers: &mut JoinSet<()>,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: IncomingRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(target: LOG_TARGET, "Malformed request: {}", e);
                post(
                    outbox,
                    &OutgoingMessage::Failure {
                        id: Value::Null,
                        error: ResponseError::new(ErrorCodes::PARSE_ERROR, e.to_string()),
                    },
                );
                continue;
            }
        };
        debug!(target: LOG_TARGET, "← {}", request.method);

        if request.method == "shutdown" {
            if let Some(id) = request.id {
                post(
                    outbox,
                    &OutgoingMessage::Success {
                        id,
                        result: Value::Null,
                    },
                );
            }
            info!(target: LOG_TARGET, "Shutdown requested");
            return Ok(());
        }

        let service = Arc::clone(service);
        let outbox = outbox.clone();
        handlers.spawn(async move {
            let outcome = handle(&service, &request.method, request.params, &outbox).await;
            match (request.id, outcome) {
                (Some(id), Ok(result)) => post(&outbox, &OutgoingMessage::Success { id, result }),
                (Some(id), Err(e)) => post(
                    &outbox,
                    &OutgoingMessage::Failure {
                        id,
                        error: e.to_response_error(),
                    },
                ),
                (None, Err(e)) => {
                    warn!(target: LOG_TARGET, "{} failed: {}", request.method, error_chain(&e))
                }
                (None, Ok(_)) => {}
            }
        });
    }
    Ok(())
}

async fn write_lines<W: AsyncWrite + Unpin>(
    mut output: W,
    mut outgoing: mpsc::UnboundedReceiver<String>,
) -> std::io::Result<()> {
    while let Some(mut line) = outgoing.recv().await {
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}

async fn handle(
    service: &Service,
    method: &str,
    params: Value,
    outbox: &Outbox,
) -> Result<Value, HandlerError> {
    match method {
        "analyze" => {
            let params: AnalyzeParams = serde_json::from_value(params)?;
            Ok(serde_json::to_value(service.analyze(params).await?)?)
        }
        "didChange" => {
            let DidChangeParams { analyze, priority } = serde_json::from_value(params)?;
            let uri = analyze.uri.clone();
            let ticket = service.did_change(analyze, priority);
            let revision = ticket.revision();
            let outbox = outbox.clone();
            tokio::spawn(async move {
                push_analysis(&outbox, uri, ticket.wait().await);
            });
            Ok(json!({ "revision": revision }))
        }
        "didClose" => {
            let UriParams { uri, .. } = serde_json::from_value(params)?;
            service.did_close(&uri);
            Ok(Value::Null)
        }
        "resolveModule" => {
            let ResolveModuleParams { module, inherited } = serde_json::from_value(params)?;
            if inherited {
                let walk = service.resolve_module_tree(&module).await?;
                Ok(Value::Array(walk.iter().map(walk_step_json).collect()))
            } else {
                let resolution = service.resolve_module(&module).await?;
                Ok(resolution_json(&module, &resolution))
            }
        }
        "getInherited" => {
            let UriParams { uri, text } = serde_json::from_value(params)?;
            let inherits = service.get_inherited(&uri, text.as_deref()).await?;
            Ok(json!({ "uri": uri, "inherits": inherits }))
        }
        "findSymbol" => {
            let FindSymbolParams { name } = serde_json::from_value(params)?;
            let found: Vec<Value> = service
                .find_symbol(&name)
                .into_iter()
                .map(|(uri, symbol)| json!({ "uri": uri, "symbol": symbol }))
                .collect();
            Ok(Value::Array(found))
        }
        "getHealth" => Ok(serde_json::to_value(service.health())?),
        "getCacheStats" => {
            let mut stats = serde_json::to_value(service.cache_stats())?;
            stats["scheduler"] = serde_json::to_value(service.scheduler_stats().await)?;
            Ok(stats)
        }
        "getOracleMetrics" => Ok(service.oracle_metrics().await?),
        other => Err(HandlerError::MethodNotFound(other.to_string())),
    }
}

fn push_analysis(outbox: &Outbox, uri: Url, outcome: Scheduled<AnalysisResult>) {
    let params = match outcome {
        Scheduled::Delivered {
            revision,
            output: Ok(response),
        } => json!({
            "uri": uri,
            "revision": revision,
            "result": response.result,
            "failures": response.failures,
        }),
        Scheduled::Delivered {
            revision,
            output: Err(e),
        } => json!({
            "uri": uri,
            "revision": revision,
            "error": e.to_response_error(),
        }),
        Scheduled::Superseded { revision } | Scheduled::Closed { revision } => {
            debug!(
                target: LOG_TARGET,
                "No analysis pushed for {} revision {}",
                uri,
                revision
            );
            return;
        }
    };
    post(
        outbox,
        &OutgoingMessage::Notification {
            method: ANALYSIS_NOTIFICATION,
            params,
        },
    );
}

fn resolution_json(module: &str, resolution: &Resolution) -> Value {
    match resolution {
        Resolution::Found(symbols) => json!({
            "module": module,
            "status": "found",
            "path": symbols.path,
            "symbols": symbols.symbols,
            "inherits": symbols.inherits,
        }),
        Resolution::NotFound => json!({ "module": module, "status": "notFound" }),
        Resolution::InProgress => json!({ "module": module, "status": "inProgress" }),
    }
}

fn walk_step_json(step: &ResolvedModule) -> Value {
    let mut value = resolution_json(&step.module, &step.resolution);
    value["depth"] = json!(step.depth);
    value
}
