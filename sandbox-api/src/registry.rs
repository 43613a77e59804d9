//! Tool registry - name to (schema, invoker) mapping and the dispatch path.
//!
//! The registry is filled once at startup and then shared read-only behind
//! an `Arc`, so lookups on the hot path take no lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::envelope::ToolResponse;
use crate::error::{RegistryError, Result, SandboxError};
use crate::schema::{ArgSchema, CompiledSchema, ToolArgs};

/// Type-erased tool body. Receives arguments that already passed schema
/// validation and returns the JSON payload to wrap in the envelope.
pub type Invoker = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct ToolDescriptor {
    name: String,
    description: String,
    schema: CompiledSchema,
    invoker: Invoker,
}

/// Entry returned by `tools/list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool with an untyped invoker.
    pub fn register(
        &mut self,
        name: &str,
        description: &str,
        schema: ArgSchema,
        invoker: Invoker,
    ) -> std::result::Result<(), RegistryError> {
        if self.index.contains_key(name) {
            return Err(RegistryError::DuplicateTool(name.to_string()));
        }
        if name.is_empty() {
            return Err(RegistryError::MalformedSchema {
                tool: name.to_string(),
                reason: "empty tool name".into(),
            });
        }
        let schema = schema.compile().map_err(|reason| RegistryError::MalformedSchema {
            tool: name.to_string(),
            reason,
        })?;

        self.index.insert(name.to_string(), self.tools.len());
        self.tools.push(ToolDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            invoker,
        });
        debug!(tool = name, "Registered tool");
        Ok(())
    }

    /// Register a tool whose arguments decode into `A` and whose payload
    /// serializes from `T`.
    pub fn register_tool<A, F, Fut, T>(
        &mut self,
        name: &str,
        description: &str,
        handler: F,
    ) -> std::result::Result<(), RegistryError>
    where
        A: ToolArgs,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |raw: Value| {
            let handler = Arc::clone(&handler);
            async move {
                let args: A = serde_json::from_value(raw).map_err(|e| SandboxError::invalid(e.to_string()))?;
                let payload = handler(args).await?;
                serde_json::to_value(payload).map_err(|e| SandboxError::io("encode response", e.into()))
            }
            .boxed()
        });
        self.register(name, description, A::schema(), invoker)
    }

    /// Validate `raw` against the tool's schema, run it, and wrap the payload.
    pub async fn invoke(&self, name: &str, raw: Value) -> Result<ToolResponse> {
        let tool = self
            .index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| SandboxError::UnknownTool(name.to_string()))?;

        let start = Instant::now();
        info!(tool = name, "Tool call started");

        let result = match tool.schema.prepare(raw) {
            Ok(args) => (tool.invoker)(args).await,
            Err(e) => Err(e),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(payload) => {
                info!(tool = name, duration_ms, "Tool call finished");
                Ok(ToolResponse::from_payload(&payload))
            }
            Err(e) => {
                warn!(tool = name, duration_ms, kind = %e.kind(), error = %e, "Tool call failed");
                Err(e)
            }
        }
    }

    /// Registered tools in registration order.
    pub fn list(&self) -> Vec<ToolInfo> {
        self.tools
            .iter()
            .map(|t| ToolInfo {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.schema.json_schema().clone(),
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}
