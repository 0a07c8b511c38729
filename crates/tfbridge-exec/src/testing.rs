//! Scripted collaborators for unit tests

use crate::context::OpContext;
use crate::error::{ExecError, Result};
use crate::executor::{CommandOutput, CommandSpec, Executor};
use crate::runner::ProviderRunner;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tfbridge_core::STATE_FILE;
use tokio::sync::Notify;

/// Canned result of one scripted invocation
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub success: bool,
    pub output: String,
    /// Written to the command's working directory as the state file
    pub state: Option<String>,
}

impl Response {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            state: None,
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            state: None,
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }
}

/// Executor that records invocations and replays queued responses.
/// An empty queue answers with a bare success.
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<CommandSpec>>,
    responses: Mutex<VecDeque<Response>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedExecutor {
    pub fn new(responses: impl IntoIterator<Item = Response>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Every invocation waits for a notification on `gate` before answering
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    pub fn call_args(&self) -> Vec<Vec<String>> {
        self.calls.lock().iter().map(|c| c.args.clone()).collect()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(&self, spec: &CommandSpec, _ctx: &OpContext) -> Result<CommandOutput> {
        self.calls.lock().push(spec.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let response = self
            .responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Response::ok(""));
        if let (Some(state), Some(dir)) = (&response.state, &spec.dir) {
            tokio::fs::write(dir.join(STATE_FILE), state).await?;
        }
        Ok(CommandOutput {
            success: response.success,
            code: Some(if response.success { 0 } else { 1 }),
            output: response.output.into_bytes(),
        })
    }
}

/// Runner counting its lifecycle calls
pub struct FakeRunner {
    reattach_config: String,
    fail: bool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeRunner {
    pub fn new(reattach_config: impl Into<String>) -> Self {
        Self {
            reattach_config: reattach_config.into(),
            fail: false,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new("")
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderRunner for FakeRunner {
    async fn start(&self) -> Result<String> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ExecError::ProviderExited("exit status: 1".to_string()));
        }
        Ok(self.reattach_config.clone())
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub const EMPTY_STATE: &str = r#"{"version":4,"terraform_version":"1.5.7","serial":1,"lineage":"l","outputs":{},"resources":[]}"#;

/// State document holding one instance with the given id
pub fn state_with_id(id: &str) -> String {
    serde_json::json!({
        "version": 4,
        "terraform_version": "1.5.7",
        "serial": 2,
        "lineage": "l",
        "outputs": {},
        "resources": [{
            "mode": "managed",
            "type": "aws_vpc",
            "name": "example",
            "provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
            "instances": [{
                "schema_version": 1,
                "attributes": {"id": id, "cidr_block": "10.0.0.0/16"},
                "sensitive_attributes": []
            }]
        }]
    })
    .to_string()
}
