//! Subprocess-backed worker capability
//!
//! Runs a configured shell command in the sandbox and reads a JSON result
//! envelope `{success, artifacts_changed, notes}` from the last non-empty
//! line of stdout. The command string is a handlebars template rendered
//! with the task context, so operators can wire in any external tool.

use handlebars::Handlebars;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, warn};

use super::capability::{Capability, CapabilityError, WorkerKind, WorkerOutcome, WorkerTask};

/// Worker capability that shells out to an external command
pub struct CommandCapability {
    kind: WorkerKind,
    template: String,
    handlebars: Handlebars<'static>,
}

impl CommandCapability {
    /// Create a capability from a command template
    ///
    /// Template variables: `{{description}}`, `{{sandbox}}`, `{{feature}}`,
    /// `{{project}}`, `{{kind}}`, `{{criteria}}`, `{{prior_failures}}`.
    pub fn new(kind: WorkerKind, template: impl Into<String>) -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        Self {
            kind,
            template: template.into(),
            handlebars,
        }
    }

    fn render_command(&self, task: &WorkerTask) -> Result<String, CapabilityError> {
        let criteria: Vec<String> = task
            .criteria
            .iter()
            .map(|c| format!("[{}] {}", c.tier, c.text))
            .collect();

        let ctx = json!({
            "description": task.description,
            "sandbox": task.sandbox_root.display().to_string(),
            "feature": task.feature_id,
            "project": task.project,
            "kind": self.kind.to_string(),
            "criteria": criteria.join("\n"),
            "prior_failures": task.prior_failures.join("\n"),
        });

        self.handlebars
            .render_template(&self.template, &ctx)
            .map_err(|e| CapabilityError::Launch(format!("template render failed: {}", e)))
    }

    fn parse_envelope(stdout: &str) -> Result<WorkerOutcome, CapabilityError> {
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| CapabilityError::MalformedResult("empty worker output".to_string()))?;

        serde_json::from_str(line.trim())
            .map_err(|e| CapabilityError::MalformedResult(format!("{}: {:?}", e, line.trim())))
    }
}

#[async_trait::async_trait]
impl Capability for CommandCapability {
    fn kind(&self) -> WorkerKind {
        self.kind
    }

    async fn invoke(&self, task: &WorkerTask) -> Result<WorkerOutcome, CapabilityError> {
        let command = self.render_command(task)?;
        debug!(kind = %self.kind, feature = %task.feature_id, %command, "Invoking worker command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&task.sandbox_root)
            .output()
            .await
            .map_err(|e| CapabilityError::Launch(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(kind = %self.kind, feature = %task.feature_id, "Worker exited abnormally");
            return Err(CapabilityError::Crashed(format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Self::parse_envelope(&stdout)
    }
}
