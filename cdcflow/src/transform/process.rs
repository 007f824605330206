use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::bail;
use crate::error::{ErrorKind, FlowResult};
use crate::flow_error;
use crate::transform::Transformer;
use crate::types::ChangeEventEnvelope;

/// Maximum number of stderr bytes kept in error details.
const MAX_STDERR_DETAIL: usize = 2_048;

/// Runs an external program once per change.
///
/// The change envelope is written as JSON to the program's stdin and the payload is read as
/// JSON from its stdout. A non zero exit status fails the transformation with the program's
/// stderr as detail. The child is killed when the invocation is dropped, which is what
/// happens when it exceeds the transform deadline.
#[derive(Debug, Clone)]
pub struct ProcessTransformer {
    program: String,
    args: Vec<String>,
}

impl ProcessTransformer {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

#[async_trait]
impl Transformer for ProcessTransformer {
    async fn transform(&self, event: &ChangeEventEnvelope) -> FlowResult<serde_json::Value> {
        let input = serde_json::to_vec(event)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                flow_error!(
                    ErrorKind::TransformFailed,
                    "Failed to start transformer process",
                    format!("program `{}`: {err}", self.program),
                    source: err
                )
            })?;

        let stdin = child.stdin.take();
        let write_input = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };

            // A program may exit without reading its input, its exit status decides.
            match stdin.write_all(&input).await {
                Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(err),
                _ => Ok(()),
            }
        };

        let (written, output) = tokio::join!(write_input, child.wait_with_output());
        written?;
        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.chars().take(MAX_STDERR_DETAIL).collect();

            bail!(
                ErrorKind::TransformFailed,
                "Transformer process exited with an error",
                format!("program `{}` exited with {}: {stderr}", self.program, output.status)
            );
        }

        serde_json::from_slice(&output.stdout).map_err(|err| {
            flow_error!(
                ErrorKind::TransformFailed,
                "Transformer process produced invalid JSON",
                format!("program `{}`: {err}", self.program),
                source: err
            )
        })
    }
}
