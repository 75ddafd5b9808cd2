//! S3 store driven through the `aws` command-line client.
//!
//! Archives are streamed into `aws s3 cp - s3://...` over a piped stdin, so
//! nothing touches local disk. `--expected-size` lets the CLI pick a part size
//! that keeps the upload under the multipart part limit.

use super::{ByteReader, ObjectStore, PutOptions};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::process::{Output, Stdio};
use tokio::process::Command;

const AWS_PROGRAM: &str = "aws";

pub struct AwsCliStore {
    bucket: String,
    program: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    contents: Vec<ListedObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedObject {
    key: String,
}

impl AwsCliStore {
    pub fn new(bucket: String) -> Self {
        Self {
            bucket,
            program: AWS_PROGRAM.to_string(),
        }
    }

    /// Use a different executable (e.g. a wrapper script).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run_capture(&self, mut cmd: Command, what: &str) -> Result<Output> {
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BackupError::Transport(format!("failed to spawn {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(BackupError::Transport(format!(
                "{} failed ({}): {}",
                what,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output)
    }
}

/// Count exact key matches in `list-objects-v2` JSON output.
fn count_exact(stdout: &[u8], key: &str) -> Result<usize> {
    if stdout.iter().all(u8::is_ascii_whitespace) {
        return Ok(0);
    }
    let listing: ListObjectsOutput = serde_json::from_slice(stdout)
        .map_err(|e| BackupError::Transport(format!("unexpected list-objects output: {}", e)))?;
    Ok(listing.contents.iter().filter(|o| o.key == key).count())
}

#[async_trait]
impl ObjectStore for AwsCliStore {
    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    async fn fetch(&self, key: &str) -> Result<Option<Bytes>> {
        if self.count(key).await? == 0 {
            return Ok(None);
        }

        let mut cmd = self.command();
        cmd.args(["s3", "cp", "--only-show-errors"]).arg(self.uri(key)).arg("-");
        let output = self.run_capture(cmd, &format!("download of {}", key)).await?;
        Ok(Some(Bytes::from(output.stdout)))
    }

    async fn count(&self, key: &str) -> Result<usize> {
        let mut cmd = self.command();
        cmd.args(["s3api", "list-objects-v2", "--output", "json", "--bucket"])
            .arg(&self.bucket)
            .arg("--prefix")
            .arg(key);
        let output = self.run_capture(cmd, &format!("listing of {}", key)).await?;
        count_exact(&output.stdout, key)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // `s3 rm` on a missing key exits 0
        let mut cmd = self.command();
        cmd.args(["s3", "rm", "--only-show-errors"]).arg(self.uri(key));
        self.run_capture(cmd, &format!("removal of {}", key)).await?;
        Ok(())
    }

    async fn put_stream(&self, key: &str, mut body: ByteReader, options: &PutOptions) -> Result<u64> {
        let mut cmd = self.command();
        cmd.args(["s3", "cp", "--only-show-errors", "-"])
            .arg(self.uri(key))
            .arg("--storage-class")
            .arg(&options.storage_class)
            .arg("--expected-size")
            .arg(options.chunk_plan.max_object_size.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| BackupError::Transport(format!("failed to spawn {}: {}", self.program, e)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackupError::Transport("aws stdin not captured".into()))?;

        // EOF on stdin commits the object; a failed body kills the CLI instead
        let written = match tokio::io::copy(&mut body, &mut stdin).await {
            Ok(n) => n,
            Err(e) => {
                if let Err(kill) = child.kill().await {
                    tracing::warn!("Failed to stop upload of {}: {}", key, kill);
                }
                return Err(BackupError::Transport(format!("streaming {}: {}", key, e)));
            }
        };
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackupError::Transport(format!("waiting for upload of {}: {}", key, e)))?;

        if !output.status.success() {
            return Err(BackupError::Transport(format!(
                "upload of {} failed ({}): {}",
                key,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(written)
    }
}
