//! Pod command execution through `kubectl exec`.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::domain::ports::{ExecOutput, PodExec};
use crate::error::Result;

/// Runs commands inside pods with the `kubectl` binary on the harness host.
#[derive(Debug, Clone)]
pub struct KubectlExec {
    binary: String,
    kubeconfig: Option<String>,
}

impl Default for KubectlExec {
    fn default() -> Self {
        Self::new("kubectl")
    }
}

impl KubectlExec {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig: None,
        }
    }

    pub fn with_kubeconfig(mut self, path: impl Into<String>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    fn args(&self, namespace: &str, pod: &str, command: &[String]) -> Vec<String> {
        let mut args = Vec::with_capacity(command.len() + 6);
        if let Some(path) = &self.kubeconfig {
            args.push(format!("--kubeconfig={}", path));
        }
        args.extend(
            ["exec", "-n", namespace, pod, "--"]
                .iter()
                .map(|s| s.to_string()),
        );
        args.extend(command.iter().cloned());
        args
    }
}

/// Combined stdout and stderr, as fio and the shell tools report failures on either.
fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).into_owned();
    let err = String::from_utf8_lossy(stderr);
    if !err.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&err);
    }
    text
}

#[async_trait]
impl PodExec for KubectlExec {
    #[instrument(skip(self, command), fields(program = command.first().map(String::as_str).unwrap_or("")))]
    async fn exec(&self, namespace: &str, pod: &str, command: &[String]) -> Result<ExecOutput> {
        let output = Command::new(&self.binary)
            .args(self.args(namespace, pod, command))
            .kill_on_drop(true)
            .output()
            .await?;

        debug!(exit_code = ?output.status.code(), "kubectl exec finished");
        Ok(ExecOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: combined_output(&output.stdout, &output.stderr),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_place_command_after_separator() {
        let exec = KubectlExec::default().with_kubeconfig("/tmp/kc");
        let args = exec.args("default", "fio", &["fio".into(), "--name=w".into()]);
        assert_eq!(
            args,
            vec!["--kubeconfig=/tmp/kc", "exec", "-n", "default", "fio", "--", "fio", "--name=w"]
        );
    }

    #[test]
    fn test_combined_output_joins_streams() {
        assert_eq!(combined_output(b"ok", b""), "ok");
        assert_eq!(combined_output(b"out", b"err"), "out\nerr");
        assert_eq!(combined_output(b"", b"err"), "err");
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let exec = KubectlExec::new("/nonexistent/kubectl-binary");
        let err = exec.exec("default", "fio", &["true".into()]).await.unwrap_err();
        assert_eq!(err.kind(), "io");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandoned_exec_kills_child() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = std::env::temp_dir().join(format!("kubectl-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir).unwrap();
        let marker = dir.join("finished");
        let binary = dir.join("kubectl");
        std::fs::write(
            &binary,
            format!("#!/bin/sh\nsleep 2\ntouch {}\n", marker.display()),
        )
        .unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let exec = KubectlExec::new(binary.display().to_string());
        let command = ["fio".to_string(), "--rw=randwrite".to_string()];
        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            exec.exec("default", "fio-app", &command),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
