//! Co-located runtimes launched as child processes.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ContextFiles, RuntimeBootstrap, RuntimeConnector, RuntimeHandle, RuntimeTarget};
use crate::config::RuntimeConfig;
use crate::domain::error::DomainError;
use crate::infra::log_forwarder::{StreamKind, spawn_stream_forwarder};

/// Grace period per process when the whole connector shuts down.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Sends SIGTERM; returns `false` when the process is gone or the signal failed.
#[cfg(unix)]
fn send_terminate_signal(child: &Child) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    let Ok(pid) = i32::try_from(pid) else {
        tracing::warn!(pid, "pid exceeds i32::MAX, cannot send SIGTERM");
        return false;
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
}

#[cfg(windows)]
fn send_terminate_signal(_child: &Child) -> bool {
    false
}

/// SIGTERM, wait up to `grace`, then kill.
async fn stop_child_with_grace(child: &mut Child, module_id: &str, grace: Duration) {
    let pid = child.id();
    let graceful = send_terminate_signal(child);
    tracing::debug!(module_id = %module_id, pid = ?pid, graceful, "stopping runtime process");

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(module_id = %module_id, status = ?status, "runtime process exited");
        }
        Ok(Err(e)) => {
            tracing::warn!(module_id = %module_id, error = %e, "failed to wait for runtime process");
        }
        Err(_) => {
            tracing::debug!(module_id = %module_id, "grace period expired, killing runtime process");
            if let Err(e) = child.kill().await {
                tracing::warn!(module_id = %module_id, error = %e, "failed to kill runtime process");
            }
        }
    }
}

async fn wait_forwarder(handle: Option<JoinHandle<()>>) {
    if let Some(h) = handle {
        _ = tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, h).await;
    }
}

struct ProcessInstance {
    module_id: String,
    child: Child,
    stdout_forwarder: Option<JoinHandle<()>>,
    stderr_forwarder: Option<JoinHandle<()>>,
    // removed with the instance
    _files: ContextFiles,
}

type InstanceMap = HashMap<Uuid, ProcessInstance>;

fn substitute(arg: &str, files: &ContextFiles, port: u16) -> String {
    arg.replace("{model}", &files.runtime.model)
        .replace("{config}", &files.runtime.config)
        .replace("{port}", &port.to_string())
}

/// Launches the runtime executable next to the orchestrator.
///
/// When the cancellation token fires every tracked process is stopped with a grace period.
pub struct ProcessConnector {
    cfg: RuntimeConfig,
    instances: Arc<RwLock<InstanceMap>>,
    cancel: CancellationToken,
}

impl ProcessConnector {
    #[must_use]
    pub fn new(cfg: RuntimeConfig, cancel: CancellationToken) -> Self {
        let connector = Self {
            cfg,
            instances: Arc::new(RwLock::new(HashMap::new())),
            cancel: cancel.clone(),
        };

        let instances = Arc::clone(&connector.instances);
        tokio::spawn(async move {
            cancel.cancelled().await;
            Self::shutdown_all(instances).await;
        });

        connector
    }

    async fn shutdown_all(instances: Arc<RwLock<InstanceMap>>) {
        let mut all: Vec<ProcessInstance> = instances.write().drain().map(|(_, i)| i).collect();
        if all.is_empty() {
            return;
        }
        tracing::info!(count = all.len(), "stopping co-located runtimes");
        for inst in &mut all {
            stop_child_with_grace(&mut inst.child, &inst.module_id, SHUTDOWN_GRACE_PERIOD).await;
        }
        for inst in all {
            wait_forwarder(inst.stdout_forwarder).await;
            wait_forwarder(inst.stderr_forwarder).await;
        }
    }

    fn build_command(&self, files: &ContextFiles, port: u16) -> Result<Command, DomainError> {
        let executable = self.cfg.executable.as_ref().ok_or_else(|| {
            DomainError::configuration_conflict("no runtime executable configured for co-located modules")
        })?;
        let mut cmd = Command::new(executable);
        cmd.args(self.cfg.args.iter().map(|a| substitute(a, files, port)))
            .env("faaast_model", &files.runtime.model)
            .env("faaast_config", &files.runtime.config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.cfg.working_directory {
            if Path::new(dir).is_dir() {
                cmd.current_dir(dir);
            } else {
                tracing::warn!(working_dir = %dir.display(), "working directory does not exist, using current dir");
            }
        }
        Ok(cmd)
    }
}

#[async_trait]
impl RuntimeConnector for ProcessConnector {
    #[tracing::instrument(skip_all, fields(module_id = %bootstrap.module_id, port = bootstrap.http_port))]
    async fn start(&self, bootstrap: &RuntimeBootstrap) -> Result<RuntimeHandle, DomainError> {
        let files = ContextFiles::write(
            bootstrap,
            |paths| bootstrap.service_config(bootstrap.http_port, paths),
            None,
        )?;
        let mut cmd = self.build_command(&files, bootstrap.http_port)?;
        let mut child = cmd.spawn().map_err(|e| {
            DomainError::start_failure(&bootstrap.module_id, format!("failed to spawn runtime: {e}"))
        })?;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(DomainError::start_failure(
                &bootstrap.module_id,
                format!("runtime exited immediately with {status}"),
            ));
        }

        let pid = child.id();
        let instance_id = Uuid::now_v7();
        let module = bootstrap.module_id.clone();
        let stdout_forwarder = child.stdout.take().map(|out| {
            spawn_stream_forwarder(out, module.clone(), self.cancel.clone(), StreamKind::Stdout)
        });
        let stderr_forwarder = child.stderr.take().map(|err| {
            spawn_stream_forwarder(err, module.clone(), self.cancel.clone(), StreamKind::Stderr)
        });

        tracing::info!(pid = ?pid, instance_id = %instance_id, "co-located runtime started");
        self.instances.write().insert(
            instance_id,
            ProcessInstance {
                module_id: module,
                child,
                stdout_forwarder,
                stderr_forwarder,
                _files: files,
            },
        );

        Ok(RuntimeHandle {
            module_id: bootstrap.module_id.clone(),
            instance_id,
            http_port: bootstrap.http_port,
            target: RuntimeTarget::Process { pid },
        })
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), DomainError> {
        let instance = self.instances.write().remove(&handle.instance_id);
        match instance {
            Some(mut inst) => {
                stop_child_with_grace(&mut inst.child, &inst.module_id, self.cfg.stop_grace).await;
            }
            None => {
                tracing::debug!(module_id = %handle.module_id, instance_id = %handle.instance_id, "runtime already stopped");
            }
        }
        Ok(())
    }

    async fn is_running(&self, handle: &RuntimeHandle) -> bool {
        let mut instances = self.instances.write();
        instances
            .get_mut(&handle.instance_id)
            .is_some_and(|inst| matches!(inst.child.try_wait(), Ok(None)))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::aas::EnvironmentContext;
    use crate::domain::address::Address;
    use crate::domain::model::DeploymentType;

    fn bootstrap() -> RuntimeBootstrap {
        RuntimeBootstrap {
            module_id: "m1".to_owned(),
            deployment_type: DeploymentType::Internal,
            http_port: 4200,
            event_bus: Address::new("localhost", 1883),
            model: EnvironmentContext::default(),
            asset_connections: Vec::new(),
            return_results_for_each_step: true,
        }
    }

    fn connector(executable: Option<&str>, args: &[&str]) -> ProcessConnector {
        ProcessConnector::new(
            RuntimeConfig {
                executable: executable.map(Into::into),
                args: args.iter().map(|a| (*a).to_owned()).collect(),
                stop_grace: Duration::from_millis(500),
                ..RuntimeConfig::default()
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn missing_executable_is_a_configuration_error() {
        let err = connector(None, &[]).start(&bootstrap()).await.unwrap_err();
        assert!(matches!(err, DomainError::ConfigurationConflict(_)));
    }

    #[tokio::test]
    async fn unknown_executable_is_a_start_failure() {
        let err = connector(Some("/nonexistent/runtime"), &[])
            .start(&bootstrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::RuntimeStartFailure { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_and_stop_child_process() {
        let connector = connector(Some("sleep"), &["30"]);
        let handle = connector.start(&bootstrap()).await.unwrap();
        assert!(matches!(handle.target, RuntimeTarget::Process { pid: Some(_) }));
        assert!(connector.is_running(&handle).await);

        connector.stop(&handle).await.unwrap();
        assert!(!connector.is_running(&handle).await);
        connector.stop(&handle).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_runtime_is_reported_not_running() {
        let connector = connector(Some("sh"), &["-c", "test -f {config} && sleep 0.2 && exit 3"]);
        let handle = connector.start(&bootstrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!connector.is_running(&handle).await);
        connector.stop(&handle).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_token_stops_all_processes() {
        let cancel = CancellationToken::new();
        let connector = ProcessConnector::new(
            RuntimeConfig {
                executable: Some("sleep".into()),
                args: vec!["30".to_owned()],
                ..RuntimeConfig::default()
            },
            cancel.clone(),
        );
        let handle = connector.start(&bootstrap()).await.unwrap();
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!connector.is_running(&handle).await);
    }
}
