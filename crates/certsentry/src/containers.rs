//! Container lifecycle notification.
//!
//! After certificate files change on disk, dependent containers that only
//! read TLS material at startup need a restart (or a stop, when an external
//! supervisor brings them back up). The runtime is a narrow capability
//! trait so the engine never depends on a particular orchestration client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{RestartContainerOptions, StopContainerOptions};
use bollard::Docker;
use thiserror::Error;
use tracing::{error, info};

/// How long a container gets to exit gracefully before being killed
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Container action errors, logged per-container and never fatal
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

/// What to do to a dependent container after a file change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Restart the container in place
    Restart,
    /// Only stop it; something else starts it back up
    Stop,
}

/// Narrow restart/stop capability over some container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Restart the named container, allowing `graceful_timeout` for exit
    async fn restart(&self, name: &str, graceful_timeout: Duration) -> Result<(), ContainerError>;

    /// Stop the named container, allowing `graceful_timeout` for exit
    async fn stop(&self, name: &str, graceful_timeout: Duration) -> Result<(), ContainerError>;
}

/// [`ContainerRuntime`] backed by the local Docker API
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect using the environment's Docker defaults (socket or host vars)
    pub fn connect() -> Result<Self, ContainerError> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self { client })
    }

    /// Verify the Docker API answers; failure means restarts will not work
    pub async fn ping(&self) -> Result<(), ContainerError> {
        self.client.ping().await?;
        Ok(())
    }
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn restart(&self, name: &str, graceful_timeout: Duration) -> Result<(), ContainerError> {
        let options = RestartContainerOptions {
            t: graceful_timeout.as_secs() as isize,
        };
        self.client.restart_container(name, Some(options)).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, graceful_timeout: Duration) -> Result<(), ContainerError> {
        let options = StopContainerOptions {
            t: graceful_timeout.as_secs() as i64,
        };
        self.client.stop_container(name, Some(options)).await?;
        Ok(())
    }
}

/// Fans the configured lifecycle action out to every dependent container.
///
/// Each container is acted on independently: a failure is logged and the
/// remaining containers are still processed.
pub struct ContainerNotifier {
    runtime: Arc<dyn ContainerRuntime>,
    containers: Vec<String>,
    action: LifecycleAction,
    graceful_timeout: Duration,
}

impl ContainerNotifier {
    /// Create a notifier over the given runtime and container names
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        containers: Vec<String>,
        action: LifecycleAction,
    ) -> Self {
        Self {
            runtime,
            containers,
            action,
            graceful_timeout: GRACEFUL_EXIT_TIMEOUT,
        }
    }

    /// True when no containers are configured
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Apply the configured action to every container, logging each outcome
    pub async fn notify_all(&self) {
        for name in &self.containers {
            let result = match self.action {
                LifecycleAction::Restart => self.runtime.restart(name, self.graceful_timeout).await,
                LifecycleAction::Stop => self.runtime.stop(name, self.graceful_timeout).await,
            };

            match result {
                Ok(()) => info!(container = %name, action = ?self.action, "container action succeeded"),
                Err(e) => {
                    error!(container = %name, action = ?self.action, error = %e, "container action failed")
                }
            }
        }
    }
}

impl std::fmt::Debug for ContainerNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerNotifier")
            .field("containers", &self.containers)
            .field("action", &self.action)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct ScriptedRuntime {
        seen: Mutex<Vec<(String, &'static str)>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn restart(&self, name: &str, _timeout: Duration) -> Result<(), ContainerError> {
            self.seen.lock().push((name.to_string(), "restart"));
            if self.fail_for.as_deref() == Some(name) {
                return Err(ContainerError::Unavailable("scripted failure".to_string()));
            }
            Ok(())
        }

        async fn stop(&self, name: &str, _timeout: Duration) -> Result<(), ContainerError> {
            self.seen.lock().push((name.to_string(), "stop"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_notify_all_hits_every_container() {
        let runtime = Arc::new(ScriptedRuntime::default());
        let notifier = ContainerNotifier::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            vec!["web".to_string(), "mail".to_string()],
            LifecycleAction::Restart,
        );

        notifier.notify_all().await;

        let seen = runtime.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("web".to_string(), "restart"));
        assert_eq!(seen[1], ("mail".to_string(), "restart"));
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_remaining_containers() {
        let runtime = Arc::new(ScriptedRuntime {
            fail_for: Some("web".to_string()),
            ..Default::default()
        });
        let notifier = ContainerNotifier::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            vec!["web".to_string(), "mail".to_string()],
            LifecycleAction::Restart,
        );

        notifier.notify_all().await;

        assert_eq!(runtime.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_only_mode_never_restarts() {
        let runtime = Arc::new(ScriptedRuntime::default());
        let notifier = ContainerNotifier::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            vec!["web".to_string()],
            LifecycleAction::Stop,
        );

        notifier.notify_all().await;

        let seen = runtime.seen.lock();
        assert_eq!(seen[0], ("web".to_string(), "stop"));
    }
}
