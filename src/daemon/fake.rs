//! An in-memory [`DaemonClient`] used by this crate's own test suite so
//! fleet scheduling, container lifecycle, and build-context logic can be
//! exercised without a live daemon. Grounded on `get2knowio-deacon`'s
//! pattern of giving the `Docker` trait a test double alongside its real
//! implementation.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use stacked_errors::{bail_locationless, Result};
use tokio::time::sleep;

use super::{
    BuildImageOptions, BuildOutcome, ContainerInspect, CreateContainerRequest, DaemonClient,
    ImageInspect,
};

/// Per-container scripted behavior for [`FakeDaemonClient`].
#[derive(Debug, Clone, Default)]
pub struct FakeContainerScript {
    /// Delay applied inside `create_container`/`start_container`, used to
    /// assert that sync-groups actually run concurrently.
    pub start_delay: Duration,
    /// Exit code `wait_container` reports.
    pub exit_code: i64,
    /// If set, `create_container` fails with this message instead of
    /// succeeding.
    pub fail_create: Option<String>,
    /// If set, `stop` (kill) never actually completes the container, used
    /// to exercise the stop-timeout/SIGKILL escalation path.
    pub ignores_sigterm: bool,
}

/// The full scripted behavior of a fake daemon.
#[derive(Debug, Clone, Default)]
pub struct FakeScript {
    pub containers: BTreeMap<String, FakeContainerScript>,
    pub build_outcome: Option<BuildOutcome>,
    /// `image_id -> repo_tags`, consulted by `inspect_image`; images not
    /// present here are reported untagged (`["<none>:<none>"]`).
    pub images: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default)]
struct ContainerState {
    created: bool,
    running: bool,
    exited: bool,
    exit_code: i64,
    started_at: String,
    kill_signals_received: Vec<String>,
    image: String,
    volumes: BTreeMap<String, String>,
}

pub struct FakeDaemonClient {
    script: FakeScript,
    state: Mutex<BTreeMap<String, ContainerState>>,
    /// Every call is appended here in order, so tests can assert on
    /// relative scheduling without relying on wall-clock timing alone.
    pub call_log: Arc<Mutex<Vec<String>>>,
}

impl FakeDaemonClient {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            state: Mutex::new(BTreeMap::new()),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn log(&self, event: impl Into<String>) {
        self.call_log.lock().unwrap().push(event.into());
    }

    fn script_for(&self, name: &str) -> FakeContainerScript {
        self.script.containers.get(name).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DaemonClient for FakeDaemonClient {
    async fn create_container(&self, req: &CreateContainerRequest) -> Result<()> {
        self.log(format!("create:{}", req.name));
        let script = self.script_for(&req.name);
        if let Some(msg) = &script.fail_create {
            bail_locationless!("fake create_container({:?}) scripted failure: {msg}", req.name)
        }
        sleep(script.start_delay).await;
        let volumes = req
            .volumes
            .iter()
            .map(|v| {
                (
                    v.container_path.clone(),
                    v.host_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                )
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .insert(req.name.clone(), ContainerState {
                created: true,
                started_at: "0001-01-01T00:00:00Z".to_owned(),
                image: req.image.clone(),
                volumes,
                ..Default::default()
            });
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.log(format!("start:{name}"));
        let script = self.script_for(name);
        sleep(script.start_delay).await;
        let mut guard = self.state.lock().unwrap();
        let st = guard
            .get_mut(name)
            .ok_or_else(|| stacked_errors::Error::from(format!("fake: {name} not created")))?;
        st.running = true;
        st.started_at = "2024-01-01T00:00:00Z".to_owned();
        if script.ignores_sigterm {
            // long-running service; only a direct "kill -9" (handled in kill_container)
            // actually stops it
        } else {
            // `run_once` containers in this fake exit immediately on their own
            st.running = false;
            st.exited = true;
            st.exit_code = script.exit_code;
        }
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect> {
        let guard = self.state.lock().unwrap();
        match guard.get(name) {
            Some(st) => Ok(ContainerInspect {
                running: st.running,
                pid: if st.running { 1234 } else { 0 },
                started_at: st.started_at.clone(),
                exit_code: if st.exited { Some(st.exit_code) } else { None },
                volumes: st.volumes.clone(),
                image: st.image.clone(),
            }),
            None => Ok(ContainerInspect::default()),
        }
    }

    async fn wait_container(&self, name: &str) -> Result<i64> {
        self.log(format!("wait:{name}"));
        loop {
            {
                let guard = self.state.lock().unwrap();
                if let Some(st) = guard.get(name) {
                    if st.exited {
                        return Ok(st.exit_code);
                    }
                }
            }
            sleep(Duration::from_millis(1)).await;
        }
    }

    async fn kill_container(&self, name: &str, signal: &str) -> Result<()> {
        self.log(format!("kill:{name}:{signal}"));
        let script = self.script_for(name);
        let mut guard = self.state.lock().unwrap();
        if let Some(st) = guard.get_mut(name) {
            st.kill_signals_received.push(signal.to_owned());
            if signal == "SIGKILL" || !script.ignores_sigterm {
                st.running = false;
                st.exited = true;
                st.exit_code = -1;
            }
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str, not_exists_ok: bool) -> Result<()> {
        self.log(format!("remove:{name}"));
        let mut guard = self.state.lock().unwrap();
        if guard.remove(name).is_none() && !not_exists_ok {
            bail_locationless!("fake remove_container({name:?}) -> does not exist")
        }
        Ok(())
    }

    async fn container_logs(&self, name: &str) -> Result<String> {
        Ok(format!("fake logs for {name}"))
    }

    async fn commit_container(&self, name: &str, dest_image: &str) -> Result<()> {
        self.log(format!("commit:{name}->{dest_image}"));
        Ok(())
    }

    async fn build_image(&self, _tarball: Vec<u8>, _opts: &BuildImageOptions) -> Result<BuildOutcome> {
        self.log("build_image".to_owned());
        Ok(self.script.build_outcome.clone().unwrap_or(BuildOutcome::Built {
            image_id: "sha256:fake".to_owned(),
        }))
    }

    async fn inspect_image(&self, image_id: &str) -> Result<ImageInspect> {
        self.log(format!("inspect_image:{image_id}"));
        let repo_tags = self
            .script
            .images
            .get(image_id)
            .cloned()
            .unwrap_or_else(|| vec!["<none>:<none>".to_owned()]);
        Ok(ImageInspect { repo_tags })
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        self.log(format!("remove_image:{image_id}"));
        Ok(())
    }
}
