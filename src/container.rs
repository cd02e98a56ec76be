//! Container descriptor and handle: the data needed to create a container,
//! and the lifecycle operations (`init`, `stop`, `remove`, `wait`) that
//! drive it through the daemon.
//!
//! Grounded on `nagoya/docker/container.py`'s `Container` class: the
//! `VolumeLink`/`VolumeFromLink`/`NetworkLink` value types, the
//! `Callspec` callback-coordinate grammar, and the `init = create + start`,
//! `stop = SIGTERM, wait, SIGKILL on timeout` lifecycle choreography.

use std::{path::PathBuf, sync::Arc, time::Duration};

use stacked_errors::{bail_locationless, Result, StackableErr};
use tracing::{debug, error, info, warn};

use crate::{
    callbacks::CallbackRegistry,
    daemon::{ContainerInspect, CreateContainerRequest, DaemonClient},
    error::OrchestratorError,
    misc::random_name,
};

/// A bind mount: `host_path` mounted at `container_path`, or an anonymous
/// volume when `host_path` is `None` (the original's `VolumeLink.from_text`
/// accepts a lone container path with no `:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLink {
    pub host_path: Option<PathBuf>,
    pub container_path: String,
}

impl VolumeLink {
    pub fn bind(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: Some(host_path.into()),
            container_path: container_path.into(),
        }
    }

    pub fn anonymous(container_path: impl Into<String>) -> Self {
        Self {
            host_path: None,
            container_path: container_path.into(),
        }
    }

    /// Parses `"host:container"` or a lone `"container"` path.
    pub fn from_text(text: &str) -> Result<Self> {
        match text.split_once(':') {
            Some((host, container)) if !host.is_empty() => Ok(Self::bind(host, container)),
            _ => Ok(Self::anonymous(text)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeFromMode {
    ReadOnly,
    ReadWrite,
}

impl VolumeFromMode {
    pub fn as_flag(self) -> &'static str {
        match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeFromLink {
    pub container_name: String,
    pub mode: VolumeFromMode,
}

impl VolumeFromLink {
    /// Parses `"CONTAINER:MODE"` where `MODE` is `ro` or `rw`.
    pub fn from_text(text: &str) -> Result<Self> {
        let (name, mode) = text.split_once(':').stack_err_with_locationless(|| {
            format!("VolumeFromLink::from_text({text:?}) -> missing ':' separating container from mode")
        })?;
        let mode = match mode {
            "ro" => VolumeFromMode::ReadOnly,
            "rw" => VolumeFromMode::ReadWrite,
            other => bail_locationless!(
                "VolumeFromLink::from_text({text:?}) -> unknown mode {other:?}, expected 'ro' or 'rw'"
            ),
        };
        Ok(Self {
            container_name: name.to_owned(),
            mode,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkLink {
    pub container_name: String,
    pub alias: String,
}

impl NetworkLink {
    /// Parses `"CONTAINER:ALIAS"`.
    pub fn from_text(text: &str) -> Result<Self> {
        let (name, alias) = text.split_once(':').stack_err_with_locationless(|| {
            format!("NetworkLink::from_text({text:?}) -> missing ':' separating container from alias")
        })?;
        Ok(Self {
            container_name: name.to_owned(),
            alias: alias.to_owned(),
        })
    }
}

/// When a callback fires relative to its event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPart {
    Pre,
    Post,
}

/// Which lifecycle transition a callback is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Init,
    Create,
    Start,
    Stop,
    Remove,
}

/// Built-in callbacks this crate ships, since it cannot dynamically load
/// arbitrary code the way the original's `module.function` coordinates
/// could. Additional callbacks are supplied by the embedding application
/// through a fixed registry (see [`crate::fleet::CallbackRegistry`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinCallback {
    /// Logs the container's running state after start, mirroring the
    /// original's `show_network` built-in.
    ShowNetwork,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackRef {
    Builtin(BuiltinCallback),
    Qualified { module: String, function: String },
}

/// A coordinate binding a callback to a specific event part/event.
/// Grammar: `event_part_event:module.function` or an unqualified built-in
/// name; names starting with `_` are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callspec {
    pub event_part: EventPart,
    pub event: Event,
    pub callback: CallbackRef,
}

impl Callspec {
    /// Parses `"event_part_event:module.function"` or
    /// `"event_part_event:built_in_name"`.
    pub fn parse(text: &str) -> Result<Self> {
        let (coordinate, callback_text) = text.split_once(':').stack_err_with_locationless(|| {
            format!("Callspec::parse({text:?}) -> missing ':' separating coordinate from callback")
        })?;
        let (event_part_str, event_str) = coordinate
            .split_once('_')
            .stack_err_with_locationless(|| {
                format!("Callspec::parse({text:?}) -> missing '_' in event coordinate")
            })?;
        let event_part = match event_part_str {
            "pre" => EventPart::Pre,
            "post" => EventPart::Post,
            other => bail_locationless!("Callspec::parse({text:?}) -> unknown event part {other:?}"),
        };
        let event = match event_str {
            "init" => Event::Init,
            "create" => Event::Create,
            "start" => Event::Start,
            "stop" => Event::Stop,
            "remove" => Event::Remove,
            other => bail_locationless!("Callspec::parse({text:?}) -> unknown event {other:?}"),
        };

        let callback = match callback_text.rsplit_once('.') {
            Some((module, function)) => {
                if function.starts_with('_') {
                    bail_locationless!(
                        "Callspec::parse({text:?}) -> callback name cannot start with '_'"
                    )
                }
                CallbackRef::Qualified {
                    module: module.to_owned(),
                    function: function.to_owned(),
                }
            }
            None => {
                if callback_text.starts_with('_') {
                    bail_locationless!(
                        "Callspec::parse({text:?}) -> built-in name cannot start with '_'"
                    )
                }
                match callback_text {
                    "show_network" => CallbackRef::Builtin(BuiltinCallback::ShowNetwork),
                    other => bail_locationless!(
                        "Callspec::parse({text:?}) -> unknown built-in callback {other:?}"
                    ),
                }
            }
        };
        Ok(Self {
            event_part,
            event,
            callback,
        })
    }
}

/// Everything needed to create and lifecycle a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub detach: bool,
    pub run_once: bool,
    pub volumes: Vec<VolumeLink>,
    pub volumes_from: Vec<VolumeFromLink>,
    pub links: Vec<NetworkLink>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub callbacks: Vec<Callspec>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            detach: true,
            run_once: false,
            volumes: Vec::new(),
            volumes_from: Vec::new(),
            links: Vec::new(),
            entrypoint: None,
            working_dir: None,
            callbacks: Vec::new(),
        }
    }

    /// A name-less, disposable container (mirrors the original's
    /// `TempContainer`, modeled here as a constructor rather than a
    /// subclass).
    pub fn temp(image: impl Into<String>) -> Self {
        let image = image.into();
        let name = format!("{image}.{}", &random_name("")[1..]);
        Self::new(name, image)
    }

    /// Every container name this one depends on: link targets plus
    /// volumes-from targets, deduplicated.
    pub fn dependency_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .links
            .iter()
            .map(|l| l.container_name.clone())
            .chain(self.volumes_from.iter().map(|v| v.container_name.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// The observable lifecycle state of a container on the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Absent,
    Created,
    Running,
    Exited,
}

/// A live handle onto a container, bound to the daemon client it was
/// created through.
pub struct Container {
    pub spec: ContainerSpec,
    daemon: Arc<dyn DaemonClient>,
    callbacks: Arc<CallbackRegistry>,
}

impl Container {
    pub fn new(spec: ContainerSpec, daemon: Arc<dyn DaemonClient>) -> Self {
        Self::with_callbacks(spec, daemon, Arc::new(CallbackRegistry::new()))
    }

    pub fn with_callbacks(
        spec: ContainerSpec,
        daemon: Arc<dyn DaemonClient>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        Self {
            spec,
            daemon,
            callbacks,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Invokes every callback declared for `(event_part, event)`, in
    /// declaration order. A callback failure propagates as the failure of
    /// the enclosing operation, matching the original's
    /// `_process_callbacks`.
    async fn run_callbacks(&self, event_part: EventPart, event: Event) -> Result<()> {
        for callspec in &self.spec.callbacks {
            if callspec.event_part == event_part && callspec.event == event {
                self.callbacks
                    .invoke(&callspec.callback, self)
                    .await
                    .stack_err_with_locationless(|| {
                        format!(
                            "Container {:?} callback for {event_part:?}/{event:?}",
                            self.spec.name
                        )
                    })?;
            }
        }
        Ok(())
    }

    /// Best-effort inspect, used by built-in callbacks that shouldn't mask
    /// the operation they're attached to on a transient inspect failure.
    pub async fn inspect_best_effort(&self) -> Result<ContainerInspect> {
        self.daemon.inspect_container(&self.spec.name).await
    }

    pub async fn state(&self) -> Result<LifecycleState> {
        let inspect = self
            .daemon
            .inspect_container(&self.spec.name)
            .await
            .stack_err_with_locationless(|| format!("Container::state({:?})", self.spec.name))?;
        Ok(if inspect.exit_code.is_some() {
            LifecycleState::Exited
        } else if inspect.running {
            LifecycleState::Running
        } else if inspect.never_started() && inspect.pid == 0 {
            LifecycleState::Created
        } else {
            LifecycleState::Absent
        })
    }

    /// `create` followed by `start`, matching the original's `init()`.
    pub async fn init(&self) -> Result<()> {
        self.run_callbacks(EventPart::Pre, Event::Init).await?;
        self.create(true).await?;
        self.start().await?;
        self.run_callbacks(EventPart::Post, Event::Init).await
    }

    /// Creates the container. Tolerates an already-existing container of
    /// the same name when `exists_ok` is set, mirroring the original's
    /// catch of a 409 from the daemon.
    pub async fn create(&self, exists_ok: bool) -> Result<()> {
        self.run_callbacks(EventPart::Pre, Event::Create).await?;
        debug!("creating container {:?}", self.spec.name);
        let req = CreateContainerRequest {
            name: self.spec.name.clone(),
            image: self.spec.image.clone(),
            entrypoint: self.spec.entrypoint.clone(),
            working_dir: self.spec.working_dir.clone(),
            volumes: self.spec.volumes.clone(),
            volumes_from: self.spec.volumes_from.clone(),
            links: self.spec.links.clone(),
        };
        match self.daemon.create_container(&req).await {
            Ok(()) => {}
            Err(e) if exists_ok => {
                debug!("create_container({:?}) already exists, continuing", self.spec.name);
                let _ = e;
            }
            Err(e) => {
                return Err(e).stack_err_with_locationless(|| {
                    format!("Container::create({:?})", self.spec.name)
                })
            }
        }
        self.run_callbacks(EventPart::Post, Event::Create).await
    }

    /// Starts the container. `run_once` containers that have already run
    /// (per the daemon's start-time sentinel) are left alone. Waits for
    /// completion if the container is not detached.
    pub async fn start(&self) -> Result<()> {
        if self.spec.run_once {
            let inspect = self.daemon.inspect_container(&self.spec.name).await.stack_err_with_locationless(|| {
                format!("Container::start({:?})", self.spec.name)
            })?;
            if !inspect.never_started() {
                debug!("container {:?} is run_once and already started, skipping", self.spec.name);
                return Ok(());
            }
        }
        self.run_callbacks(EventPart::Pre, Event::Start).await?;
        info!("starting container {:?}", self.spec.name);
        self.daemon
            .start_container(&self.spec.name)
            .await
            .stack_err_with_locationless(|| format!("Container::start({:?})", self.spec.name))?;
        if !self.spec.detach {
            self.wait(false).await?;
        }
        self.run_callbacks(EventPart::Post, Event::Start).await
    }

    /// Blocks for the container's exit, returning an error carrying its
    /// logs if it exited non-zero and `error_ok` is false.
    pub async fn wait(&self, error_ok: bool) -> Result<i64> {
        let code = self
            .daemon
            .wait_container(&self.spec.name)
            .await
            .stack_err_with_locationless(|| format!("Container::wait({:?})", self.spec.name))?;
        if code != 0 && !error_ok {
            let logs = self
                .daemon
                .container_logs(&self.spec.name)
                .await
                .unwrap_or_else(|_| String::new());
            return Err(OrchestratorError::ContainerExit {
                name: self.spec.name.clone(),
                code,
                logs,
            })
            .stack_err_locationless("Container::wait -> non-zero exit");
        }
        Ok(code)
    }

    /// SIGTERM, wait up to `timeout`, escalate to SIGKILL and wait again;
    /// logs (rather than raises) if the container still won't die.
    /// Tolerates an already-stopped/absent container when `not_exists_ok`
    /// is set.
    pub async fn stop(&self, timeout: Duration, not_exists_ok: bool) -> Result<()> {
        let inspect = match self.daemon.inspect_container(&self.spec.name).await {
            Ok(i) => i,
            Err(e) if not_exists_ok => {
                debug!("stop({:?}) -> container not found, treating as stopped", self.spec.name);
                let _ = e;
                return Ok(());
            }
            Err(e) => return Err(e).stack_err_with_locationless(|| format!("Container::stop({:?})", self.spec.name)),
        };
        if inspect.pid == 0 {
            debug!("stop({:?}) -> already stopped", self.spec.name);
            return Ok(());
        }

        self.run_callbacks(EventPart::Pre, Event::Stop).await?;
        self.daemon
            .kill_container(&self.spec.name, "SIGTERM")
            .await
            .stack_err_with_locationless(|| format!("Container::stop({:?}) SIGTERM", self.spec.name))?;

        if tokio::time::timeout(timeout, self.wait(true)).await.is_ok() {
            return self.run_callbacks(EventPart::Post, Event::Stop).await;
        }

        warn!("container {:?} did not stop after SIGTERM, sending SIGKILL", self.spec.name);
        self.daemon
            .kill_container(&self.spec.name, "SIGKILL")
            .await
            .stack_err_with_locationless(|| format!("Container::stop({:?}) SIGKILL", self.spec.name))?;

        if tokio::time::timeout(timeout, self.wait(true)).await.is_ok() {
            return self.run_callbacks(EventPart::Post, Event::Stop).await;
        }

        // matches the original: log and move on rather than raising, since there is
        // nothing more forceful this crate is willing to do
        let stop_failed = OrchestratorError::StopFailed {
            name: self.spec.name.clone(),
        };
        error!("{stop_failed}");
        Ok(())
    }

    /// Force-removes the container. Tolerates it already being gone when
    /// `not_exists_ok` is set.
    pub async fn remove(&self, not_exists_ok: bool) -> Result<()> {
        self.run_callbacks(EventPart::Pre, Event::Remove).await?;
        self.daemon
            .remove_container(&self.spec.name, not_exists_ok)
            .await
            .stack_err_with_locationless(|| format!("Container::remove({:?})", self.spec.name))?;
        self.run_callbacks(EventPart::Post, Event::Remove).await
    }

    /// Fetches logs, swallowing any error, used only when assembling an
    /// aggregate failure report (a log-fetch failure there shouldn't mask
    /// the real failure being reported).
    pub async fn logs_best_effort(&self) -> Result<String> {
        self.daemon.container_logs(&self.spec.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_link_from_text_bind() {
        let v = VolumeLink::from_text("/host:/container").unwrap();
        assert_eq!(v.host_path.unwrap().to_str().unwrap(), "/host");
        assert_eq!(v.container_path, "/container");
    }

    #[test]
    fn volume_link_from_text_anonymous() {
        let v = VolumeLink::from_text("/container").unwrap();
        assert!(v.host_path.is_none());
        assert_eq!(v.container_path, "/container");
    }

    #[test]
    fn callspec_parses_builtin() {
        let c = Callspec::parse("post_start:show_network").unwrap();
        assert_eq!(c.event_part, EventPart::Post);
        assert_eq!(c.event, Event::Start);
        assert_eq!(c.callback, CallbackRef::Builtin(BuiltinCallback::ShowNetwork));
    }

    #[test]
    fn callspec_parses_qualified() {
        let c = Callspec::parse("pre_stop:mymodule.warn_operators").unwrap();
        assert_eq!(c.event_part, EventPart::Pre);
        assert_eq!(c.event, Event::Stop);
        assert_eq!(c.callback, CallbackRef::Qualified {
            module: "mymodule".into(),
            function: "warn_operators".into(),
        });
    }

    #[test]
    fn callspec_rejects_leading_underscore() {
        assert!(Callspec::parse("pre_stop:mymodule._secret").is_err());
    }

    #[test]
    fn dependency_names_dedup_and_union() {
        let mut spec = ContainerSpec::new("c", "img");
        spec.links.push(NetworkLink { container_name: "a".into(), alias: "a".into() });
        spec.volumes_from.push(VolumeFromLink { container_name: "a".into(), mode: VolumeFromMode::ReadOnly });
        spec.volumes_from.push(VolumeFromLink { container_name: "b".into(), mode: VolumeFromMode::ReadWrite });
        assert_eq!(spec.dependency_names(), vec!["a".to_string(), "b".to_string()]);
    }
}
