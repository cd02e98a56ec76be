//! The fleet manager: dependency-ordered parallel execution of a group of
//! containers.
//!
//! Grounded on `nagoya/toji.py`'s `Toji`/`TempToji`: `find_sync_groups`
//! (topological layering over `dependency_names()`), the lazily
//! recomputed, dirty-flagged `container_sync_groups` property,
//! `containers_exec` (fan out within a group, join, re-raise first
//! failure), and the reversed ordering used for `stop`/`remove` relative
//! to `init`/`start`. The scoped cleanup-on-exit construct
//! (`TempToji.__enter__`/`__exit__`) is reimplemented as [`ScopedFleet`]
//! per the re-architecture guidance to use an explicit RAII-style type
//! rather than a context manager.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use futures::future::join_all;
use stacked_errors::{Result, StackableErr};
use tracing::{info, warn};

use crate::{
    callbacks::CallbackRegistry,
    container::{Container, ContainerSpec},
    daemon::DaemonClient,
    error::OrchestratorError,
    misc::next_terminal_color,
};

/// A set of container names with no ordering dependency among themselves;
/// every container in one group only depends on containers in earlier
/// groups.
pub type SyncGroup = Vec<String>;

/// A collection of containers plus their derived parallel execution order.
pub struct Fleet {
    containers: BTreeMap<String, Container>,
    sync_groups: Vec<SyncGroup>,
    dirty: bool,
    callbacks: Arc<CallbackRegistry>,
}

impl Fleet {
    pub fn new() -> Self {
        Self {
            containers: BTreeMap::new(),
            sync_groups: Vec::new(),
            dirty: true,
            callbacks: Arc::new(CallbackRegistry::new()),
        }
    }

    /// A fleet whose containers resolve qualified callbacks against
    /// `callbacks` (in addition to the fixed built-in set every fleet
    /// accepts).
    pub fn with_callback_registry(callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            callbacks,
            ..Self::new()
        }
    }

    /// Adds a container, marking the sync-group cache dirty so it is
    /// recomputed on next use (mirrors the original's dirty-flag
    /// invalidation on `container()`). Every callback declared on `spec`
    /// must already have been validated against this fleet's
    /// [`CallbackRegistry`] by the caller (config parsing does this once,
    /// at fleet-construction time, per spec.md §9).
    pub fn add(&mut self, spec: ContainerSpec, daemon: Arc<dyn DaemonClient>) {
        let name = spec.name.clone();
        self.containers.insert(
            name,
            Container::with_callbacks(spec, daemon, self.callbacks.clone()),
        );
        self.dirty = true;
    }

    pub fn get(&self, name: &str) -> Option<&Container> {
        self.containers.get(name)
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    /// Dependency-ordered parallel execution groups, computed via Kahn's
    /// algorithm over [`ContainerSpec::dependency_names`] and cached until
    /// the next [`Fleet::add`].
    pub fn sync_groups(&mut self) -> Result<&[SyncGroup]> {
        if self.dirty {
            self.sync_groups = Self::find_sync_groups(&self.containers)?;
            self.dirty = false;
        }
        Ok(&self.sync_groups)
    }

    fn find_sync_groups(containers: &BTreeMap<String, Container>) -> Result<Vec<SyncGroup>> {
        let mut remaining_deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, container) in containers {
            let deps: BTreeSet<String> = container
                .spec
                .dependency_names()
                .into_iter()
                .filter(|d| containers.contains_key(d))
                .collect();
            remaining_deps.insert(name.clone(), deps);
        }

        let mut groups = Vec::new();
        let mut placed: BTreeSet<String> = BTreeSet::new();
        while placed.len() < containers.len() {
            let ready: Vec<String> = remaining_deps
                .iter()
                .filter(|(name, deps)| !placed.contains(*name) && deps.is_subset(&placed))
                .map(|(name, _)| name.clone())
                .collect();
            if ready.is_empty() {
                let members: Vec<String> = containers
                    .keys()
                    .filter(|n| !placed.contains(*n))
                    .cloned()
                    .collect();
                return Err(OrchestratorError::Cycle { members })
                    .stack_err_locationless("Fleet::find_sync_groups -> dependency cycle");
            }
            for name in &ready {
                placed.insert(name.clone());
            }
            groups.push(ready);
        }
        Ok(groups)
    }

    /// Runs `f` against every container in a group concurrently, across
    /// groups in order. Within a failing group, every in-flight container
    /// is allowed to finish (no preemption) and every failure in that group
    /// is collected; once a group has any failure, no further group is
    /// started (spec.md §4.4/§5 — a failure stops the fleet at the next
    /// group boundary, it does not cancel in-flight work). `reverse` runs
    /// the groups (but not the within-group concurrency) in reverse order,
    /// for `stop`/`remove`.
    async fn containers_exec<F>(&mut self, reverse: bool, f: F) -> Result<()>
    where
        F: for<'c> Fn(&'c Container) -> BoxFut<'c> + Sync,
    {
        let mut groups = self.sync_groups()?.to_vec();
        if reverse {
            groups.reverse();
        }

        let containers = &self.containers;
        let mut failures: Vec<(String, stacked_errors::Error)> = Vec::new();
        let mut successes = 0usize;
        for group in &groups {
            let _color = next_terminal_color();
            let futs = group.iter().map(|name| {
                let container = containers.get(name).expect("name came from this fleet");
                f(container)
            });
            let results = join_all(futs).await;
            for (name, res) in group.iter().zip(results) {
                match res {
                    Ok(()) => successes += 1,
                    Err(e) => failures.push((name.clone(), e)),
                }
            }
            if !failures.is_empty() {
                break;
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            let mut logs = std::collections::BTreeMap::new();
            for (name, _) in &failures {
                if let Some(container) = self.containers.get(name) {
                    if let Ok(l) = container.logs_best_effort().await {
                        logs.insert(name.clone(), l);
                    }
                }
            }
            Err(OrchestratorError::Aggregate {
                failures,
                successes,
                logs,
            })
            .stack_err_locationless("Fleet::containers_exec -> one or more containers failed")
        }
    }

    pub async fn init_containers(&mut self) -> Result<()> {
        info!("initializing fleet of {} containers", self.len());
        self.containers_exec(false, |c| Box::pin(c.init())).await
    }

    pub async fn start_containers(&mut self) -> Result<()> {
        self.containers_exec(false, |c| Box::pin(c.start())).await
    }

    pub async fn stop_containers(&mut self, timeout: Duration) -> Result<()> {
        self.containers_exec(true, move |c| Box::pin(c.stop(timeout, true))).await
    }

    pub async fn remove_containers(&mut self) -> Result<()> {
        self.containers_exec(true, |c| Box::pin(c.remove(true))).await
    }
}

impl Default for Fleet {
    fn default() -> Self {
        Self::new()
    }
}

type BoxFut<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

/// Cleanup behavior applied when a [`ScopedFleet`] goes out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    Nothing,
    Stop,
    Remove,
}

/// A fleet that performs its [`CleanupPolicy`] when explicitly closed,
/// mirroring `TempToji`'s `__enter__`/`__exit__` pair as an explicit
/// method rather than an implicit destructor (container cleanup is async
/// and fallible, so it cannot live in a synchronous `Drop`).
pub struct ScopedFleet {
    pub fleet: Fleet,
    pub cleanup: CleanupPolicy,
    closed: bool,
}

impl ScopedFleet {
    pub fn new(fleet: Fleet, cleanup: CleanupPolicy) -> Self {
        Self {
            fleet,
            cleanup,
            closed: false,
        }
    }

    /// Runs the fleet (`init_containers`), then on any exit path (success
    /// or error) applies the configured cleanup policy exactly once.
    pub async fn run<F, Fut, T>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Fleet) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let result = body(&mut self.fleet).await;
        self.close().await?;
        result
    }

    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.cleanup {
            CleanupPolicy::Nothing => Ok(()),
            CleanupPolicy::Stop => self.fleet.stop_containers(Duration::from_secs(20)).await,
            CleanupPolicy::Remove => {
                self.fleet.stop_containers(Duration::from_secs(20)).await?;
                self.fleet.remove_containers().await
            }
        }
    }
}

impl Drop for ScopedFleet {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "ScopedFleet dropped without close() being called; {} containers may be left \
                 running",
                self.fleet.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        container::{ContainerSpec, NetworkLink},
        daemon::{FakeContainerScript, FakeDaemonClient, FakeScript},
    };

    /// `root` depends on `dep`, so they land in separate sync-groups. When
    /// `dep`'s group fails, `root`'s group must never start at all.
    #[tokio::test]
    async fn failure_in_earlier_group_stops_later_groups_from_starting() {
        let mut script = FakeScript::default();
        script.containers.insert(
            "dep".to_owned(),
            FakeContainerScript {
                fail_create: Some("boom".to_owned()),
                ..Default::default()
            },
        );
        script.containers.insert("root".to_owned(), FakeContainerScript::default());
        let daemon = Arc::new(FakeDaemonClient::new(script));

        let mut fleet = Fleet::new();
        fleet.add(ContainerSpec::new("dep", "img"), daemon.clone());
        let mut root = ContainerSpec::new("root", "img");
        root.links.push(NetworkLink {
            container_name: "dep".to_owned(),
            alias: "dep".to_owned(),
        });
        fleet.add(root, daemon.clone());

        let groups = fleet.sync_groups().unwrap().to_vec();
        assert_eq!(groups, vec![vec!["dep".to_owned()], vec!["root".to_owned()]]);

        let result = fleet.init_containers().await;
        assert!(result.is_err());

        let log = daemon.call_log.lock().unwrap();
        assert!(
            !log.iter().any(|e| e.contains("root")),
            "root's group must never have started: {log:?}"
        );
    }
}
