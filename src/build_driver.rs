//! The Container-System Build Driver: runs a temporary multi-container
//! fleet to build one or more images, either by committing a finished
//! container's writable layer or by extracting a container's declared
//! volumes through a sidecar and rebuilding them into a fresh image.
//!
//! Grounded on `nagoya/buildcsys.py`'s `BuildContainerSystem`:
//! `init_containers` → wait on the root container with `error_ok=false` →
//! `stop_containers`, then a commit loop and a persist loop (the latter
//! launching a `busybox`-style sidecar bound to the persist container's
//! volumes via `--volumes-from`, taring them to a host-mounted directory,
//! then handing the archive to the Build Context Assembler).

use std::{collections::BTreeMap, sync::Arc};

use stacked_errors::{Result, StackableErr};
use tracing::info;

use crate::{
    build_context::BuildContextAssembler,
    callbacks::CallbackRegistry,
    config::{ContainerSystemImageSpec, DirSpec, FleetConfigFile},
    container::{ContainerSpec, VolumeFromLink, VolumeFromMode, VolumeLink},
    daemon::DaemonClient,
    fleet::{CleanupPolicy, Fleet, ScopedFleet},
    temp_dir::TempResourceDirectory,
};

/// The sidecar's mount point for the host-side extraction directory.
const SIDECAR_WORKDIR: &str = "/WORK";
const EXTRACT_TAR_NAME: &str = "extract.tar";

/// The minimal image used to run the volume-extraction sidecar. Any image
/// with a `tar` binary on `PATH` works; `busybox` is the smallest common
/// choice and what the original implementation used.
const EXTRACTION_IMAGE: &str = "busybox";

/// What a container-system build produced.
#[derive(Debug, Clone, Default)]
pub struct BuildDriverOutcome {
    /// Destination image names produced via `commit`.
    pub committed: Vec<String>,
    /// `(destination image name, built image id)` produced via `persist`.
    pub persisted: Vec<(String, String)>,
}

/// Builds a container-system image spec to completion: runs its fleet,
/// waits on the root container, tears the fleet down, then performs every
/// declared commit and persist derivation.
pub async fn run_container_system_build(
    daemon: Arc<dyn DaemonClient>,
    callbacks: Arc<CallbackRegistry>,
    fleet_cfg: &FleetConfigFile,
    spec: &ContainerSystemImageSpec,
    quiet: bool,
) -> Result<BuildDriverOutcome> {
    let mut container_specs: BTreeMap<String, ContainerSpec> = BTreeMap::new();
    for (name, c) in &fleet_cfg.containers {
        let mut cs = ContainerSpec::new(name.clone(), c.image.clone());
        cs.detach = c.detach;
        cs.run_once = c.run_once;
        cs.volumes = c.volumes.clone();
        cs.volumes_from = c.volumes_from.clone();
        cs.links = c.links.clone();
        cs.entrypoint = c.entrypoint.clone();
        cs.working_dir = c.working_dir.clone();
        cs.callbacks = c.callbacks.clone();
        for callspec in &cs.callbacks {
            callbacks
                .validate(&callspec.callback)
                .stack_err_with_locationless(|| format!("container {name:?} callback"))?;
        }
        container_specs.insert(name.clone(), cs);
    }

    let root_name = container_specs
        .iter()
        .find(|(_, c)| c.image == spec.root)
        .map(|(name, _)| name.clone())
        .stack_err_with_locationless(|| {
            format!(
                "run_container_system_build -> no container in the fleet configuration has image \
                 {:?} (the designated root)",
                spec.root
            )
        })?;

    // Temp directories backing volume-included resources, one per
    // (container, destination directory) pair so colliding basenames across
    // different containers (or different directories on the same
    // container) never collide with each other (spec.md §4.2).
    let mut temp_dirs: BTreeMap<(String, String), TempResourceDirectory> = BTreeMap::new();

    if let Some(entrypoint) = &spec.entrypoint {
        volume_include_into(&mut temp_dirs, &mut container_specs, &root_name, entrypoint, true)
            .await
            .stack_err_with_locationless(|| {
                format!("run_container_system_build -> root {root_name:?} entrypoint")
            })?;
        let root = container_specs.get_mut(&root_name).expect("root present");
        root.working_dir = Some(entrypoint.dest_dir.clone());
        root.entrypoint = Some(vec![entrypoint.dest_path.clone()]);
    }

    for lib in &spec.libs {
        volume_include_into(&mut temp_dirs, &mut container_specs, &root_name, lib, false)
            .await
            .stack_err_with_locationless(|| {
                format!("run_container_system_build -> root {root_name:?} libs")
            })?;
    }

    let mut fleet = Fleet::with_callback_registry(callbacks.clone());
    for (_, cs) in container_specs {
        fleet.add(cs, daemon.clone());
    }

    let mut scoped = ScopedFleet::new(fleet, CleanupPolicy::Remove);
    let root_name_for_wait = root_name.clone();
    scoped
        .run(move |fleet| {
            let root_name = root_name_for_wait.clone();
            async move {
                info!("running container system, root={root_name:?}");
                fleet.init_containers().await?;
                fleet
                    .get(&root_name)
                    .expect("root was just added to this fleet")
                    .wait(false)
                    .await
                    .stack_err_with_locationless(|| format!("root container {root_name:?}"))?;
                fleet.stop_containers(std::time::Duration::from_secs(20)).await
            }
        })
        .await
        .stack_err_locationless("run_container_system_build -> running the container system")?;

    let mut outcome = BuildDriverOutcome::default();

    for (container_name, dest_image) in &spec.commits {
        info!("committing {container_name:?} -> {dest_image:?}");
        daemon
            .commit_container(container_name, dest_image)
            .await
            .stack_err_with_locationless(|| format!("commit {container_name:?} -> {dest_image:?}"))?;
        outcome.committed.push(dest_image.clone());
    }

    for (container_name, dest_image) in &spec.persists {
        let image_id = persist_one(daemon.clone(), callbacks.clone(), container_name, dest_image, quiet)
            .await
            .stack_err_with_locationless(|| format!("persist {container_name:?} -> {dest_image:?}"))?;
        outcome.persisted.push((dest_image.clone(), image_id));
    }

    Ok(outcome)
}

/// Volume-includes `dir_spec`'s source into the temp directory keyed by
/// `(container_name, dir_spec.dest_dir)`, creating it (and binding it into
/// `container_name`'s volumes) on first use for that key.
async fn volume_include_into(
    temp_dirs: &mut BTreeMap<(String, String), TempResourceDirectory>,
    container_specs: &mut BTreeMap<String, ContainerSpec>,
    container_name: &str,
    dir_spec: &DirSpec,
    executable: bool,
) -> Result<()> {
    let key = (container_name.to_owned(), dir_spec.dest_dir.clone());
    if !temp_dirs.contains_key(&key) {
        let tmp = TempResourceDirectory::new()
            .await
            .stack_err_locationless("volume_include_into -> TempResourceDirectory::new")?;
        let container = container_specs
            .get_mut(container_name)
            .stack_err_with_locationless(|| format!("volume_include_into -> unknown container {container_name:?}"))?;
        container
            .volumes
            .push(VolumeLink::bind(tmp.path().to_owned(), dir_spec.dest_dir.clone()));
        temp_dirs.insert(key.clone(), tmp);
    }
    let basename = dir_spec
        .src_path
        .file_name()
        .stack_err_with_locationless(|| {
            format!("volume_include_into({:?}) -> source has no basename", dir_spec.src_path)
        })?
        .to_owned();
    let tmp = temp_dirs.get_mut(&key).expect("inserted above");
    tmp.include(&dir_spec.src_path, basename, executable)
        .await
        .stack_err_with_locationless(|| format!("volume_include_into({:?})", dir_spec.src_path))
}

/// Extracts `container_name`'s declared volumes via a sidecar `tar`
/// container and rebuilds them into `dest_image`, based on
/// `container_name`'s own image. Returns the built image's id.
async fn persist_one(
    daemon: Arc<dyn DaemonClient>,
    callbacks: Arc<CallbackRegistry>,
    container_name: &str,
    dest_image: &str,
    quiet: bool,
) -> Result<String> {
    let inspect = daemon
        .inspect_container(container_name)
        .await
        .stack_err_with_locationless(|| format!("persist_one -> inspect {container_name:?}"))?;

    let tar_path = format!("{SIDECAR_WORKDIR}/{EXTRACT_TAR_NAME}");
    let stripped_paths: Vec<String> = inspect
        .volumes
        .keys()
        .map(|p| p.trim_start_matches('/').to_owned())
        .collect();
    let mut tar_cmd = vec!["tar".to_owned(), "-cf".to_owned(), tar_path.clone()];
    tar_cmd.extend(stripped_paths);

    let host_dir = TempResourceDirectory::new()
        .await
        .stack_err_locationless("persist_one -> TempResourceDirectory::new")?;

    let mut sidecar = ContainerSpec::temp(EXTRACTION_IMAGE);
    sidecar.detach = false;
    sidecar.volumes.push(VolumeLink::bind(host_dir.path().to_owned(), SIDECAR_WORKDIR));
    sidecar.volumes_from.push(VolumeFromLink {
        container_name: container_name.to_owned(),
        mode: VolumeFromMode::ReadOnly,
    });
    sidecar.entrypoint = Some(tar_cmd);
    let sidecar_name = sidecar.name.clone();

    let mut extraction_fleet = Fleet::with_callback_registry(callbacks);
    extraction_fleet.add(sidecar, daemon.clone());
    let mut scoped = ScopedFleet::new(extraction_fleet, CleanupPolicy::Remove);
    scoped
        .run(move |fleet| {
            let sidecar_name = sidecar_name.clone();
            async move {
                fleet.init_containers().await?;
                fleet
                    .get(&sidecar_name)
                    .expect("sidecar was just added to this fleet")
                    .wait(false)
                    .await
            }
        })
        .await
        .stack_err_locationless("persist_one -> running the extraction sidecar")?;

    let tar_bytes = tokio::fs::read(host_dir.path().join(EXTRACT_TAR_NAME))
        .await
        .stack_err_locationless("persist_one -> reading produced archive")?;
    host_dir
        .cleanup()
        .await
        .stack_err_locationless("persist_one -> cleaning up extraction host directory")?;

    let mut ctx = BuildContextAssembler::new(daemon, inspect.image.clone())
        .await
        .stack_err_locationless("persist_one -> BuildContextAssembler::new")?;
    ctx.include_tar(&tar_bytes, EXTRACT_TAR_NAME, "/")
        .await
        .stack_err_locationless("persist_one -> include_tar")?;
    ctx.build(dest_image, quiet)
        .await
        .stack_err_with_locationless(|| format!("persist_one -> build({dest_image:?})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{parse_fleet_config, parse_ini},
        daemon::{FakeDaemonClient, FakeScript},
    };

    #[tokio::test]
    async fn two_container_system_identifies_root_and_runs_to_completion() {
        let text = "[root]\nimage = alpha\nlinks = dep:dep\n\n[dep]\nimage = beta\n";
        let raw = parse_ini(text).unwrap();
        let fleet_cfg = parse_fleet_config(&raw).unwrap();
        let spec = ContainerSystemImageSpec {
            root: "alpha".to_owned(),
            ..Default::default()
        };
        let daemon: Arc<dyn DaemonClient> = Arc::new(FakeDaemonClient::new(FakeScript::default()));
        let callbacks = Arc::new(CallbackRegistry::new());
        let outcome = run_container_system_build(daemon, callbacks, &fleet_cfg, &spec, true)
            .await
            .unwrap();
        assert!(outcome.committed.is_empty());
        assert!(outcome.persisted.is_empty());
    }

    #[tokio::test]
    async fn commit_derivation_invokes_daemon_commit() {
        let text = "[root]\nimage = alpha\n";
        let raw = parse_ini(text).unwrap();
        let fleet_cfg = parse_fleet_config(&raw).unwrap();
        let spec = ContainerSystemImageSpec {
            root: "alpha".to_owned(),
            commits: vec![("root".to_owned(), "image:final".to_owned())],
            ..Default::default()
        };
        let daemon = Arc::new(FakeDaemonClient::new(FakeScript::default()));
        let call_log = daemon.call_log.clone();
        let callbacks = Arc::new(CallbackRegistry::new());
        let outcome = run_container_system_build(daemon, callbacks, &fleet_cfg, &spec, true)
            .await
            .unwrap();
        assert_eq!(outcome.committed, vec!["image:final".to_owned()]);
        assert!(call_log.lock().unwrap().iter().any(|l| l == "commit:root->image:final"));
    }

    #[tokio::test]
    async fn missing_root_image_is_a_configuration_error() {
        let text = "[root]\nimage = alpha\n";
        let raw = parse_ini(text).unwrap();
        let fleet_cfg = parse_fleet_config(&raw).unwrap();
        let spec = ContainerSystemImageSpec {
            root: "does-not-exist".to_owned(),
            ..Default::default()
        };
        let daemon: Arc<dyn DaemonClient> = Arc::new(FakeDaemonClient::new(FakeScript::default()));
        let callbacks = Arc::new(CallbackRegistry::new());
        let res = run_container_system_build(daemon, callbacks, &fleet_cfg, &spec, true).await;
        assert!(res.is_err());
    }
}
