//! `dockyard`: the command-line front-end over this crate's library,
//! matching the teacher's own `clap::Parser`-derived example binaries.
//!
//! Grounded on spec.md §6's CLI surface description and expanded in
//! SPEC_FULL.md §4.9: two subcommand groups (`fleet`, `image`), global
//! flags adjusting the `tracing` filter, and `std_init`/`ctrlc_init` wired
//! up exactly as [`dockyard::misc`] documents them.

use std::{collections::BTreeMap, path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use dockyard::{
    build_context::BuildContextAssembler,
    build_driver::run_container_system_build,
    callbacks::CallbackRegistry,
    config::{self, ContainerSystemImageSpec, FleetConfigFile, ImageConfigFile, ImageSpec, RawConfig},
    container::ContainerSpec,
    daemon::{BollardDaemonClient, DaemonClient},
    fleet::Fleet,
    planner,
};
use stacked_errors::{Result, StackableErr};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "dockyard", about = "Container build pipeline orchestration")]
struct Cli {
    /// Fleet or image configuration file, repeatable; later files
    /// override/extend earlier ones by section name.
    #[arg(long = "config", global = true)]
    config: Vec<PathBuf>,

    /// Suppress informational output (raises the default tracing filter
    /// to `warn`).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit debug-level tracing output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress forwarded build stdout during an image build (the build
    /// still fails loudly; only the streamed progress lines are hidden).
    #[arg(long = "quiet-build", global = true)]
    quiet_build: bool,

    /// Additional `K=V` environment assignments applied as `ENV`
    /// instructions on single-image builds, repeatable.
    #[arg(long = "env", global = true)]
    env: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Operate on a fleet configuration file's containers.
    Fleet {
        #[command(subcommand)]
        action: FleetAction,
    },
    /// Build (or clean) images declared in an image configuration file.
    Image {
        #[command(subcommand)]
        action: ImageAction,
    },
}

#[derive(Debug, Subcommand)]
enum FleetAction {
    Init,
    Start,
    Stop,
    Remove,
}

#[derive(Debug, Subcommand)]
enum ImageAction {
    /// Build every image in the configuration, in dependency order.
    All,
    /// Build exactly the named images, in the order given.
    Build {
        #[arg(required = true)]
        images: Vec<String>,
    },
    /// Accepted for surface compatibility; currently a no-op (see
    /// DESIGN.md Open Question on image cleanup).
    Clean,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = dockyard::std_init(cli.quiet, cli.verbose) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = dockyard::ctrlc_init() {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let daemon: Arc<dyn DaemonClient> =
        Arc::new(BollardDaemonClient::connect().stack_err_locationless("run -> connecting to daemon")?);
    let callbacks = Arc::new(CallbackRegistry::new());

    match cli.command {
        Command::Fleet { action } => {
            let fleet_cfg = load_fleet_config(&cli.config).await?;
            run_fleet_action(daemon, callbacks, &fleet_cfg, action).await
        }
        Command::Image { action } => {
            let images = load_image_config(&cli.config).await?;
            run_image_action(daemon, callbacks, &images, action, cli.quiet_build, &cli.env).await
        }
    }
}

async fn load_raw(paths: &[PathBuf]) -> Result<RawConfig> {
    if paths.is_empty() {
        return Err(stacked_errors::Error::from("at least one --config file is required"))
            .stack_err_locationless("load_raw");
    }
    let mut base = config::read_and_parse(&paths[0])
        .await
        .stack_err_with_locationless(|| format!("load_raw({:?})", paths[0]))?;
    for path in &paths[1..] {
        let other = config::read_and_parse(path)
            .await
            .stack_err_with_locationless(|| format!("load_raw({path:?})"))?;
        config::merge_raw(&mut base, other);
    }
    Ok(base)
}

async fn load_fleet_config(paths: &[PathBuf]) -> Result<FleetConfigFile> {
    let raw = load_raw(paths).await?;
    config::parse_fleet_config(&raw).stack_err_locationless("load_fleet_config")
}

async fn load_image_config(paths: &[PathBuf]) -> Result<ImageConfigFile> {
    let raw = load_raw(paths).await?;
    config::parse_image_config(&raw).stack_err_locationless("load_image_config")
}

async fn run_fleet_action(
    daemon: Arc<dyn DaemonClient>,
    callbacks: Arc<CallbackRegistry>,
    fleet_cfg: &FleetConfigFile,
    action: FleetAction,
) -> Result<()> {
    let mut fleet = Fleet::with_callback_registry(callbacks.clone());
    for (name, c) in &fleet_cfg.containers {
        for callspec in &c.callbacks {
            callbacks
                .validate(&callspec.callback)
                .stack_err_with_locationless(|| format!("container {name:?} callback"))?;
        }
        let mut spec = ContainerSpec::new(name.clone(), c.image.clone());
        spec.detach = c.detach;
        spec.run_once = c.run_once;
        spec.volumes = c.volumes.clone();
        spec.volumes_from = c.volumes_from.clone();
        spec.links = c.links.clone();
        spec.entrypoint = c.entrypoint.clone();
        spec.working_dir = c.working_dir.clone();
        spec.callbacks = c.callbacks.clone();
        fleet.add(spec, daemon.clone());
    }

    match action {
        FleetAction::Init => {
            info!("fleet init: {} containers", fleet.len());
            fleet.init_containers().await
        }
        FleetAction::Start => fleet.start_containers().await,
        FleetAction::Stop => fleet.stop_containers(std::time::Duration::from_secs(20)).await,
        FleetAction::Remove => fleet.remove_containers().await,
    }
}

async fn run_image_action(
    daemon: Arc<dyn DaemonClient>,
    callbacks: Arc<CallbackRegistry>,
    images: &ImageConfigFile,
    action: ImageAction,
    quiet_build: bool,
    extra_envs: &[String],
) -> Result<()> {
    let targets = match action {
        ImageAction::All => {
            let fleet_configs = load_referenced_fleet_configs(images).await?;
            let plan = planner::build_plan(images, &fleet_configs, None)
                .stack_err_locationless("run_image_action -> all")?;
            plan.order
        }
        ImageAction::Build { images: names } => names,
        ImageAction::Clean => {
            info!("image clean: no-op");
            return Ok(());
        }
    };

    for name in &targets {
        let spec = images
            .images
            .get(name)
            .stack_err_with_locationless(|| format!("run_image_action -> unknown image {name:?}"))?;
        build_one_image(daemon.clone(), callbacks.clone(), name, spec, quiet_build, extra_envs).await?;
    }
    Ok(())
}

/// Loads every fleet configuration file a container-system image spec
/// references, keyed by the image's own section name, so the Planner can
/// compute its dependency set (SPEC_FULL.md §4.7/Planner grounding).
async fn load_referenced_fleet_configs(images: &ImageConfigFile) -> Result<BTreeMap<String, FleetConfigFile>> {
    let mut out = BTreeMap::new();
    for (name, spec) in &images.images {
        if let ImageSpec::ContainerSystem(cs) = spec {
            let raw = config::read_and_parse(&cs.system)
                .await
                .stack_err_with_locationless(|| format!("image {name:?} -> reading fleet config {:?}", cs.system))?;
            let fleet_cfg = config::parse_fleet_config(&raw)
                .stack_err_with_locationless(|| format!("image {name:?} -> parsing fleet config {:?}", cs.system))?;
            out.insert(name.clone(), fleet_cfg);
        }
    }
    Ok(out)
}

async fn build_one_image(
    daemon: Arc<dyn DaemonClient>,
    callbacks: Arc<CallbackRegistry>,
    name: &str,
    spec: &ImageSpec,
    quiet_build: bool,
    extra_envs: &[String],
) -> Result<()> {
    match spec {
        ImageSpec::Single(single) => {
            info!("building single image {name:?}");
            let mut ctx = BuildContextAssembler::new(daemon, single.from.clone())
                .await
                .stack_err_with_locationless(|| format!("build_one_image({name:?})"))?;
            if let Some(m) = &single.maintainer {
                ctx.maintainer(m.clone());
            }
            for port in &single.exposes {
                ctx.expose(port.clone());
            }
            for volume in &single.volumes {
                ctx.volume(volume.clone());
            }
            for (k, v) in &single.envs {
                ctx.env(k.clone(), v.clone());
            }
            for assignment in extra_envs {
                let (k, v) = assignment.split_once('=').stack_err_with_locationless(|| {
                    format!("build_one_image({name:?}) -> malformed --env {assignment:?}, expected K=V")
                })?;
                ctx.env(k.to_owned(), v.to_owned());
            }
            for lib in &single.libs {
                ctx.include(&lib.src_path, lib.dest_path.clone(), false)
                    .await
                    .stack_err_with_locationless(|| format!("build_one_image({name:?}) -> libs"))?;
            }
            for run in &single.runs {
                ctx.include(&run.src_path, run.dest_path.clone(), true)
                    .await
                    .stack_err_with_locationless(|| format!("build_one_image({name:?}) -> runs"))?;
                ctx.run(run.dest_path.clone());
            }
            if let Some(entrypoint) = &single.entrypoint {
                ctx.include(&entrypoint.src_path, entrypoint.dest_path.clone(), true)
                    .await
                    .stack_err_with_locationless(|| format!("build_one_image({name:?}) -> entrypoint"))?;
                ctx.entrypoint(vec![entrypoint.dest_path.clone()]);
            }
            ctx.build(name, quiet_build)
                .await
                .stack_err_with_locationless(|| format!("build_one_image({name:?})"))?;
            Ok(())
        }
        ImageSpec::ContainerSystem(cs) => build_container_system_image(daemon, callbacks, name, cs, quiet_build).await,
    }
}

async fn build_container_system_image(
    daemon: Arc<dyn DaemonClient>,
    callbacks: Arc<CallbackRegistry>,
    name: &str,
    spec: &ContainerSystemImageSpec,
    quiet_build: bool,
) -> Result<()> {
    info!("building container-system image {name:?}");
    let raw = config::read_and_parse(&spec.system)
        .await
        .stack_err_with_locationless(|| format!("build_container_system_image({name:?})"))?;
    let fleet_cfg = config::parse_fleet_config(&raw)
        .stack_err_with_locationless(|| format!("build_container_system_image({name:?})"))?;
    run_container_system_build(daemon, callbacks, &fleet_cfg, spec, quiet_build)
        .await
        .stack_err_with_locationless(|| format!("build_container_system_image({name:?})"))?;
    Ok(())
}
