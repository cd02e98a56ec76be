//! The Build Context Assembler: stages files for an image build and
//! renders the Dockerfile-equivalent instruction manifest the daemon
//! actually builds from.
//!
//! Grounded on `nagoya/dockerext/build.py`'s `BuildContext`: incremental
//! `_from`/`maintainer`/`expose`/`volume`/`workdir`/`add`/`include`/`run`/
//! `entrypoint` builders writing into a single synthesized Dockerfile, a
//! `_build` step that tars the staging directory and submits it, and
//! `cleanup_container` (inspect, force-kill, remove, then drop the
//! residual image if it's untagged) run against whatever intermediate
//! container a failed build left behind.

use std::{path::Path, sync::Arc};

use stacked_errors::{Result, StackableErr};
use tracing::{info, warn};

use crate::{
    daemon::{BuildImageOptions, BuildOutcome, DaemonClient},
    error::OrchestratorError,
    temp_dir::TempResourceDirectory,
};

/// One line of the synthesized Dockerfile.
#[derive(Debug, Clone)]
enum Instruction {
    From(String),
    Maintainer(String),
    Expose(String),
    Volume(String),
    Workdir(String),
    Env(String, String),
    Add { src_rel: String, dest: String },
    Run(String),
    Entrypoint(Vec<String>),
}

impl Instruction {
    fn render(&self) -> String {
        match self {
            Self::From(i) => format!("FROM {i}"),
            Self::Maintainer(m) => format!("MAINTAINER {m}"),
            Self::Expose(p) => format!("EXPOSE {p}"),
            Self::Volume(v) => format!("VOLUME [{v:?}]"),
            Self::Workdir(d) => format!("WORKDIR {d}"),
            Self::Env(k, v) => format!("ENV {k} {v}"),
            Self::Add { src_rel, dest } => format!("ADD {src_rel} {dest}"),
            Self::Run(cmd) => format!("RUN {cmd}"),
            Self::Entrypoint(argv) => {
                let rendered = argv.iter().map(|a| format!("{a:?}")).collect::<Vec<_>>().join(", ");
                format!("ENTRYPOINT [{rendered}]")
            }
        }
    }
}

/// Assembles a build context: a staging directory of files plus an ordered
/// Dockerfile instruction list, both tarred together and handed to
/// [`DaemonClient::build_image`] as a single submission.
pub struct BuildContextAssembler {
    staging: TempResourceDirectory,
    instructions: Vec<Instruction>,
    daemon: Arc<dyn DaemonClient>,
}

impl BuildContextAssembler {
    pub async fn new(daemon: Arc<dyn DaemonClient>, from_image: impl Into<String>) -> Result<Self> {
        let staging = TempResourceDirectory::new()
            .await
            .stack_err_locationless("BuildContextAssembler::new")?;
        Ok(Self {
            staging,
            instructions: vec![Instruction::From(from_image.into())],
            daemon,
        })
    }

    pub fn maintainer(&mut self, name: impl Into<String>) -> &mut Self {
        self.instructions.push(Instruction::Maintainer(name.into()));
        self
    }

    pub fn expose(&mut self, port: impl Into<String>) -> &mut Self {
        self.instructions.push(Instruction::Expose(port.into()));
        self
    }

    pub fn volume(&mut self, container_path: impl Into<String>) -> &mut Self {
        self.instructions.push(Instruction::Volume(container_path.into()));
        self
    }

    pub fn workdir(&mut self, dir: impl Into<String>) -> &mut Self {
        self.instructions.push(Instruction::Workdir(dir.into()));
        self
    }

    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.instructions.push(Instruction::Env(key.into(), value.into()));
        self
    }

    pub fn run(&mut self, command: impl Into<String>) -> &mut Self {
        self.instructions.push(Instruction::Run(command.into()));
        self
    }

    pub fn entrypoint(&mut self, argv: Vec<String>) -> &mut Self {
        self.instructions.push(Instruction::Entrypoint(argv));
        self
    }

    /// Stages `source` into the build context under `files/<basename>` and
    /// records the `ADD` instruction that copies it to the absolute image
    /// path `dest`.
    pub async fn include(
        &mut self,
        source: impl AsRef<Path>,
        dest: impl Into<String>,
        executable: bool,
    ) -> Result<&mut Self> {
        let source = source.as_ref();
        let dest = dest.into();
        let basename = source
            .file_name()
            .stack_err_with_locationless(|| {
                format!("BuildContextAssembler::include({source:?}) -> source has no basename")
            })?
            .to_string_lossy()
            .into_owned();
        let src_rel = format!("files/{basename}");
        self.staging
            .include(source, &src_rel, executable)
            .await
            .stack_err_with_locationless(|| {
                format!("BuildContextAssembler::include({source:?}, {dest:?})")
            })?;
        self.instructions.push(Instruction::Add { src_rel, dest });
        Ok(self)
    }

    /// Writes `tar_bytes` straight into the build context root under
    /// `tar_name` and records the `ADD` that unpacks it at `dest`. Used by
    /// the Build Driver's persist-derivation path to fold an extracted
    /// volume's tar archive into a fresh image without staging individual
    /// files.
    pub async fn include_tar(
        &mut self,
        tar_bytes: &[u8],
        tar_name: &str,
        dest: impl Into<String>,
    ) -> Result<&mut Self> {
        let path = self.staging.path().join(tar_name);
        tokio::fs::write(&path, tar_bytes)
            .await
            .stack_err_with_locationless(|| format!("BuildContextAssembler::include_tar({tar_name:?})"))?;
        self.instructions.push(Instruction::Add {
            src_rel: tar_name.to_owned(),
            dest: dest.into(),
        });
        Ok(self)
    }

    fn render_dockerfile(&self) -> String {
        let mut s = self
            .instructions
            .iter()
            .map(Instruction::render)
            .collect::<Vec<_>>()
            .join("\n");
        s.push('\n');
        s
    }

    /// Tars the staging directory plus the rendered Dockerfile and submits
    /// it for build under `image_tag`. On a build failure, cleans up
    /// whatever intermediate container the daemon left behind (and its
    /// image, if untagged) before returning the error.
    pub async fn build(&self, image_tag: impl Into<String>, quiet: bool) -> Result<String> {
        let image_tag = image_tag.into();
        let dockerfile = self.render_dockerfile();
        let tarball = self
            .tar_context(&dockerfile)
            .stack_err_with_locationless(|| format!("BuildContextAssembler::build({image_tag:?})"))?;
        let opts = BuildImageOptions {
            image_tag: image_tag.clone(),
            quiet,
        };
        let outcome = self
            .daemon
            .build_image(tarball, &opts)
            .await
            .stack_err_with_locationless(|| format!("BuildContextAssembler::build({image_tag:?})"))?;
        match outcome {
            BuildOutcome::Built { image_id } => {
                info!("built image {image_tag:?} -> {image_id}");
                Ok(image_id)
            }
            BuildOutcome::Failed {
                intermediate_container,
                error_lines,
            } => {
                if let Some(container_id) = &intermediate_container {
                    cleanup_container(self.daemon.as_ref(), container_id).await;
                }
                Err(OrchestratorError::BuildFailed {
                    intermediate_container,
                    error_lines,
                })
                .stack_err_locationless("BuildContextAssembler::build -> daemon reported a build failure")
            }
        }
    }

    fn tar_context(&self, dockerfile: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut buf);
            builder
                .append_dir_all(".", self.staging.path())
                .stack_err_locationless("BuildContextAssembler::tar_context -> append_dir_all")?;
            let mut header = tar::Header::new_gnu();
            header.set_size(dockerfile.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "Dockerfile", dockerfile.as_bytes())
                .stack_err_locationless("BuildContextAssembler::tar_context -> append Dockerfile")?;
            builder
                .finish()
                .stack_err_locationless("BuildContextAssembler::tar_context -> finish")?;
        }
        Ok(buf)
    }
}

/// Best-effort teardown of a residual build-intermediate container:
/// inspects it, force-kills and removes it, then — if it had an image and
/// that image is the daemon's untagged sentinel — removes the image too.
/// Every step here is logged-and-continued rather than propagated: this
/// runs after a build has already failed, and its only job is not to leak.
pub async fn cleanup_container(daemon: &dyn DaemonClient, container_id: &str) {
    let image = match daemon.inspect_container(container_id).await {
        Ok(inspect) => Some(inspect.image).filter(|i| !i.is_empty()),
        Err(e) => {
            warn!("cleanup_container({container_id:?}) -> inspect failed: {e}");
            None
        }
    };

    if let Err(e) = daemon.kill_container(container_id, "SIGKILL").await {
        warn!("cleanup_container({container_id:?}) -> kill failed: {e}");
    }
    if let Err(e) = daemon.remove_container(container_id, true).await {
        warn!("cleanup_container({container_id:?}) -> remove failed: {e}");
    }

    if let Some(image_id) = image {
        match daemon.inspect_image(&image_id).await {
            Ok(info) if info.is_untagged() => {
                if let Err(e) = daemon.remove_image(&image_id).await {
                    warn!(
                        "cleanup_container({container_id:?}) -> remove_image({image_id:?}) failed: {e}"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => warn!(
                "cleanup_container({container_id:?}) -> inspect_image({image_id:?}) failed: {e}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::daemon::{FakeDaemonClient, FakeScript};

    #[tokio::test]
    async fn renders_dockerfile_in_declaration_order() {
        let daemon: Arc<dyn DaemonClient> = Arc::new(FakeDaemonClient::new(FakeScript::default()));
        let mut ctx = BuildContextAssembler::new(daemon, "alpine:3").await.unwrap();
        ctx.maintainer("ops").expose("80").workdir("/app");
        let rendered = ctx.render_dockerfile();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "FROM alpine:3");
        assert_eq!(lines[1], "MAINTAINER ops");
        assert_eq!(lines[2], "EXPOSE 80");
        assert_eq!(lines[3], "WORKDIR /app");
    }

    #[tokio::test]
    async fn build_succeeds_and_returns_image_id() {
        let mut script = FakeScript::default();
        script.build_outcome = Some(BuildOutcome::Built {
            image_id: "sha256:abc".to_owned(),
        });
        let daemon: Arc<dyn DaemonClient> = Arc::new(FakeDaemonClient::new(script));
        let ctx = BuildContextAssembler::new(daemon, "alpine:3").await.unwrap();
        let image_id = ctx.build("myimage:latest", true).await.unwrap();
        assert_eq!(image_id, "sha256:abc");
    }

    #[tokio::test]
    async fn build_failure_cleans_up_intermediate_container() {
        let mut images = BTreeMap::new();
        images.insert("sha256:intermediate_image".to_owned(), vec!["<none>:<none>".to_owned()]);
        let mut script = FakeScript::default();
        script.build_outcome = Some(BuildOutcome::Failed {
            intermediate_container: Some("deadbeef".to_owned()),
            error_lines: vec!["RUN returned a non-zero code".to_owned()],
        });
        script.images = images;
        let daemon = Arc::new(FakeDaemonClient::new(script));
        let call_log = daemon.call_log.clone();
        let ctx = BuildContextAssembler::new(daemon, "alpine:3").await.unwrap();
        let res = ctx.build("myimage:latest", true).await;
        assert!(res.is_err());
        let log = call_log.lock().unwrap();
        assert!(log.iter().any(|l| l.starts_with("kill:deadbeef")));
        assert!(log.iter().any(|l| l.starts_with("remove:deadbeef")));
    }
}
