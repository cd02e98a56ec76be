//! The concrete [`DaemonClient`] backed by `bollard`, talking directly to
//! the daemon's HTTP-over-Unix-socket API rather than shelling out to a
//! CLI binary. Grounded on `SuperDockerfile::build_image`'s use of
//! `bollard::Docker` and on its `#[tracing::instrument(skip_all, ...)]`
//! annotation style.

use std::collections::HashMap;

use bollard::{
    container::{
        Config, CreateContainerOptions, KillContainerOptions, LogsOptions,
        RemoveContainerOptions, WaitContainerOptions,
    },
    image::{BuildImageOptions as BollardBuildImageOptions, CommitContainerOptions},
    service::HostConfig,
    Docker,
};
use futures::StreamExt;
use stacked_errors::{Result, StackableErr};

use super::{
    build_stream, BuildImageOptions, BuildOutcome, ContainerInspect, CreateContainerRequest,
    DaemonClient, ImageInspect,
};
use crate::error::OrchestratorError;

pub struct BollardDaemonClient {
    docker: Docker,
}

impl BollardDaemonClient {
    /// Connects using the platform default (`DOCKER_HOST` env var, or the
    /// local Unix socket / named pipe).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| OrchestratorError::DaemonUnavailable(e.to_string()))
            .stack_err_locationless("BollardDaemonClient::connect() could not reach daemon")?;
        Ok(Self { docker })
    }
}

#[async_trait::async_trait]
impl DaemonClient for BollardDaemonClient {
    #[tracing::instrument(skip_all, fields(name = %req.name, image = %req.image))]
    async fn create_container(&self, req: &CreateContainerRequest) -> Result<()> {
        let binds: Vec<String> = req
            .volumes
            .iter()
            .filter_map(|v| {
                v.host_path
                    .as_ref()
                    .map(|h| format!("{}:{}", h.display(), v.container_path))
            })
            .collect();
        let volumes_from: Vec<String> = req
            .volumes_from
            .iter()
            .map(|v| format!("{}:{}", v.container_name, v.mode.as_flag()))
            .collect();
        let links: Vec<String> = req
            .links
            .iter()
            .map(|l| format!("{}:{}", l.container_name, l.alias))
            .collect();

        let host_config = HostConfig {
            binds: Some(binds),
            volumes_from: Some(volumes_from),
            links: Some(links),
            ..Default::default()
        };
        // anonymous volumes (no host path) are declared on `Config.volumes`, bind
        // mounts are declared on `HostConfig.binds` above
        let anon_volumes: HashMap<String, HashMap<(), ()>> = req
            .volumes
            .iter()
            .filter(|v| v.host_path.is_none())
            .map(|v| (v.container_path.clone(), HashMap::new()))
            .collect();
        let config = Config {
            image: Some(req.image.clone()),
            entrypoint: req.entrypoint.clone(),
            working_dir: req.working_dir.clone(),
            host_config: Some(host_config),
            volumes: if anon_volumes.is_empty() {
                None
            } else {
                Some(anon_volumes)
            },
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: req.name.clone(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .stack_err_with_locationless(|| format!("create_container({:?})", req.name))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container::<String>(name, None)
            .await
            .stack_err_with_locationless(|| format!("start_container({name:?})"))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect> {
        let resp = self
            .docker
            .inspect_container(name, None)
            .await
            .stack_err_with_locationless(|| format!("inspect_container({name:?})"))?;
        let state = resp.state.unwrap_or_default();
        let volumes = resp
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                let dest = m.destination?;
                let src = m.source.unwrap_or_default();
                Some((dest, src))
            })
            .collect();
        let image = resp
            .config
            .and_then(|c| c.image)
            .unwrap_or_default();
        Ok(ContainerInspect {
            running: state.running.unwrap_or(false),
            pid: state.pid.unwrap_or(0),
            started_at: state.started_at.unwrap_or_default(),
            exit_code: state.exit_code,
            volumes,
            image,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn wait_container(&self, name: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(resp)) => Ok(resp.status_code),
            Some(Err(e)) => {
                // bollard surfaces a non-zero exit as an error variant carrying the code
                Err(e).stack_err_with_locationless(|| format!("wait_container({name:?})"))
            }
            None => {
                stacked_errors::bail_locationless!("wait_container({name:?}) -> stream ended with no response")
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn kill_container(&self, name: &str, signal: &str) -> Result<()> {
        let options = KillContainerOptions {
            signal: signal.to_owned(),
        };
        self.docker
            .kill_container(name, Some(options))
            .await
            .stack_err_with_locationless(|| format!("kill_container({name:?}, {signal:?})"))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn remove_container(&self, name: &str, not_exists_ok: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. })
                if not_exists_ok =>
            {
                Ok(())
            }
            Err(e) => Err(e).stack_err_with_locationless(|| format!("remove_container({name:?})")),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn container_logs(&self, name: &str) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.stack_err_with_locationless(|| format!("container_logs({name:?})"))?;
            out.push_str(&chunk.to_string());
        }
        Ok(out)
    }

    #[tracing::instrument(skip(self))]
    async fn commit_container(&self, name: &str, dest_image: &str) -> Result<()> {
        let (repo, tag) = dest_image.split_once(':').unwrap_or((dest_image, "latest"));
        let options = CommitContainerOptions {
            container: name.to_owned(),
            repo: repo.to_owned(),
            tag: tag.to_owned(),
            ..Default::default()
        };
        self.docker
            .commit_container(options, Config::<String>::default())
            .await
            .stack_err_with_locationless(|| format!("commit_container({name:?}, {dest_image:?})"))?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(image_tag = %opts.image_tag))]
    async fn build_image(&self, tarball: Vec<u8>, opts: &BuildImageOptions) -> Result<BuildOutcome> {
        let options = BollardBuildImageOptions {
            t: opts.image_tag.clone(),
            rm: true,
            ..Default::default()
        };
        let stream = self
            .docker
            .build_image(options, None, Some(tarball.into()));
        let lines = stream.map(|item| match item {
            Ok(info) => Ok(build_stream::RawBuildLine {
                stream: info.stream,
                status: info.status,
                error: info.error,
                aux_image_id: info.aux.and_then(|a| a.id),
            }),
            Err(e) => Err(e).stack_err_locationless("build_image -> daemon stream error"),
        });
        build_stream::interpret(Box::pin(lines), opts.quiet).await
    }

    #[tracing::instrument(skip(self))]
    async fn inspect_image(&self, image_id: &str) -> Result<ImageInspect> {
        let resp = self
            .docker
            .inspect_image(image_id)
            .await
            .stack_err_with_locationless(|| format!("inspect_image({image_id:?})"))?;
        Ok(ImageInspect {
            repo_tags: resp.repo_tags.unwrap_or_default(),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn remove_image(&self, image_id: &str) -> Result<()> {
        self.docker
            .remove_image(image_id, None, None)
            .await
            .stack_err_with_locationless(|| format!("remove_image({image_id:?})"))?;
        Ok(())
    }
}
