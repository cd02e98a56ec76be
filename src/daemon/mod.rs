//! The daemon client adapter: everything the rest of this crate needs from
//! a running container daemon, expressed as a trait so the orchestration
//! logic above it (container lifecycle, fleet scheduling, build driving)
//! can be exercised against a fake in tests instead of a live daemon.
//!
//! Grounded on `get2knowio-deacon`'s `Docker`/`DockerLifecycle` trait split
//! (an object-safe `async_trait` over the subset of daemon operations a
//! caller actually needs) and on the teacher's own choice of `bollard` as
//! the concrete HTTP-over-Unix-socket client.

mod bollard_client;
pub mod build_stream;
mod fake;

use std::collections::BTreeMap;

use async_trait::async_trait;
use stacked_errors::Result;

pub use bollard_client::BollardDaemonClient;
pub use fake::{FakeContainerScript, FakeDaemonClient, FakeScript};

use crate::container::{NetworkLink, VolumeFromLink, VolumeLink};

/// Everything needed to create a container, already resolved from a
/// [`crate::container::ContainerSpec`] into daemon-shaped primitives.
#[derive(Debug, Clone)]
pub struct CreateContainerRequest {
    pub name: String,
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub volumes: Vec<VolumeLink>,
    pub volumes_from: Vec<VolumeFromLink>,
    pub links: Vec<NetworkLink>,
}

/// The subset of `docker inspect` state this crate reads.
#[derive(Debug, Clone, Default)]
pub struct ContainerInspect {
    pub running: bool,
    pub pid: i64,
    /// RFC3339 start timestamp, or the daemon's zero-value sentinel
    /// (`"0001-01-01T00:00:00Z"`) if the container has never started.
    pub started_at: String,
    pub exit_code: Option<i64>,
    /// Declared volume mount points (container-path keyed), used by the
    /// persist-derivation path to build the sidecar's tar command.
    pub volumes: BTreeMap<String, String>,
    /// The image reference the container was created from.
    pub image: String,
}

/// The subset of `docker inspect --type image` state this crate reads.
#[derive(Debug, Clone, Default)]
pub struct ImageInspect {
    /// `["<none>:<none>"]` is the daemon's sentinel for an untagged,
    /// build-intermediate image.
    pub repo_tags: Vec<String>,
}

impl ImageInspect {
    pub fn is_untagged(&self) -> bool {
        self.repo_tags == ["<none>:<none>"]
    }
}

impl ContainerInspect {
    /// Matches the daemon's convention for "this container has never been
    /// started" (the same zero-time sentinel checked by
    /// `Container.start()` in the original Python implementation).
    pub fn never_started(&self) -> bool {
        self.started_at == "0001-01-01T00:00:00Z"
    }
}

/// Options controlling an image build submission.
#[derive(Debug, Clone)]
pub struct BuildImageOptions {
    pub image_tag: String,
    pub quiet: bool,
}

/// Outcome of a completed image build submission. A scripted build failure
/// (the daemon ran the build and it reported an `error` line) is carried
/// here rather than as an `Err`, so the caller that owns cleanup
/// responsibility (the build context assembler) can act on
/// `intermediate_container` without downcasting a generic error type.
/// `Err` from [`DaemonClient::build_image`] is reserved for transport-level
/// failures (daemon unreachable, stream I/O error).
#[derive(Debug, Clone)]
pub enum BuildOutcome {
    Built { image_id: String },
    Failed {
        intermediate_container: Option<String>,
        error_lines: Vec<String>,
    },
}

#[async_trait]
pub trait DaemonClient: Send + Sync {
    async fn create_container(&self, req: &CreateContainerRequest) -> Result<()>;

    async fn start_container(&self, name: &str) -> Result<()>;

    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect>;

    /// Blocks until the container exits, returning its exit code.
    async fn wait_container(&self, name: &str) -> Result<i64>;

    async fn kill_container(&self, name: &str, signal: &str) -> Result<()>;

    /// Removes a container. Must succeed (treat "already gone" as success)
    /// when `not_exists_ok` is set.
    async fn remove_container(&self, name: &str, not_exists_ok: bool) -> Result<()>;

    async fn container_logs(&self, name: &str) -> Result<String>;

    async fn commit_container(&self, name: &str, dest_image: &str) -> Result<()>;

    /// Submits a build context tarball plus a rendered Dockerfile for
    /// building, returning the resulting image id on success.
    async fn build_image(
        &self,
        tarball: Vec<u8>,
        opts: &BuildImageOptions,
    ) -> Result<BuildOutcome>;

    /// Used by build-failure cleanup to decide whether a residual image is
    /// the daemon's untagged intermediate sentinel and safe to remove.
    async fn inspect_image(&self, image_id: &str) -> Result<ImageInspect>;

    async fn remove_image(&self, image_id: &str) -> Result<()>;
}

/// Environment variables rendered as Dockerfile `ENV` instructions, kept
/// here rather than in `container.rs` since only image builds (not
/// already-running containers) make use of it.
pub type EnvMap = BTreeMap<String, String>;
