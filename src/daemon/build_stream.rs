//! Interpretation of a container daemon's build event stream.
//!
//! Grounded directly on `watch_build` from the original implementation's
//! `dockerext/build.py`: the daemon streams one JSON object per build step;
//! this module tracks which container is currently "the" intermediate
//! container by watching `stream` lines of the form `" ---> Running in
//! <id>"` (a bare `" ---> <id>"` layer line, with no `"Running in"`, names
//! a finished image layer and is not tracked), forgets it again when a
//! matching `"Removing intermediate container <id>"` line arrives, and
//! raises a
//! [`crate::error::OrchestratorError::BuildFailed`] carrying whatever
//! intermediate container was live (for cleanup) if an `error` line ever
//! appears.
//!
//! Kept independent of `bollard`'s own `BuildInfo` type so the state
//! machine can be exercised with synthetic input in tests without
//! constructing daemon responses.

use futures::{Stream, StreamExt};
use stacked_errors::{Result, StackableErr};
use tracing::{debug, warn};

use crate::daemon::BuildOutcome;

/// One normalized line out of a build event stream, daemon-agnostic.
#[derive(Debug, Clone, Default)]
pub struct RawBuildLine {
    pub stream: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    /// Present on the final summary line some daemons emit with the
    /// resulting image id (bollard's `aux.ID`).
    pub aux_image_id: Option<String>,
}

/// Consumes a build event stream to completion. Returns `Err` only for a
/// transport-level failure (the stream itself errored); a build that ran
/// but reported an `error` line comes back as `Ok(BuildOutcome::Failed)`
/// so the caller can decide how to clean up.
pub async fn interpret(
    mut lines: impl Stream<Item = Result<RawBuildLine>> + Unpin,
    quiet: bool,
) -> Result<BuildOutcome> {
    let mut latest_container: Option<String> = None;
    let mut error_lines: Vec<String> = Vec::new();
    let mut image_id: Option<String> = None;

    while let Some(line) = lines.next().await {
        let line = line.stack_err_locationless("interpret -> build event stream errored")?;

        if let Some(id) = line.aux_image_id {
            image_id = Some(id);
        }

        if let Some(err) = &line.error {
            error_lines.push(err.clone());
            continue;
        }

        if let Some(text) = &line.stream {
            if let Some(container) = parse_running_in_container(text) {
                latest_container = Some(container);
            } else if let Some(container) = parse_removing_container(text) {
                match &latest_container {
                    Some(cur) if *cur == container => {
                        latest_container = None;
                    }
                    _ => {
                        debug!(
                            "build stream removed intermediate container {container} that was \
                             not the one being tracked"
                        );
                    }
                }
            } else if !quiet {
                let trimmed = text.trim_end();
                if !trimmed.is_empty() {
                    debug!("build: {trimmed}");
                }
            }
        }

        if let Some(status) = &line.status {
            debug!("build status: {status}");
        }
    }

    if !error_lines.is_empty() {
        if let Some(container) = &latest_container {
            warn!("build failed with intermediate container {container} left behind");
        }
        return Ok(BuildOutcome::Failed {
            intermediate_container: latest_container,
            error_lines,
        });
    }

    let image_id = image_id.stack_err_locationless(
        "interpret -> build stream ended without error but no image id was reported",
    )?;
    Ok(BuildOutcome::Built { image_id })
}

/// Extracts the intermediate container id from a `"Running in CONTAINER"`
/// progress-detail line, with or without the `" ---> "` prefix the daemon
/// puts in front of it (`" ---> Running in abc123"`). A bare `" ---> abc123"`
/// layer line (no `"Running in"`) is a finished image layer, not a live
/// container, and must not be mistaken for one (spec.md §4.5).
fn parse_running_in_container(text: &str) -> Option<String> {
    let text = text.trim_start();
    let rest = text.strip_prefix("--->").map(str::trim_start).unwrap_or(text);
    rest.strip_prefix("Running in ").map(|s| s.trim().to_owned())
}

fn parse_removing_container(text: &str) -> Option<String> {
    text.trim_start()
        .strip_prefix("Removing intermediate container ")
        .map(|s| s.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn line(stream_text: &str) -> Result<RawBuildLine> {
        Ok(RawBuildLine {
            stream: Some(stream_text.to_owned()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn tracks_intermediate_container_lifecycle() {
        let lines = vec![
            line("Step 1/2 : FROM scratch"),
            line(" ---> abc123"),
            line("Step 2/2 : RUN true"),
            line(" ---> Running in def456"),
            line("Removing intermediate container def456"),
            line(" ---> finalimg"),
            Ok(RawBuildLine {
                aux_image_id: Some("sha256:final".to_owned()),
                ..Default::default()
            }),
        ];
        let outcome = interpret(stream::iter(lines), false).await.unwrap();
        match outcome {
            BuildOutcome::Built { image_id } => assert_eq!(image_id, "sha256:final"),
            BuildOutcome::Failed { .. } => panic!("expected a successful build"),
        }
    }

    #[tokio::test]
    async fn error_line_fails_with_intermediate_container() {
        let lines = vec![
            line(" ---> abc123"),
            line(" ---> Running in def456"),
            Ok(RawBuildLine {
                error: Some("RUN returned a non-zero code: 1".to_owned()),
                ..Default::default()
            }),
        ];
        let outcome = interpret(stream::iter(lines), false).await.unwrap();
        match outcome {
            BuildOutcome::Failed { intermediate_container, error_lines } => {
                assert_eq!(intermediate_container.as_deref(), Some("def456"));
                assert_eq!(error_lines.len(), 1);
            }
            BuildOutcome::Built { .. } => panic!("expected a failed build"),
        }
    }

    #[tokio::test]
    async fn property_6_sequence_tracks_second_container_only() {
        let lines = vec![
            line("Running in C1"),
            line(" ---> C1"),
            line("Running in C2"),
            line(" ---> C2"),
            Ok(RawBuildLine {
                error: Some("error: X".to_owned()),
                ..Default::default()
            }),
        ];
        let outcome = interpret(stream::iter(lines), false).await.unwrap();
        match outcome {
            BuildOutcome::Failed { intermediate_container, error_lines } => {
                assert_eq!(intermediate_container.as_deref(), Some("C2"));
                assert!(error_lines.iter().any(|l| l.contains('X')));
            }
            BuildOutcome::Built { .. } => panic!("expected a failed build"),
        }
    }

    #[tokio::test]
    async fn bare_layer_line_is_not_mistaken_for_a_container() {
        let lines = vec![
            line(" ---> abc123"),
            Ok(RawBuildLine {
                error: Some("boom".to_owned()),
                ..Default::default()
            }),
        ];
        let outcome = interpret(stream::iter(lines), false).await.unwrap();
        match outcome {
            BuildOutcome::Failed { intermediate_container, .. } => {
                assert_eq!(intermediate_container, None);
            }
            BuildOutcome::Built { .. } => panic!("expected a failed build"),
        }
    }

    #[tokio::test]
    async fn mismatched_removal_does_not_fail_build() {
        let lines = vec![
            line(" ---> abc123"),
            line("Removing intermediate container zzz999"),
            Ok(RawBuildLine {
                aux_image_id: Some("sha256:ok".to_owned()),
                ..Default::default()
            }),
        ];
        let outcome = interpret(stream::iter(lines), true).await.unwrap();
        match outcome {
            BuildOutcome::Built { image_id } => assert_eq!(image_id, "sha256:ok"),
            BuildOutcome::Failed { .. } => panic!("expected a successful build"),
        }
    }
}
