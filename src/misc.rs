//! Small ambient helpers shared by every other module: process-wide
//! ctrl-c tracking, name generation, polling retries, and filesystem
//! acquisition helpers.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

pub(crate) use color_cycle::next_terminal_color;
use stacked_errors::{bail_locationless, Result, StackableErr};
use tokio::{fs, time::sleep};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Set to `true` once a SIGINT/SIGTERM has been observed. Polling loops
/// (fleet waits, build-event streams) check this between iterations so that
/// a ctrl-c during a long operation still results in attempted cleanup
/// rather than an abrupt process kill.
pub static CTRLC_ISSUED: AtomicBool = AtomicBool::new(false);

/// Installs a `ctrlc` handler that sets [`CTRLC_ISSUED`]. Should be called
/// once near the start of `main`.
pub fn ctrlc_init() -> Result<()> {
    ctrlc::set_handler(|| {
        CTRLC_ISSUED.store(true, Ordering::SeqCst);
    })
    .stack_err_locationless("ctrlc_init -> could not set ctrlc handler")
}

/// Initializes a `tracing-subscriber` logger reading its filter from
/// `RUST_LOG`, falling back to `info` when unset, or to `warn`/`debug`
/// when `quiet`/`verbose` request a stricter or looser default. Should be
/// called once near the start of `main`, before [`ctrlc_init`].
pub fn std_init(quiet: bool, verbose: bool) -> Result<()> {
    let default_level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| stacked_errors::Error::from(format!("std_init -> {e}")))
        .stack_err_locationless("std_init -> could not install tracing subscriber")
}

/// uuid-suffixed name, e.g. `random_name("builder")` -> `"builder-3f9a21"`.
pub fn random_name(name: impl std::fmt::Display) -> String {
    format!("{name}-{}", &uuid::Uuid::new_v4().to_string()[..6])
}

/// Takes the hash of the type name of `T`. Used to sanity check that two
/// ends of a typed channel agree on the type they are exchanging.
pub fn type_hash<T: ?Sized>() -> [u8; 16] {
    use sha3::{Digest, Sha3_256};
    let name = std::any::type_name::<T>();
    let mut hasher = Sha3_256::new();
    hasher.update(name.as_bytes());
    let tmp: [u8; 32] = hasher.finalize().into();
    let mut res = [0u8; 16];
    res.copy_from_slice(&tmp[0..16]);
    res
}

/// Repeatedly polls `f` until it returns `Ok`, retrying up to `num_retries`
/// times with `delay` between attempts. Returns the last error (wrapped in
/// a timeout marker) if every attempt fails.
pub async fn wait_for_ok<F: FnMut() -> Fut, Fut: std::future::Future<Output = Result<T>>, T>(
    num_retries: u64,
    delay: Duration,
    mut f: F,
) -> Result<T> {
    let mut i = num_retries;
    loop {
        match f().await {
            Ok(o) => return Ok(o),
            Err(e) => {
                if i == 0 {
                    return Err(e).stack_err_locationless(format!(
                        "wait_for_ok(num_retries: {num_retries}, delay: {delay:?}) timed out"
                    ));
                }
                i -= 1;
            }
        }
        sleep(delay).await;
    }
}

/// Flushes and `sync_all`s a file so that it is guaranteed to be completely
/// written to the filesystem before returning.
pub async fn close_file(mut file: tokio::fs::File) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    file.flush().await.stack()?;
    file.sync_all().await.stack()?;
    Ok(())
}

/// Confirms `path` exists and is a directory, returning its canonicalized
/// form.
pub async fn acquire_dir_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let meta = fs::metadata(path)
        .await
        .stack_err_with_locationless(|| format!("acquire_dir_path({path:?}) -> not found"))?;
    if !meta.is_dir() {
        bail_locationless!("acquire_dir_path({path:?}) -> exists but is not a directory")
    }
    dunce::canonicalize(path)
        .stack_err_with_locationless(|| format!("acquire_dir_path({path:?}) -> canonicalize"))
}

/// Confirms `path` exists and is a file, returning its canonicalized form.
pub async fn acquire_file_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let meta = fs::metadata(path)
        .await
        .stack_err_with_locationless(|| format!("acquire_file_path({path:?}) -> not found"))?;
    if !meta.is_file() {
        bail_locationless!("acquire_file_path({path:?}) -> exists but is not a file")
    }
    dunce::canonicalize(path)
        .stack_err_with_locationless(|| format!("acquire_file_path({path:?}) -> canonicalize"))
}

/// Logs a warning if `condition` holds, used at `Drop` sites where a
/// leaked live resource cannot be reported as an error.
pub(crate) fn warn_if(condition: bool, msg: impl std::fmt::Display) {
    if condition {
        warn!("{msg}");
    }
}

mod color_cycle {
    use std::sync::atomic::AtomicUsize;

    use owo_colors::{AnsiColors, AnsiColors::*};

    const COLOR_CYCLE: [AnsiColors; 8] = [
        White,
        Yellow,
        Green,
        Cyan,
        BrightBlack,
        Blue,
        BrightCyan,
        BrightGreen,
    ];

    static COLOR_NUM: AtomicUsize = AtomicUsize::new(0);

    pub(crate) fn next_terminal_color() -> AnsiColors {
        let inx = COLOR_NUM.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        COLOR_CYCLE[inx % COLOR_CYCLE.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_name_is_distinct() {
        let a = random_name("x");
        let b = random_name("x");
        assert_ne!(a, b);
        assert!(a.starts_with("x-"));
    }

    #[test]
    fn type_hash_is_stable_and_distinct() {
        assert_eq!(type_hash::<u32>(), type_hash::<u32>());
        assert_ne!(type_hash::<u32>(), type_hash::<u64>());
    }

    #[tokio::test]
    async fn wait_for_ok_retries_then_succeeds() {
        let mut attempts = 0;
        let res = wait_for_ok(5, Duration::from_millis(1), || {
            attempts += 1;
            let attempts = attempts;
            async move {
                if attempts < 3 {
                    Err(stacked_errors::Error::from("not yet"))
                } else {
                    Ok(attempts)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(res, 3);
    }

    #[tokio::test]
    async fn wait_for_ok_gives_up() {
        let res: Result<()> = wait_for_ok(2, Duration::from_millis(1), || async {
            Err(stacked_errors::Error::from("nope"))
        })
        .await;
        assert!(res.is_err());
    }
}
