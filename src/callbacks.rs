//! Explicit registry of callback functions a [`ContainerSpec`]'s
//! [`Callspec`]s resolve against.
//!
//! Grounded on `nagoya/docker/container.py`'s `ProvidedCallbacks` (the
//! built-in set) and `Callspec.from_text`'s qualified-coordinate lookup
//! (`importlib.import_module(module)` + `getattr`). This crate cannot load
//! Rust code dynamically, so a qualified `module.function` coordinate is
//! resolved against a fixed table the embedding application registers
//! ahead of time, and unknown coordinates are rejected once — at fleet
//! construction — rather than at callback-invocation time (spec.md §9's
//! re-architecture guidance for "callbacks looked up by string
//! coordinate").

use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};

use stacked_errors::{bail_locationless, Result, StackableErr};
use tracing::{error, info};

use crate::container::{BuiltinCallback, CallbackRef, Container};

pub type CallbackFuture<'c> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'c>>;

/// An extension callback, registered under its `module.function`
/// coordinate.
pub type CallbackFn = Arc<dyn for<'c> Fn(&'c Container) -> CallbackFuture<'c> + Send + Sync>;

/// The fixed set of callbacks a [`CallbackRef`] may resolve against: the
/// crate's own built-ins, plus whatever the embedding application has
/// registered under a `module.function` coordinate.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    extensions: BTreeMap<String, CallbackFn>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an extension callback under `module.function`.
    pub fn register(
        &mut self,
        module: impl Into<String>,
        function: impl Into<String>,
        f: CallbackFn,
    ) {
        self.extensions
            .insert(format!("{}.{}", module.into(), function.into()), f);
    }

    /// Confirms `callback` resolves to a known built-in or a registered
    /// extension, without invoking it. Called once per [`CallbackRef`] at
    /// fleet-construction time so an unknown coordinate is a configuration
    /// error rather than a mid-run surprise.
    pub fn validate(&self, callback: &CallbackRef) -> Result<()> {
        match callback {
            CallbackRef::Builtin(_) => Ok(()),
            CallbackRef::Qualified { module, function } => {
                let key = format!("{module}.{function}");
                if self.extensions.contains_key(&key) {
                    Ok(())
                } else {
                    bail_locationless!(
                        "CallbackRegistry::validate -> unregistered callback {key:?}; register \
                         it before constructing the fleet"
                    )
                }
            }
        }
    }

    pub(crate) async fn invoke(&self, callback: &CallbackRef, container: &Container) -> Result<()> {
        match callback {
            CallbackRef::Builtin(BuiltinCallback::ShowNetwork) => show_network(container).await,
            CallbackRef::Qualified { module, function } => {
                let key = format!("{module}.{function}");
                let f = self.extensions.get(&key).stack_err_with_locationless(|| {
                    format!("CallbackRegistry::invoke -> unregistered callback {key:?}")
                })?;
                f(container)
                    .await
                    .stack_err_with_locationless(|| format!("callback {key:?}"))
            }
        }
    }
}

/// Mirrors the original's `show_network`: logs the container's running
/// state after an event fires. The original read IP/port bindings out of
/// Docker's `NetworkSettings`; this crate's narrower [`crate::daemon::ContainerInspect`]
/// contract doesn't carry those, so this built-in reports what it does
/// carry (image, pid, running state) instead of fabricating network
/// fields the daemon contract doesn't specify.
async fn show_network(container: &Container) -> Result<()> {
    match container.inspect_best_effort().await {
        Ok(i) => {
            info!(
                "container {:?} image={:?} running={} pid={}",
                container.name(),
                i.image,
                i.running,
                i.pid
            );
            Ok(())
        }
        Err(e) => {
            error!("could not read status for container {:?}: {e}", container.name());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_builtin_without_registration() {
        let reg = CallbackRegistry::new();
        assert!(reg
            .validate(&CallbackRef::Builtin(BuiltinCallback::ShowNetwork))
            .is_ok());
    }

    #[test]
    fn rejects_unregistered_qualified_callback() {
        let reg = CallbackRegistry::new();
        let cb = CallbackRef::Qualified {
            module: "mymodule".into(),
            function: "warn_operators".into(),
        };
        assert!(reg.validate(&cb).is_err());
    }

    #[test]
    fn accepts_registered_qualified_callback() {
        let mut reg = CallbackRegistry::new();
        reg.register("mymodule", "warn_operators", Arc::new(|_c| Box::pin(async { Ok(()) })));
        let cb = CallbackRef::Qualified {
            module: "mymodule".into(),
            function: "warn_operators".into(),
        };
        assert!(reg.validate(&cb).is_ok());
    }
}
