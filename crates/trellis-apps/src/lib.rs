//! App hosting for the `trellis` command line.
//!
//! Apps are separately built executables that extend the host's command
//! tree. This crate takes an app from its configured reference to commands
//! the user can run:
//!
//! - [`reference`] turns a reference into source, clone and artifact
//!   locations;
//! - [`pipeline`] clones remote sources and rebuilds stale artifacts;
//! - [`app`] drives one app through resolve, fetch, build and connect,
//!   recording the first failure on the app;
//! - [`host`] launches app processes and talks to them over [`protocol`];
//! - [`shared`] and [`cache`] let several invocations share one process for
//!   apps that declare a shared host;
//! - [`graft`] splices app commands and hooks into the [`CommandTree`].
//!
//! The app side of the protocol lives in [`serve`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use trellis_apps::{AppEnvironment, CallContext, LoadedApps, ReattachStore};
//! use trellis_config::AppEntry;
//!
//! let store = ReattachStore::new("/tmp/apps/trellis_app_cache.json", "0.1.0");
//! let env = Arc::new(AppEnvironment::new("/tmp/apps", store));
//! let apps = LoadedApps::load_all(
//!     env,
//!     [AppEntry::new("github.com/org/repo/hello")],
//!     &CallContext::background(),
//! );
//! for app in &apps {
//!     println!("{}: loaded = {}", app.reference(), app.is_loaded());
//! }
//! ```

pub mod app;
pub mod cache;
pub mod client;
pub mod context;
pub mod error;
pub mod graft;
pub mod host;
pub mod pipeline;
pub mod process;
pub mod protocol;
pub mod reference;
pub mod registry;
pub mod serve;
pub mod shared;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use self::app::{App, AppEnvironment};
pub use self::cache::{ReattachDescriptor, ReattachStore};
pub use self::client::{Chain, ClientApi, HostClientApi, StaticChain};
pub use self::context::{CallContext, CancelToken};
pub use self::error::{
    AppError, CommandError, HostError, LinkError, LinkFailures, ServeError, ServiceError, Stage,
};
pub use self::graft::{
    Action, CommandBody, CommandHook, CommandNode, CommandTree, Invocation, link_apps,
};
pub use self::host::AppInterface;
pub use self::protocol::{
    CommandSpec, ExecutedCommand, ExecutedFlag, ExecutedHook, FlagKind, FlagSpec, HookSpec,
    Manifest,
};
pub use self::reference::ResolvedApp;
pub use self::registry::LoadedApps;
pub use self::serve::AppService;
pub use self::shared::Ownership;
