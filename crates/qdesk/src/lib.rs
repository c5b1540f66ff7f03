//! Client-side data-access layer for named SQL and array-database
//! connections.
//!
//! The crate manages a persisted catalog of server identities, pools and
//! reuses network handles, and runs user queries with single-flight
//! enforcement, result-size guarding, best-effort cancellation, and
//! watched-expression refresh.
//!
//! The main pieces:
//! - [`ConnectionRegistry`]: the persisted, folder-organized server list.
//! - [`ConnectionManager`]: lazy per-server connection pools with a
//!   one-shot stale-handle retry.
//! - [`QueryDispatcher`]: one in-flight query per session, with the
//!   wrapped-reply protocol for the array-database dialect.
//! - [`WatchList`]: auxiliary expressions re-evaluated after every query.
//!
//! Backends plug in through the [`Driver`] and [`Connection`] traits,
//! registered per dialect in a [`DriverRegistry`]; the crate itself links
//! no database client library.

pub mod codec;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod pool;
pub mod registry;
pub mod server;
pub mod store;
pub mod watch;

pub use dispatch::{DispatchListener, DispatchOptions, QueryDispatcher, QueryResult};
pub use driver::{Connection, Cursor, Dialect, Driver, DriverRegistry, Value};
pub use error::{QdeskError, Result};
pub use pool::{Authenticator, ConnectionListener, ConnectionManager, Credentials, PoolOptions};
pub use registry::{ConnectionRegistry, RegistryListener};
pub use server::{clean_folder_name, DialectTag, ServerColor, ServerConfig};
pub use store::{FileSettingsStore, MemoryStore, SettingsStore};
pub use watch::{WatchList, WatchedExpression};
