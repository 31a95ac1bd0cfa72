//! Elohim User Store - serialized user-record store
//!
//! Keeps one record per numeric identity (profile fields, experience, money
//! and free-form `banned` / `settings` / `data` maps) behind a write-through
//! cache, with every mutation funneled through a single worker.
//!
//! ## Architecture
//!
//! - **Serial mutation queue**: one worker task owns the cache and backend
//! - **Single-flight creator**: concurrent creates of one identity share a run
//! - **Write-through cache**: mutated only after the backend accepts a change
//! - **Path merge engine**: dotted-path updates become top-level patches
//!
//! ## Backends
//!
//! | Kind | Storage |
//! |------|---------|
//! | `document` | `users.sled/` |
//! | `relational` | `users.db` |
//! | `flat-file` | `usersData.json` |
//! | `memory` | none |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/elohim-user-store/
//! ├── usersData.json         # flat-file backend
//! ├── users.sled/            # document backend
//! ├── users.db               # relational backend
//! └── config.toml            # Configuration
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod merge;
pub mod path;
pub mod profile;
pub mod projection;
pub mod queue;
pub mod record;
pub mod single_flight;
pub mod store;

// Re-exports
pub use backend::{open_backend, Backend, BackendKind};
pub use config::Config;
pub use error::StoreError;
pub use merge::Change;
pub use path::FieldPath;
pub use profile::{NoProfileProvider, ProfileProvider};
pub use projection::{PathSelection, Projection, Query, QueryProjector, SelectionProjector};
pub use record::{parse_money, Patch, ProfileInfo, UserId, UserRecord};
pub use store::{StoreOptions, UserStore};
