//! Low-level index plumbing: the on-disk blob store, the caching HTTP
//! session, and simple-index page parsing.

mod file_store;
mod html;
mod http;

pub use file_store::{nested_path, EntryLock, FileStore, StoreKey};
pub use html::{parse_project_page, project_key_from_url, ProjectPage};
pub use http::{CacheMode, CacheStatus, Http, HttpError, HttpResponse};
