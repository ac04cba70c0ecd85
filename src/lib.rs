pub mod access;
pub mod cli;
pub mod config;
pub mod error;
pub mod git;
pub mod model;
pub mod mutation;
pub mod provider;
pub mod reconcile;
pub mod search;

pub use access::{Access, RemoteHost, SessionFs};
pub use config::Config;
pub use error::{Result, StorageError};
pub use model::{
    DeleteOutcome, Message, MessagePage, MessageRole, MessageWindow, PageRequest, SearchHit,
    SearchMatchType, SearchMode, SessionPage, SessionRecord,
};
pub use provider::{ProviderRegistry, SessionProvider};
