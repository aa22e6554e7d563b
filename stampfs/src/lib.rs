// Library crate for stampfs: a FUSE mount where every newly created file is written into its own
// time-stamped version directory and the visible name becomes a relative link to it.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod fuse;
pub mod handles;
pub mod observe;
pub mod resolver;
pub mod stamp;
pub mod types;
pub mod versioned;

pub use config::{Args, MountConfig};
pub use dispatch::Dispatcher;
pub use error::{Result, StampFsError};
pub use fuse::StampFuse;
pub use resolver::PathResolver;
pub use stamp::{StampGenerator, VersionStamp};
pub use versioned::{VersionedCreator, VersionedFile};
