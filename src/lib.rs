pub mod clock;
pub mod commands;
pub mod config;
pub mod db;
pub mod dict;
pub mod error;
pub mod event;
pub mod glob;
pub mod lazyfree;
pub mod object;
pub mod packed;
pub mod propagate;
pub mod pubsub;
pub mod quicklist;
pub mod server;
pub mod util;

/// Connection identifier; stable for the life of the connection.
pub type ClientId = u64;

pub use config::Config;
pub use db::Db;
pub use dict::Dict;
pub use error::{NetError, ReplyError};
pub use event::EventLoop;
pub use object::{Encoding, Object, ObjectType, Value};
pub use packed::{PackedList, PackedValue};
pub use propagate::{NullPropagator, Propagator, RecordingPropagator};
pub use pubsub::PubSub;
pub use quicklist::Quicklist;
pub use server::{Client, Server};
