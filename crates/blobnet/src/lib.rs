pub mod announce;
pub mod bitfield;
pub mod clock;
pub mod config;
pub mod conn;
pub mod dedup;
pub mod digest;
pub mod error;
pub mod hashring;
pub mod healthcheck;
pub mod hostlist;
pub mod metainfo;
pub mod picker;
pub mod scheduler;
pub mod store;
pub mod torrent;
pub mod transfer;

pub use announce::{AnnounceQueue, HttpTracker, Tracker};
pub use bitfield::Bitfield;
pub use config::Config;
pub use conn::{CloseReason, ConnState};
pub use digest::{Digest, PeerId, PeerInfo};
pub use error::{Error, Result};
pub use hashring::{Ring, RingConfig};
pub use healthcheck::{ActiveFilter, PassiveFilter};
pub use metainfo::{InfoHash, MetaInfo, MetaInfoGenerator, PieceLengths};
pub use scheduler::{ReloadableScheduler, Scheduler};
pub use store::PieceStore;
pub use torrent::{Torrent, TorrentState, TorrentStatus};
pub use transfer::{Backend, TagClient, Transferer};
