//! Consistent Block Encrypter: a hash-verified, copy-on-write, encrypted
//! block device engine.
//!
//! The engine is organized the way the spec's pipeline is organized: a
//! [`translation`] module walks the versioned B-tree that maps virtual block
//! addresses to physical ones, [`free_tree`] hands out and reclaims physical
//! addresses, [`write_back`] re-hashes and relocates the dirty path on every
//! write, and [`sync_sb`] seals a generation into a fresh superblock slot.
//! [`library`] wires these into the single cooperative scheduling loop client
//! code drives by calling `execute` until it stops making progress.
//!
//! Everything below [`library`] is generic over the host-supplied
//! [`collab::BlockBackend`], [`collab::BlockCipher`] and [`collab::BlockHasher`]
//! traits, so the engine itself never touches a filesystem, a real cipher
//! implementation, or a wall clock.

pub mod block;
pub mod cache;
pub mod collab;
pub mod config;
pub mod crypto_dispatch;
pub mod error;
pub mod free_tree;
pub mod io_dispatch;
pub mod library;
pub mod pool;
pub mod primitive;
pub mod sync_sb;
pub mod superblock;
pub mod translation;
pub mod types;
pub mod vbd;
pub mod write_back;

pub use block::Block;
pub use collab::{BlockBackend, BlockCipher, BlockHasher};
pub use config::Config;
pub use error::{CbeError, CbeResult};
pub use library::{EngineState, Library};
pub use primitive::{Operation, Request, Tag};
pub use types::{Generation, Pba, Vba};
