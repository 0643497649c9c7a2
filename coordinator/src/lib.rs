#![allow(dead_code)]

pub mod block;
pub mod config;
pub mod coordinator;
pub mod de;
pub mod fs;
pub mod metainfo;
pub mod p2p;
pub mod store;
pub mod tracker;

mod actor;

pub const BLOCK_SIZE: usize = 0x4000;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use actor::CoordinatorActor;
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorState, Effect};
pub use metainfo::{BencodeMetainfo, Metainfo};
