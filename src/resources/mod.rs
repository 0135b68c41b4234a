//! Resource accounting: the platform's resource path space and the
//! multi-view booking ledger built on top of it.

pub mod accounter;
pub mod resource;
pub mod tree;

pub use accounter::{BookingMode, ResourceAccounter, UsageMap};
pub use resource::Resource;
pub use tree::{path_matches, ResourceTree};
