#![forbid(unsafe_code)]

//! Shachain: the per-commitment secret construct of BOLT #3.
//!
//! Starting from a single 32-byte seed a party derives up to 2^48 secrets,
//! one per commitment transaction, and the counterparty stores every secret
//! it has been shown in at most 49 slots while retaining the ability to
//! recover any of them. The original description can be found in
//! https://github.com/rustyrussell/ccan/blob/master/ccan/crypto/shachain/design.txt

mod element;
mod error;
mod producer;
mod store;

pub use self::element::{Element, Index, MAX_HEIGHT, ROOT_INDEX, START_INDEX};
pub use self::error::Error;
pub use self::producer::RevocationProducer;
pub use self::store::RevocationStore;
