//! cuadrilla-core
//!
//! Shared agenda, member engagement (XP, levels, lives), newcomer
//! verification, the daily debate and the word game for a single group
//! chat. The chat platform and the language model are reached only through
//! the traits in [`platform`].

pub mod agenda;
pub mod app;
pub mod clock;
pub mod config;
pub mod debate;
pub mod error;
pub mod ledger;
pub mod leveling;
pub mod member;
pub mod pipeline;
pub mod platform;
pub mod scheduler;
pub mod store;
pub mod sweep;
pub mod testing;
pub mod tools;
pub mod verification;
pub mod word_game;

pub use error::{CollaboratorError, CoreError, CoreResult};
pub use member::{ChatId, MemberId, MemberRef, MessageId};
