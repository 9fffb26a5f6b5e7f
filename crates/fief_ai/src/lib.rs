//! # Fief AI
//!
//! Computer players for the simulation core. Each driver runs on its own
//! thread, observes the game under the shared mutex and mutates it through
//! the same build/demolish/prioritize/attack operations a human player
//! uses — never through a private backdoor.
//!
//! ## Crate Structure
//!
//! - [`ai`] - the phase loop: economy build-out, maintenance, offense and
//!   priority tuning
//! - [`roadbuilder`] - extended road plotting with pass-through/splitting
//!   policies, candidate scoring and per-start plot caches
//! - [`arterial`] - post-hoc labelling of the flags that carry the bulk of
//!   the traffic into each inventory

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ai;
pub mod arterial;
pub mod roadbuilder;

pub use ai::AiPlayer;
pub use roadbuilder::{RoadBuilder, RoadOptions};
