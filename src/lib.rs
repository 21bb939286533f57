/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

#![doc = include_str!("../README.md")]
#![deny(unstable_features)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(clippy::empty_loop)]
#![deny(unreachable_code)]
#![deny(unreachable_patterns)]
#![deny(unused_macro_rules)]

pub(crate) mod aio;
pub mod boundary;
pub mod buffers;
pub mod chain;
pub mod config;
pub mod convert;
pub mod coordinator;
pub mod direct;
pub mod map;
pub mod memory;
pub mod merge;
pub mod pipeline;
pub mod provenance;
pub mod read;
pub mod reduce;
pub mod shuffle;
pub mod sort;
pub mod stage;
pub mod tuple;
pub mod write;

/// Prelude module to import everything from this crate
pub mod prelude {
    pub use crate::boundary::*;
    pub use crate::buffers::*;
    pub use crate::chain::*;
    pub use crate::config::*;
    pub use crate::convert::*;
    pub use crate::coordinator::*;
    pub use crate::map::*;
    pub use crate::memory::*;
    pub use crate::merge::*;
    pub use crate::provenance::*;
    pub use crate::read::*;
    pub use crate::reduce::*;
    pub use crate::shuffle::*;
    pub use crate::sort::*;
    pub use crate::stage::*;
    pub use crate::write::*;
}
