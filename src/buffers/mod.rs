/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The buffer substrate: aligned byte regions, KV buffers, chains and the
//! alignment carry-over machinery.

mod aligner;
pub use aligner::*;

mod base;
pub use base::*;

mod byte_stream;
pub use byte_stream::*;

mod kv;
pub use kv::*;

mod list;
pub use list::*;

mod table;
pub use table::*;
