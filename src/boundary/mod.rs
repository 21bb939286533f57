/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The distributed partition-boundary protocol: per-node boundary
//! scanning, cluster-wide median decision, and the boundary key lists the
//! production partitioner searches.

mod decider;
pub use decider::*;

mod deserializer;
pub use deserializer::*;

mod key_list;
pub use key_list::*;

mod partitioner;
pub use partitioner::*;

mod scanner;
pub use scanner::*;
