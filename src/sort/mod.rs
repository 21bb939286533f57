/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Strategy-selected in-place sorting of KV buffers.

mod quick;
pub use quick::*;

mod radix;
pub use radix::*;

mod sorter;
pub use sorter::*;

mod strategy;
pub use strategy::*;
