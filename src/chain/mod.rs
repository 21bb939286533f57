/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Write aggregation: tokens, the chainer and the coalescer.

mod chainer;
pub use chainer::*;

mod coalescer;
pub use coalescer::*;

mod token;
pub use token::*;
