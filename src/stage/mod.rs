/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The worker/stage framework: typed bounded queues and the pull policies
//! workers are driven by.

mod queue;
pub use queue::*;

mod worker;
pub use worker::*;
