/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The writer subsystem: partition file naming, blocking and
//! asynchronous direct-I/O writers.

mod aio_writer;
pub use aio_writer::*;

mod blocking;
pub use blocking::*;

mod files;
pub use files::*;

mod namer;
pub use namer::*;
