/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The reader subsystem: read requests, blocking readers and the
//! asynchronous POSIX-AIO reader.

mod aio;
pub use aio::*;

mod byte_stream;
pub use byte_stream::*;

mod request;
pub use request::*;

mod whole_file;
pub use whole_file::*;
