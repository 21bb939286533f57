/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Read requests and the protocol-tagged URLs that describe them.

use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// The access protocols a read request can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadProtocol {
    /// A file on a local disk (`local://`).
    File,
    /// A WebHDFS-served file (`hdfs://`); recognized but served by an
    /// external collaborator, so the local readers reject it.
    Hdfs,
}

/// A half-open byte range of one protocol-tagged input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub job_ids: BTreeSet<u64>,
    pub protocol: ReadProtocol,
    pub host: String,
    pub port: u16,
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
    /// The disk the request is dispatched to.
    pub disk_id: u64,
}

impl ReadRequest {
    /// Builds a whole-object request from a `local://host/path` or
    /// `hdfs://host:port/path` URL. The port defaults to 0 when absent.
    pub fn from_url(
        url: &str,
        job_ids: impl IntoIterator<Item = u64>,
        length: u64,
        disk_id: u64,
    ) -> Result<Self> {
        let (protocol, rest) = match url.split_once("://") {
            Some(("local", rest)) => (ReadProtocol::File, rest),
            Some(("hdfs", rest)) => (ReadProtocol::Hdfs, rest),
            _ => bail!("unsupported read request URL {}", url),
        };

        let (authority, path) = rest
            .split_once('/')
            .with_context(|| format!("URL {} has no path component", url))?;
        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse()
                    .with_context(|| format!("bad port in URL {}", url))?,
            ),
            None => (authority.to_string(), 0),
        };

        Ok(ReadRequest {
            job_ids: job_ids.into_iter().collect(),
            protocol,
            host,
            port,
            path: PathBuf::from(format!("/{}", path)),
            offset: 0,
            length,
            disk_id,
        })
    }

    /// A local whole-file request.
    pub fn local_file(
        path: impl Into<PathBuf>,
        job_ids: impl IntoIterator<Item = u64>,
        length: u64,
        disk_id: u64,
    ) -> Self {
        ReadRequest {
            job_ids: job_ids.into_iter().collect(),
            protocol: ReadProtocol::File,
            host: String::new(),
            port: 0,
            path: path.into(),
            offset: 0,
            length,
            disk_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_url() -> Result<()> {
        let request = ReadRequest::from_url("local://node3/data/input/part-0", [1], 4096, 2)?;
        assert_eq!(request.protocol, ReadProtocol::File);
        assert_eq!(request.host, "node3");
        assert_eq!(request.port, 0);
        assert_eq!(request.path, PathBuf::from("/data/input/part-0"));
        assert_eq!(request.length, 4096);
        assert_eq!(request.disk_id, 2);
        Ok(())
    }

    #[test]
    fn test_hdfs_url_with_port() -> Result<()> {
        let request = ReadRequest::from_url("hdfs://namenode:50070/user/input", [1], 1, 0)?;
        assert_eq!(request.protocol, ReadProtocol::Hdfs);
        assert_eq!(request.host, "namenode");
        assert_eq!(request.port, 50070);
        Ok(())
    }

    #[test]
    fn test_bad_scheme_rejected() {
        assert!(ReadRequest::from_url("ftp://host/path", [1], 1, 0).is_err());
    }
}
