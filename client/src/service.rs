//! Client service: dispatches to the send or receive flow.

use std::path::PathBuf;

use anyhow::bail;

use freighter_core::tls::{self, TlsConnector};
use freighter_core::wire::is_valid_frame_size;

use crate::{recv, send};

pub struct Options {
    pub server_addr: String,
    pub id: String,
    pub send_file: Option<PathBuf>,
    pub recv_file: Option<PathBuf>,
    pub frame_size: usize,
    pub cache_count: u32,
}

impl Options {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.send_file.is_none() && self.recv_file.is_none() {
            bail!("send_file or recv_file is required");
        }
        if self.id.is_empty() {
            bail!("id is required");
        }
        if !is_valid_frame_size(self.frame_size) {
            bail!("frame_size must be in 1..=65535");
        }
        Ok(())
    }
}

pub struct Service {
    options: Options,
    connector: TlsConnector,
}

impl Service {
    pub fn new(options: Options) -> anyhow::Result<Self> {
        options.check()?;
        Ok(Self {
            options,
            connector: tls::connector(),
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let op = &self.options;
        if let Some(path) = &op.send_file {
            send::send_file(
                &self.connector,
                &op.server_addr,
                &op.id,
                path,
                op.frame_size,
                op.cache_count,
            )
            .await
        } else if let Some(path) = &op.recv_file {
            recv::recv_file(
                &self.connector,
                &op.server_addr,
                &op.id,
                path,
                op.cache_count,
            )
            .await
        } else {
            bail!("send_file or recv_file is required")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Options {
        Options {
            server_addr: "127.0.0.1:7777".to_string(),
            id: "abc".to_string(),
            send_file: Some(PathBuf::from("/tmp/f")),
            recv_file: None,
            frame_size: 5120,
            cache_count: 512,
        }
    }

    #[test]
    fn test_options_require_a_direction() {
        let mut op = base();
        op.send_file = None;
        assert!(op.check().is_err());

        op.recv_file = Some(PathBuf::from("/tmp/out"));
        assert!(op.check().is_ok());
    }

    #[test]
    fn test_options_validate_frame_size() {
        let mut op = base();
        op.frame_size = 0;
        assert!(op.check().is_err());
        op.frame_size = 65536;
        assert!(op.check().is_err());
        op.frame_size = 1;
        assert!(op.check().is_ok());
    }

    #[test]
    fn test_options_require_id() {
        let mut op = base();
        op.id = String::new();
        assert!(op.check().is_err());
    }
}
