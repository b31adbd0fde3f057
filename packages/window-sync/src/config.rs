use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::net::SocketAddr;

use crate::protocol::{Channels, WindowLabel};

/// Process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub window_label: WindowLabel,
    pub sync_addr: SocketAddr,
    pub namespace: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            window_label: WindowLabel::from_label(
                &lookup("WINDOW_LABEL").unwrap_or_else(|| "main".to_string()),
            ),
            sync_addr: lookup("SYNC_ADDR")
                .unwrap_or_else(|| "127.0.0.1:7878".to_string())
                .parse()
                .context("SYNC_ADDR must be a socket address like 127.0.0.1:7878")?,
            namespace: lookup("SYNC_NAMESPACE").filter(|ns| !ns.trim().is_empty()),
        })
    }

    pub fn channels(&self) -> Channels {
        match &self.namespace {
            Some(namespace) => Channels::namespaced(namespace),
            None => Channels::new(),
        }
    }
}
