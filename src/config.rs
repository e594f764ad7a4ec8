use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;

use crate::{
    framing::DEFAULT_MAX_FRAME_BYTES,
    graph::DEFAULT_PHOTO_URL,
    inject::DEFAULT_URL_PATTERN,
    link::BrokerLaunch,
    manifest,
    protocol::HOST_NAME,
};

#[derive(Debug, Parser, Clone)]
#[command(name = "entra-sso-bridge")]
#[command(about = "Injects Entra ID PRT SSO cookies obtained from a local identity broker")]
pub struct Config {
    /// Native messaging host name of the broker.
    #[arg(long, global = true, default_value = HOST_NAME)]
    pub host_name: String,

    /// Start this executable instead of resolving the host manifest.
    #[arg(long, global = true)]
    pub broker_command: Option<PathBuf>,

    #[arg(long = "broker-arg", global = true)]
    pub broker_args: Vec<String>,

    /// Extension id handed to the broker, as a browser would.
    #[arg(long, global = true, default_value = "entra-sso-bridge")]
    pub extension_id: String,

    /// Extra manifest directory, searched before the standard ones.
    #[arg(long = "manifest-dir", global = true)]
    pub manifest_dirs: Vec<PathBuf>,

    #[arg(long, global = true, default_value = DEFAULT_URL_PATTERN)]
    pub url_pattern: String,

    #[arg(long, global = true, default_value = "127.0.0.1")]
    pub bind: String,

    #[arg(long, global = true, default_value_t = 3977)]
    pub port: u16,

    /// 0 waits for the broker indefinitely.
    #[arg(long, global = true, default_value_t = 0)]
    pub request_timeout_ms: u64,

    #[arg(long, global = true, default_value = DEFAULT_PHOTO_URL)]
    pub graph_photo_url: String,

    #[arg(long, global = true, default_value_t = false)]
    pub no_avatar: bool,

    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[arg(long, global = true, default_value_t = false)]
    pub json_events: bool,

    #[arg(long, global = true, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    #[arg(long, global = true, env = "SSO_BRIDGE_API_KEY")]
    pub api_key: Option<String>,
}

impl Config {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn broker_launch(&self) -> Result<BrokerLaunch> {
        if let Some(program) = &self.broker_command {
            return Ok(BrokerLaunch {
                program: program.clone(),
                args: self.broker_args.clone(),
            });
        }

        let search = manifest::search_dirs(&self.manifest_dirs);
        let host = manifest::resolve(&self.host_name, &search)
            .with_context(|| format!("cannot locate broker host {:?}", self.host_name))?;
        if !host.manifest.allows(&self.extension_id) {
            tracing::warn!(
                target = "sso_bridge::config",
                extension_id = %self.extension_id,
                manifest = %host.manifest_path.display(),
                "extension id is not in the manifest allow list"
            );
        }
        let mut launch = BrokerLaunch::from_manifest(&host, &self.extension_id);
        launch.args.extend(self.broker_args.iter().cloned());
        Ok(launch)
    }
}
