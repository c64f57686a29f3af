// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings for blob storage and exchange.
///
/// Every field can be provided as a command line flag or environment
/// variable; [`Default`] yields the same values as parsing no flags.
#[derive(Parser, Clone, Debug)]
pub struct Config {
    /// Directory where blob files are stored.
    #[clap(long, env, default_value = "blobs")]
    pub blob_dir: PathBuf,
    /// Directory for the persistent blob index.
    #[clap(long, env, default_value = "blob_index")]
    pub index_dir: PathBuf,
    /// Save blob files for hosting, otherwise download blobs to memory only.
    #[clap(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub save_blobs: bool,
    /// Track bandwidth usage.
    #[clap(long, env, default_value_t = true, action = clap::ArgAction::Set)]
    pub track_bandwidth: bool,
    /// Interface to bind for incoming blob requests.
    #[clap(long, env, default_value = "0.0.0.0")]
    pub network_interface: String,
    /// TCP port to listen on for incoming blob requests.
    #[clap(long, env, default_value_t = 3333)]
    pub tcp_port: u16,
    /// Timeout to establish a TCP connection to a peer, in seconds.
    #[clap(long, env, default_value_t = 3.0)]
    pub peer_connect_timeout: f64,
    /// Timeout to download a blob from a peer, in seconds.
    #[clap(long, env, default_value_t = 30.0)]
    pub blob_download_timeout: f64,
    /// Seconds an idle inbound connection is kept open.
    #[clap(long, env, default_value_t = 30.0)]
    pub idle_timeout: f64,
    /// Seconds allowed for sending one blob to a peer.
    #[clap(long, env, default_value_t = 60.0)]
    pub transfer_timeout: f64,
    /// Maximum number of peers to connect to while downloading a blob.
    #[clap(long, env, default_value_t = 4)]
    pub max_connections_per_download: usize,
    /// Seconds before fixed peers are added as download candidates.
    #[clap(long, env, default_value_t = 2.0)]
    pub fixed_peer_delay: f64,
    /// Static "address:port" peers appended to every download.
    #[clap(long, env, value_delimiter = ',')]
    pub fixed_peers: Vec<String>,
    /// Payment address advertised to peers requesting one.
    #[clap(long, env)]
    pub payment_address: Option<String>,
}

impl Config {
    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.peer_connect_timeout)
    }

    pub fn blob_download_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.blob_download_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.transfer_timeout)
    }

    pub fn fixed_peer_delay(&self) -> Duration {
        Duration::from_secs_f64(self.fixed_peer_delay)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blob_dir: PathBuf::from("blobs"),
            index_dir: PathBuf::from("blob_index"),
            save_blobs: true,
            track_bandwidth: true,
            network_interface: "0.0.0.0".to_string(),
            tcp_port: 3333,
            peer_connect_timeout: 3.0,
            blob_download_timeout: 30.0,
            idle_timeout: 30.0,
            transfer_timeout: 60.0,
            max_connections_per_download: 4,
            fixed_peer_delay: 2.0,
            fixed_peers: Vec::new(),
            payment_address: None,
        }
    }
}
