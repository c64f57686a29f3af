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

//! Standalone blob server: hosts the blobs under a local directory over
//! the exchange protocol.

use anyhow::Context;
use clap::Parser;
use nalu_blob::index::RocksBlobIndex;
use nalu_blob::BlobManager;
use nalu_common::conf::Config;
use nalu_exchange::BlobServer;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let conf = Config::parse();

    std::fs::create_dir_all(&conf.blob_dir).context("creating blob directory")?;
    std::fs::create_dir_all(&conf.index_dir).context("creating index directory")?;
    let index = Arc::new(RocksBlobIndex::open(&conf.index_dir).context("opening blob index")?);
    let manager = BlobManager::new(conf.clone(), index);
    manager.setup().await.context("blob manager setup")?;
    info!(
        "hosting {} blobs from {}",
        manager.completed_blob_hashes().len(),
        conf.blob_dir.display()
    );

    let listener = TcpListener::bind((conf.network_interface.as_str(), conf.tcp_port))
        .await
        .with_context(|| format!("binding {}:{}", conf.network_interface, conf.tcp_port))?;
    let server = Arc::new(BlobServer::new(manager.clone(), conf.payment_address.clone()));
    let serving = tokio::spawn(server.start(listener));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    serving.abort();
    manager.stop().await;
    Ok(())
}
