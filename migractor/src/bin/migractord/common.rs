/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use clap::Parser;
use migractor::config::RuntimeConfig;
use migractor::reference::RuntimeUrl;
use migractor::remote::RuntimeDirectory;
use migractor::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(about = "Starts a migractor runtime and keeps it alive")]
pub struct Args {
    #[arg(
        long,
        help = "The url of a parent runtime to register with, e.g. `pamr://host:1099/PA_JVM42`"
    )]
    pub parent: Option<String>,

    #[arg(
        long,
        help = "The number of nodes to pre-create. Defaults to the machine's available parallelism"
    )]
    pub capacity: Option<usize>,

    #[arg(
        long,
        default_value_t = -1,
        help = "The deployment this runtime belongs to"
    )]
    pub deployment_id: i64,

    #[arg(
        long,
        default_value_t = -1,
        help = "The topology slot within the deployment"
    )]
    pub topology_id: i64,

    #[arg(
        long,
        help = "Exit after the startup sequence instead of staying alive"
    )]
    pub no_stay_alive: bool,
}

impl Args {
    pub fn into_config(self) -> RuntimeConfig {
        let mut config = RuntimeConfig::default()
            .with_deployment(self.deployment_id, self.topology_id)
            .with_stay_alive(!self.no_stay_alive);
        if let Some(capacity) = self.capacity {
            config = config.with_capacity(capacity);
        }
        config
    }
}

pub async fn main_impl(args: Args) -> Result<(), anyhow::Error> {
    let parent = args.parent.clone();
    let runtime = Runtime::new(args.into_config());
    let directory = RuntimeDirectory::new();
    directory.expose(&runtime);

    let nodes = runtime.create_capacity_nodes()?;
    tracing::info!(
        url = %runtime.url(),
        nodes = nodes.len(),
        "runtime ready"
    );

    let parent_url = match &parent {
        Some(parent) => Some(parent.parse::<RuntimeUrl>()?),
        None => None,
    };
    if let Some(parent_url) = &parent_url {
        match directory.lookup_local(parent_url) {
            Some(parent_runtime) => {
                parent_runtime.register_peer(runtime.registration());
                tracing::info!(parent = %parent_url, "registered with parent runtime");
            }
            None => {
                tracing::warn!(
                    parent = %parent_url,
                    "parent runtime is not reachable in this process; skipping registration"
                );
            }
        }
    }

    if runtime.config().stay_alive {
        tracing::info!("running until interrupted");
        tokio::signal::ctrl_c().await?;
        tracing::info!("interrupt received; shutting down");
    }

    if let Some(parent_url) = &parent_url {
        if let Some(parent_runtime) = directory.lookup_local(parent_url) {
            parent_runtime.unregister_peer(runtime.url());
        }
    }
    runtime.kill(true);
    Ok(())
}
