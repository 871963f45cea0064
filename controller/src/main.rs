#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use caddy_mesh_controller_core::Configurator;
use caddy_mesh_controller_k8s as k8s;
use clap::{Parser, Subcommand};
use kube::api::ListParams;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "caddy-mesh-controller", about = "Caddy Mesh controller")]
struct Args {
    #[clap(
        long,
        default_value = "caddy_mesh=info,warn",
        env = "CADDY_MESH_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the controller, keeping the proxy fleet synchronized with the
    /// cluster's services.
    Run {
        /// The namespace of the caddy-mesh-proxy service.
        proxy_namespace: String,

        /// Namespaces to exclude from watching.
        #[clap(long = "ignored-namespace")]
        ignored_namespaces: Vec<String>,
    },

    /// Install the caddy.mesh stub zone into the cluster DNS config.
    Init {
        /// The namespace of the caddy-mesh-proxy service.
        proxy_namespace: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        command,
    } = Args::parse();

    match command {
        Command::Init { proxy_namespace } => {
            log_format
                .try_init(log_level)
                .expect("must configure logging");
            let client = client.try_client().await?;
            k8s::dns::DnsPatcher::new(client)
                .patch(&proxy_namespace)
                .await
        }

        Command::Run {
            proxy_namespace,
            ignored_namespaces,
        } => {
            let mut runtime = kubert::Runtime::builder()
                .with_log(log_level, log_format)
                .with_admin(admin)
                .with_client(client)
                .build()
                .await?;

            let (keys_tx, keys_rx) = mpsc::unbounded_channel();
            let index = k8s::Index::shared(keys_tx.clone(), ignored_namespaces);

            let services = runtime.watch_all::<k8s::Service>(ListParams::default());
            tokio::spawn(
                kubert::index::namespaced(index.clone(), services)
                    .instrument(info_span!("services")),
            );

            let slices = runtime.watch_all::<k8s::EndpointSlice>(ListParams::default());
            tokio::spawn(
                kubert::index::namespaced(index, slices).instrument(info_span!("endpointslices")),
            );

            let client = runtime.client();
            let getter = k8s::ClusterServiceGetter::new(client.clone());
            let configurator = Arc::new(Configurator::new(Arc::new(getter)));
            let reconciler = k8s::Reconciler::new(
                client,
                configurator,
                proxy_namespace,
                keys_rx,
                keys_tx,
            );
            tokio::spawn(reconciler.run().instrument(info_span!("reconciler")));

            // Block on the shutdown signal, then wait for the background
            // tasks to complete before exiting.
            if runtime.run().await.is_err() {
                bail!("aborted");
            }
            Ok(())
        }
    }
}
