use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    ResourceExt,
};

use mycontroller::{
    config::ConnectionConfig,
    labels::{LabelChange, LabelRequirement, LabelRules},
    types::ObjectKey,
};

#[derive(Parser, Debug)]
struct Cli {
    #[clap(flatten)]
    connection: ConnectionArgs,
    #[clap(subcommand)]
    subcommand: Commands,
}

/// API server connection. Without `--host`, kubeconfig discovery is used.
#[derive(Args, Debug)]
struct ConnectionArgs {
    /// CA certificate file
    #[clap(long, global = true)]
    ca_file: Option<PathBuf>,
    /// Client certificate file
    #[clap(long, global = true)]
    cert_file: Option<PathBuf>,
    /// Client key file
    #[clap(long, global = true)]
    key_file: Option<PathBuf>,
    /// API server host or IP
    #[clap(long, global = true)]
    host: Option<String>,
    /// API server port
    #[clap(long, global = true)]
    port: Option<u16>,
}

impl From<ConnectionArgs> for ConnectionConfig {
    fn from(args: ConnectionArgs) -> Self {
        ConnectionConfig {
            ca_file: args.ca_file,
            cert_file: args.cert_file,
            key_file: args.key_file,
            host: args.host,
            port: args.port,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List pods with their phase
    List(ListArgs),
    /// Show the label change the controller would make to a pod
    Check(CheckArgs),
}

#[derive(Args, Debug)]
struct ListArgs {
    #[clap(short, long, default_value = "kube-system")]
    namespace: String,
    /// List pods of every namespace
    #[clap(short = 'A', long)]
    all_namespaces: bool,
    #[clap(long, default_value_t = 100)]
    limit: u32,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Pod key, `namespace/name`
    key: String,
    #[clap(long, default_value = "mycontroller=mycontroller")]
    target_label: LabelRequirement,
    #[clap(long, default_value = "processed=processed")]
    result_label: LabelRequirement,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .compact()
        .without_time()
        .init();

    let cli = Cli::parse();

    let connection = ConnectionConfig::from(cli.connection);
    let kube_config = connection.kube_config().await?;
    let client: kube::Client = kube_config.try_into()?;

    match cli.subcommand {
        Commands::List(args) => cli_list(client, args).await,
        Commands::Check(args) => cli_check(client, args).await,
    }
}

async fn cli_list(client: kube::Client, args: ListArgs) -> Result<()> {
    let pod_api: Api<Pod> = if args.all_namespaces {
        Api::all(client)
    } else {
        Api::namespaced(client, &args.namespace)
    };
    let pods = pod_api
        .list(&ListParams::default().limit(args.limit))
        .await
        .context("failed to list pods")?;

    println!("namespace\t status\t\t name");
    for pod in pods {
        let phase = pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .unwrap_or("Unknown");
        println!(
            "{}\t {}\t {}",
            pod.namespace().unwrap_or_default(),
            phase,
            pod.name_any()
        );
    }

    Ok(())
}

async fn cli_check(client: kube::Client, args: CheckArgs) -> Result<()> {
    let key: ObjectKey = args.key.parse()?;
    if !key.is_complete() {
        return Err(anyhow!(
            "invalid pod key {:?}: either namespace or name is missing",
            args.key
        ));
    }
    let rules = LabelRules::new(args.target_label, args.result_label);

    let pod_api: Api<Pod> = Api::namespaced(client, &key.namespace);
    let pod = pod_api
        .get(&key.name)
        .await
        .with_context(|| format!("failed to get pod {}", key))?;

    match rules.desired_change(pod.labels()) {
        LabelChange::Add => println!("{}: would add {}", key, rules.result),
        LabelChange::Remove => println!("{}: would remove {}", key, rules.result),
        LabelChange::None => println!("{}: up to date", key),
    }

    Ok(())
}
