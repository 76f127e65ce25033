mod commands;

use clap::Parser;
use vpsie_autoscaler::cli::{Cli, Commands, CrdAction, WebhookAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Operator(args) => init_tracing(&args.log_level, &args.log_format),
        Commands::Webhook { action: WebhookAction::Serve(_) } => init_tracing("info", "console"),
        _ => {}
    }

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check => commands::check::run().await?,
        Commands::Operator(args) => commands::operator::run(args).await?,
        Commands::Webhook { action } => match action {
            WebhookAction::Serve(args) => {
                commands::webhook::serve(&args.addr, &args.tls_cert, &args.tls_key, &args.operator_namespace).await?;
            }
            WebhookAction::CertGenerate { service_name, namespace, output_dir, ip_sans } => {
                commands::webhook::generate_certs(&service_name, &namespace, &output_dir, &ip_sans)?;
            }
            WebhookAction::InstallConfig { service_name, namespace, ca_bundle_path } => {
                commands::webhook::install_config(&service_name, &namespace, &ca_bundle_path)?;
            }
        },
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::ScaleDown { action } => match action {
            vpsie_autoscaler::cli::ScaleDownAction::Simulate { namespace, pool_name } => {
                commands::scale_down::simulate(&namespace, &pool_name).await?;
            }
        },
    }

    Ok(())
}

fn init_tracing(log_level: &str, log_format: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
