use std::sync::Arc;

use anyhow::{Context, Result};
use dicebot_endpoint::{
    generate_device_identity, DeviceProtocol, EndpointGateway, EndpointRegistry,
    EndpointStatusReport,
};
use tracing::{info, warn};

use crate::cli_args::{Cli, CliCommand, EndpointsCommand};
use crate::gateway_config::GatewayConfig;
use crate::onebot_session::OneBotWebsocketSession;

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let config = GatewayConfig::load(cli.config.as_deref())?.with_data_dir_override(cli.data_dir);
    match cli.command {
        CliCommand::Run { account_passwords } => run_gateway(&config, &account_passwords).await,
        CliCommand::Endpoints { command } => run_endpoints_command(&config, command).await,
        CliCommand::DeviceIdentity { protocol } => {
            let protocol = DeviceProtocol::parse(&protocol).unwrap_or_default();
            let identity = generate_device_identity(protocol)?;
            println!("{}", identity.to_json()?);
            Ok(())
        }
    }
}

fn build_gateway(config: &GatewayConfig) -> Result<EndpointGateway> {
    let registry_path = config.registry_path();
    let registry = EndpointRegistry::load(&registry_path)
        .with_context(|| format!("failed to load {}", registry_path.display()))?;
    let session = OneBotWebsocketSession::new(config.connect_timeout());
    Ok(EndpointGateway::new(
        config.endpoint_gateway_config()?,
        Arc::new(registry),
        Arc::new(session),
    ))
}

async fn run_gateway(config: &GatewayConfig, account_passwords: &[(String, String)]) -> Result<()> {
    let gateway = build_gateway(config)?;
    for (account, password) in account_passwords {
        match gateway.registry().find_by_account(account) {
            Some(endpoint) => gateway.set_password(endpoint.id(), Some(password))?,
            None => warn!(account = %account, "password supplied for unregistered account"),
        }
    }

    let started = gateway.start_enabled();
    info!(started, registered = gateway.registry().len(), "endpoint gateway running");
    println!(
        "dicebot gateway running: endpoints_started={started} data_dir={}",
        config.data_dir.display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    println!("dicebot gateway shutdown requested");
    gateway.shutdown().await;
    Ok(())
}

async fn run_endpoints_command(config: &GatewayConfig, command: EndpointsCommand) -> Result<()> {
    let gateway = build_gateway(config)?;
    match command {
        EndpointsCommand::List { json } => {
            let reports = gateway.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else if reports.is_empty() {
                println!("no endpoints registered");
            } else {
                for report in &reports {
                    println!("{}", render_status_line(report));
                }
            }
        }
        EndpointsCommand::AddManaged { account, name } => {
            let report = gateway.register_managed_endpoint(&account, None, &name)?;
            println!("{}", render_status_line(&report));
        }
        EndpointsCommand::AddTransport {
            platform,
            connect_url,
            name,
        } => {
            let report = gateway.register_transport_endpoint(&platform, &connect_url, &name)?;
            println!("{}", render_status_line(&report));
        }
        EndpointsCommand::Enable { id } => {
            gateway.registry().get(&id)?.update(|record| record.profile.enabled = true);
            gateway.registry().persist()?;
            println!("endpoint {id} enabled");
        }
        EndpointsCommand::Disable { id } => {
            gateway.disable(&id)?;
            println!("endpoint {id} disabled");
        }
        EndpointsCommand::Remove { id } => {
            let report = gateway.remove(&id).await?;
            println!("endpoint {} removed", report.id);
        }
        EndpointsCommand::Invalidate { id } => {
            let removed = gateway.invalidate_credentials(&id)?;
            println!("endpoint {id} credentials invalidated: session_token_removed={removed}");
        }
    }
    Ok(())
}

fn render_status_line(report: &EndpointStatusReport) -> String {
    let mut line = format!(
        "{} platform={} kind={} account={} name={} enabled={} login_succeeded={}",
        report.id,
        report.platform,
        report.connection_kind,
        if report.account_id.is_empty() {
            "-"
        } else {
            report.account_id.as_str()
        },
        if report.display_name.is_empty() {
            "-"
        } else {
            report.display_name.as_str()
        },
        report.enabled,
        report.login_succeeded,
    );
    if let Some(url) = report.connect_url.as_deref() {
        line.push_str(&format!(" connect_url={url}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::tempdir;

    fn cli(data_dir: &std::path::Path, args: &[&str]) -> Cli {
        let mut argv = vec![
            "dicebot-gateway".to_string(),
            "--data-dir".to_string(),
            data_dir.display().to_string(),
        ];
        argv.extend(args.iter().map(|arg| arg.to_string()));
        Cli::try_parse_from(argv).expect("parse")
    }

    #[tokio::test]
    async fn functional_endpoint_commands_edit_persisted_registry() {
        let temp = tempdir().expect("tempdir");
        run_cli(cli(
            temp.path(),
            &["endpoints", "add-managed", "--account", "10001", "--name", "dice"],
        ))
        .await
        .expect("add managed");

        let registry = EndpointRegistry::load(&temp.path().join("endpoints.json")).expect("load");
        let endpoint = registry.find_by_account("10001").expect("registered");
        assert!(!endpoint.is_enabled());
        let id = endpoint.id().to_string();

        run_cli(cli(temp.path(), &["endpoints", "enable", &id]))
            .await
            .expect("enable");
        let registry = EndpointRegistry::load(&temp.path().join("endpoints.json")).expect("load");
        assert!(registry.get(&id).expect("endpoint").is_enabled());
        assert!(!registry.get(&id).expect("endpoint").loop_attached());

        run_cli(cli(temp.path(), &["endpoints", "remove", &id]))
            .await
            .expect("remove");
        let registry = EndpointRegistry::load(&temp.path().join("endpoints.json")).expect("load");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn regression_unknown_endpoint_id_reports_error() {
        let temp = tempdir().expect("tempdir");
        let error = run_cli(cli(temp.path(), &["endpoints", "disable", "missing"]))
            .await
            .expect_err("unknown id");
        assert!(error.to_string().contains("unknown endpoint 'missing'"));
    }

    #[test]
    fn unit_status_line_shows_placeholders_for_blank_fields() {
        let registry = EndpointRegistry::in_memory();
        let endpoint = registry
            .insert(dicebot_endpoint::EndpointProfile::new_transport(
                "QQ",
                "ws://localhost:6700",
                "",
            ))
            .expect("insert");
        let line = render_status_line(&endpoint.status_report());
        assert!(line.contains("account=- name=-"));
        assert!(line.contains("kind=external_transport"));
        assert!(line.ends_with("connect_url=ws://localhost:6700"));
    }
}
