use anyhow::Result;
use kube::Client;
use owo_colors::OwoColorize;

mod agents;
mod context_resolver;
mod cron;
mod pod_builder;
mod tasks;
mod util;
mod workflow_runs;

#[tokio::main]
async fn main() -> Result<()> {
    kubetask_common::init();
    util::metrics::maybe_spawn_metrics_server().await;

    let client = Client::try_default().await?;

    println!("{}", "🚀 kubetask-operator starting up".green());

    let result = tokio::try_join!(
        tasks::run(client.clone()),
        workflow_runs::run(client.clone()),
        cron::run_crontask(client.clone()),
        cron::run_cronworkflow(client.clone()),
        agents::run(client.clone()),
    )
    .map_err(anyhow::Error::from);

    if let Err(ref e) = result {
        eprintln!("{} {}", "🛑 a controller exited with error:".red(), e);
    }
    result?;

    println!("{}", "🛑 kubetask-operator shut down gracefully".red());
    Ok(())
}
