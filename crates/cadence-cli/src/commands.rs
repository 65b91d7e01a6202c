//! Subcommand handlers. Output goes to stdout; diagnostics go through tracing.

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tracing::info;

use cadence_scheduler::{
    catalog, display, lifecycle,
    types::{DefinitionUpdate, JobKey},
    Controller, ScheduleInstance,
};

pub async fn tick(controller: &Controller) -> Result<()> {
    let report = controller.tick(Utc::now()).await?;
    let dispatched = report.dispatched.len();
    println!(
        "removed {}, discovered {}, dispatched {}, scheduled {}, digests {}, expired {}",
        report.removed,
        report.discovered,
        dispatched,
        report.scheduled,
        report.digests.sent,
        report.expired
    );
    report.join().await;
    Ok(())
}

pub async fn serve(controller: &Controller, tick_secs: u64) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(true);
        }
    });

    controller
        .run(std::time::Duration::from_secs(tick_secs.max(1)), shutdown_rx)
        .await;
    Ok(())
}

pub fn jobs(controller: &Controller) -> Result<()> {
    let store = controller.store();
    let definitions = store.list_definitions()?;
    if definitions.is_empty() {
        println!("No job definitions yet; run `cadence tick` to discover jobs.");
        return Ok(());
    }

    for def in definitions {
        let next = match store.active_instance(&def.id)? {
            Some(instance) => display::summary(&instance),
            None => "not scheduled".to_string(),
        };
        println!("{}  [{}]", def.key, def.cron_expression);
        println!("    {}", catalog::describe(controller.registry(), &def.key));
        println!("    {next}");
        if !def.recipients.is_empty() {
            println!(
                "    digest to {} every {} day(s){}",
                def.recipients.join(", "),
                def.digest_days,
                if def.error_only { ", errors only" } else { "" }
            );
        }
    }
    Ok(())
}

pub fn history(controller: &Controller, namespace: &str, name: &str, limit: usize) -> Result<()> {
    let key = JobKey::new(namespace, name);
    let store = controller.store();
    let def = store
        .get_definition(&key)?
        .with_context(|| format!("no definition for {key}"))?;

    for instance in store.recent_instances(&def.id, limit)? {
        println!("{}  {}{}", instance.id, display::summary(&instance), flag(&instance));
    }
    Ok(())
}

pub fn show(controller: &Controller, id: &str) -> Result<()> {
    let instance = controller
        .store()
        .get_instance(id)?
        .with_context(|| format!("no schedule {id}"))?;
    print_instance(&instance);
    Ok(())
}

pub async fn run(controller: &Controller, namespace: &str, name: &str) -> Result<()> {
    let key = JobKey::new(namespace, name);
    let instance = lifecycle::run_now(
        controller.store().as_ref(),
        controller.registry(),
        &key,
        Utc::now(),
    )
    .await?;
    print_instance(&instance);
    Ok(())
}

pub async fn run_instance(controller: &Controller, id: &str) -> Result<()> {
    let instance =
        lifecycle::run_instance(controller.store().as_ref(), controller.registry(), id).await?;
    print_instance(&instance);
    Ok(())
}

pub fn configure(
    controller: &Controller,
    namespace: &str,
    name: &str,
    update: DefinitionUpdate,
) -> Result<()> {
    let key = JobKey::new(namespace, name);
    let def = catalog::configure(controller.store().as_ref(), &key, &update)?;
    println!(
        "{}: cron '{}', retention {} day(s), digest every {} day(s), recipients [{}]{}",
        def.key,
        def.cron_expression,
        def.retention_days,
        def.digest_days,
        def.recipients.join(", "),
        if def.error_only { ", errors only" } else { "" }
    );
    Ok(())
}

fn flag(instance: &ScheduleInstance) -> &'static str {
    match instance.has_errors {
        Some(true) => "  [errors]",
        _ => "",
    }
}

fn print_instance(instance: &ScheduleInstance) {
    println!("{}  {}{}", instance.id, display::summary(instance), flag(instance));
    if !instance.result.is_empty() {
        println!("{}", instance.result);
    }
}
