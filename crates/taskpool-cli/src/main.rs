mod cli;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use taskpool_core::app::ServiceBuilder;
use taskpool_core::config::EngineConfig;
use taskpool_core::domain::{ActorId, CollectionId, GroupId, ItemFlags, WorkflowItem};
use taskpool_core::impls::InMemoryDirectory;
use taskpool_core::observability::init_logging;
use taskpool_core::{PoolError, TaskDistributionService};
use tracing::info;

use crate::cli::{Cli, Command};

const WORKFLOW: &str = "default";
const STEP: &str = "review";
const ACTION: &str = "approve";
const ROLE: &str = "reviewer";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(cli.log_format.map(Into::into).unwrap_or(config.log_format));

    let directory = InMemoryDirectory::new();
    let service = ServiceBuilder::new()
        .with_configured_store(&config)
        .await?
        .with_directory(Arc::new(directory.clone()))
        .build()?;
    let service = Arc::new(service);
    info!(store = ?config.store, "engine ready");

    match cli.command {
        Command::Demo => demo(&service, &directory).await?,
        Command::Race { claimants } => race(&service, &directory, claimants).await?,
        Command::Status => {}
    }

    let counts = service.pool_counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

/// Register an item whose collection maps the reviewer role to `group`.
async fn reviewed_item(service: &TaskDistributionService, group: GroupId) -> Result<WorkflowItem> {
    let collection = CollectionId::random();
    service.set_collection_role(collection, ROLE, group).await?;
    let item = service
        .register_item(collection, ActorId::random(), ItemFlags::default())
        .await?;
    Ok(item)
}

async fn demo(service: &TaskDistributionService, directory: &InMemoryDirectory) -> Result<()> {
    let reviewers = GroupId::random();
    let (alice, bob) = (ActorId::random(), ActorId::random());
    directory.add_member(reviewers, alice).await;
    directory.add_member(reviewers, bob).await;

    let item = reviewed_item(service, reviewers).await?;
    service
        .open_step_for_role(item.id, WORKFLOW, STEP, ACTION, ROLE)
        .await?;

    println!("pool for alice: {} task(s)", service.pool_for(alice).await?.len());
    println!("pool for bob:   {} task(s)", service.pool_for(bob).await?.len());

    let claimed = service.claim(alice, item.id, STEP, ACTION).await?;
    println!("alice claimed {}", claimed.id);

    match service.claim(bob, item.id, STEP, ACTION).await {
        Err(PoolError::AlreadyClaimed { holder, .. }) => {
            println!("bob lost the claim (holder: {holder:?})")
        }
        Ok(task) => bail!("bob unexpectedly claimed {}", task.id),
        Err(other) => return Err(other.into()),
    }
    println!("pool for bob:   {} task(s)", service.pool_for(bob).await?.len());

    service.finish(alice, item.id, STEP).await?;
    println!(
        "finished: {}, in progress: {}",
        service.count_finished(item.id, STEP).await?,
        service.count_in_progress(item.id, STEP).await?
    );

    service.close_step(item.id, STEP).await?;
    let removed = service.unwrap(item.id).await?;
    println!("unwrapped {} submitted by {}", removed.id, removed.submitter);
    Ok(())
}

async fn race(
    service: &Arc<TaskDistributionService>,
    directory: &InMemoryDirectory,
    claimants: usize,
) -> Result<()> {
    if claimants == 0 {
        bail!("--claimants must be at least 1");
    }

    let group = GroupId::random();
    let actors: Vec<ActorId> = (0..claimants).map(|_| ActorId::random()).collect();
    for actor in &actors {
        directory.add_member(group, *actor).await;
    }
    let item = reviewed_item(service, group).await?;
    service.open_step(item.id, WORKFLOW, STEP, ACTION, group).await?;

    let item_id = item.id;
    let handles: Vec<_> = actors
        .into_iter()
        .map(|actor| {
            let service = Arc::clone(service);
            tokio::spawn(async move { service.claim(actor, item_id, STEP, ACTION).await })
        })
        .collect();

    let (mut won, mut lost) = (0usize, 0usize);
    for handle in handles {
        match handle.await? {
            Ok(_) => won += 1,
            Err(err) if err.is_already_claimed() => lost += 1,
            Err(err) => return Err(err.into()),
        }
    }

    println!("claimants: {claimants}, won: {won}, lost: {lost}");
    if won != 1 {
        bail!("expected exactly one winner, got {won}");
    }
    Ok(())
}
