use anyhow::{bail, Context, Result};
use clap::Parser;
use forgeflow::agent::{AgentRegistry, ProcessAgentInvoker};
use forgeflow::checkpoint;
use forgeflow::cli::{CheckpointsCommand, Cli, Command, ExecutionArgs, SessionsCommand};
use forgeflow::config::EngineConfig;
use forgeflow::context::ContextWindowManager;
use forgeflow::hooks::{CommandTestRunner, HookRegistry, TddEnforcementHook};
use forgeflow::work_item::WorkItem;
use forgeflow::workflow::WorkflowCatalog;
use forgeflow::{Orchestrator, RecoveryPolicy, RunOptions, WorkflowRun};
use forgeflow_sdk::{
    log_failure, log_info, log_phase_complete_console, log_phase_start_console, log_stats,
    log_warning, AgentInvoker, WorkflowEvent,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: bool) {
    let default = if verbose { "forgeflow=debug" } else { "forgeflow=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_catalog(config: &EngineConfig) -> Result<WorkflowCatalog> {
    let mut catalog = WorkflowCatalog::builtin().context("Invalid built-in workflow")?;
    if let Some(dir) = &config.workflows_dir {
        catalog
            .load_dir(dir)
            .with_context(|| format!("Failed to load workflows from {}", dir.display()))?;
    }
    Ok(catalog)
}

fn build_orchestrator(config: EngineConfig) -> Result<Orchestrator> {
    let catalog = build_catalog(&config)?;

    let invoker: Arc<dyn AgentInvoker> = Arc::new(ProcessAgentInvoker::new(
        &config.agent,
        ContextWindowManager::new(&config.context),
    ));
    let agent_ids: BTreeSet<String> = catalog
        .list()
        .flat_map(|definition| definition.phases.iter().map(|p| p.agent_id.clone()))
        .collect();
    let agents = AgentRegistry::new().with_shared(agent_ids.iter().map(String::as_str), invoker);

    let runner = Arc::new(CommandTestRunner::new(config.tdd.test_command.clone()));
    let hooks = HookRegistry::new().with_hook(Arc::new(TddEnforcementHook::new(
        config.tdd.test_generation_agent.clone(),
        runner,
    )));

    Ok(Orchestrator::new(catalog, agents, hooks, config))
}

fn run_options(execution: &ExecutionArgs, verbose: bool) -> Result<RunOptions> {
    let dir = execution
        .dir
        .canonicalize()
        .with_context(|| format!("Working directory {} not found", execution.dir.display()))?;
    Ok(RunOptions::new(dir)
        .with_recovery(execution.recovery_policy())
        .verbose(verbose))
}

async fn prompt_line(stdin: &mut Lines<BufReader<Stdin>>, prompt: &str) -> Result<String> {
    use std::io::Write;
    print!("{}", prompt);
    std::io::stdout().flush().ok();
    Ok(stdin
        .next_line()
        .await
        .context("Failed to read from stdin")?
        .unwrap_or_default()
        .trim()
        .to_string())
}

/// Consume the event stream, answering gates from stdin
async fn drive(
    orchestrator: &Orchestrator,
    mut run: WorkflowRun,
    execution: &ExecutionArgs,
) -> Result<()> {
    let session_id = run.session_id().to_string();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut completed = false;
    let mut running_total = 0.0_f64;

    log_info!("Session {}", session_id);

    loop {
        let event = tokio::select! {
            event = run.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                log_warning!("Cancelling session {}", session_id);
                orchestrator.cancel(&session_id).ok();
                continue;
            }
        };
        let Some(event) = event else { break };

        if execution.events_json {
            event.emit();
        }

        match &event {
            WorkflowEvent::WorkflowStarted {
                workflow_name,
                total_phases,
                resumed,
                ..
            } => {
                let verb = if *resumed { "Resuming" } else { "Starting" };
                log_info!("{} workflow '{}' ({} phases)", verb, workflow_name, total_phases);
            }
            WorkflowEvent::PhaseStarted {
                phase_index,
                agent_id,
                display_name,
                ..
            } => {
                log_phase_start_console!(phase_index + 1, display_name, agent_id);
            }
            WorkflowEvent::CostUpdate {
                current_cost_usd, ..
            } => {
                running_total = running_total.max(*current_cost_usd);
            }
            WorkflowEvent::PhaseCompleted {
                phase_index, result, ..
            } => {
                log_phase_complete_console!(phase_index + 1);
                log_stats!(result.turns_used, result.cost_usd, running_total);
            }
            WorkflowEvent::ApprovalRequired {
                phase_index,
                agent_id,
                ..
            } => {
                if execution.auto_approve {
                    log_info!("Auto-approving phase {} ({})", phase_index + 1, agent_id);
                    orchestrator.approve(&session_id)?;
                    continue;
                }
                let answer = prompt_line(
                    &mut stdin,
                    &format!(
                        "Approve phase {} ({})? [y = approve, anything else = reject reason]: ",
                        phase_index + 1,
                        agent_id
                    ),
                )
                .await?;
                if matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes") {
                    orchestrator.approve(&session_id)?;
                } else {
                    let reason = if answer.is_empty() {
                        "rejected by operator".to_string()
                    } else {
                        answer
                    };
                    orchestrator.reject(&session_id, reason)?;
                }
            }
            WorkflowEvent::WorkflowError {
                kind,
                message,
                recoverable,
                ..
            } => {
                log_failure!("{:?}: {}", kind, message);
                if *recoverable && execution.recovery_policy() == RecoveryPolicy::AwaitDecision {
                    let answer = prompt_line(&mut stdin, "[r]etry, [a]bort or [c]ancel? ").await?;
                    match answer.to_ascii_lowercase().as_str() {
                        "r" | "retry" => orchestrator.retry(&session_id)?,
                        "c" | "cancel" => orchestrator.cancel(&session_id)?,
                        _ => orchestrator.reject(&session_id, "aborted by operator")?,
                    }
                }
            }
            WorkflowEvent::WorkflowCompleted {
                total_cost_usd,
                total_turns,
                ..
            } => {
                completed = true;
                log_info!(
                    "Workflow completed: {} turns, ${:.4}",
                    total_turns,
                    total_cost_usd
                );
            }
        }
    }

    if !completed {
        bail!(
            "Workflow did not complete; inspect it with `forgeflow sessions show {}`",
            session_id
        );
    }
    Ok(())
}

async fn handle_sessions(config: &EngineConfig, command: SessionsCommand) -> Result<()> {
    let store_for = |dir: &Path| -> Result<forgeflow::session::SessionStore> {
        let dir = dir.canonicalize().with_context(|| format!("{} not found", dir.display()))?;
        Ok(forgeflow::session::SessionStore::new(config.sessions_dir(&dir)))
    };

    match command {
        SessionsCommand::List { dir } => {
            let sessions = store_for(&dir)?.list().await?;
            if sessions.is_empty() {
                log_info!("No sessions");
            }
            for s in sessions {
                println!(
                    "{}  {:<18} {:<10} phase {:<3} ${:<8.4} {}",
                    s.session_id,
                    s.status.as_str(),
                    s.workflow,
                    s.current_phase,
                    s.total_cost_usd,
                    s.description.lines().next().unwrap_or_default()
                );
            }
        }
        SessionsCommand::Show { id, dir } => {
            let Some(stored) = store_for(&dir)?.load(&id).await? else {
                bail!("Session {} not found", id);
            };
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        SessionsCommand::Delete { id, dir } => {
            if store_for(&dir)?.delete(&id).await? {
                log_info!("Deleted session {}", id);
            } else {
                log_warning!("Session {} not found", id);
            }
        }
        SessionsCommand::Cleanup {
            older_than_days,
            include_completed,
            dir,
        } => {
            let deleted = store_for(&dir)?
                .cleanup(older_than_days, include_completed)
                .await?;
            for id in &deleted {
                let tags = checkpoint::cleanup_checkpoints(&dir, id)
                    .await
                    .with_context(|| format!("Failed to delete checkpoints of {}", id))?;
                log_info!("Deleted session {} and {} checkpoint tags", id, tags.len());
            }
            if deleted.is_empty() {
                log_info!("Nothing to clean up");
            }
        }
    }
    Ok(())
}

async fn handle_checkpoints(command: CheckpointsCommand) -> Result<()> {
    match command {
        CheckpointsCommand::List { session, dir } => {
            for tag in checkpoint::list_checkpoints(&dir, &session).await? {
                println!("{}", tag);
            }
        }
        CheckpointsCommand::Cleanup { session, dir } => {
            let deleted = checkpoint::cleanup_checkpoints(&dir, &session).await?;
            for tag in &deleted {
                println!("{}", tag);
            }
            log_info!("Deleted {} checkpoint tags", deleted.len());
        }
        CheckpointsCommand::Rollback { tag, dir } => {
            checkpoint::rollback_to_checkpoint(&dir, &tag)
                .await
                .with_context(|| format!("Rollback to {} failed", tag))?;
            log_info!("Rolled back to {}", tag);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config =
        EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run(args) => {
            args.validate()?;
            let task = match (&args.task, &args.work_item) {
                (Some(task), _) => task.clone(),
                (None, Some(path)) => WorkItem::from_file(path)?.to_task_description(),
                (None, None) => bail!("one of --task or --work-item is required"),
            };
            let options = run_options(&args.execution, cli.verbose)?;
            let orchestrator = build_orchestrator(config)?;
            let run = orchestrator
                .run_workflow(&args.workflow, &task, options)
                .await?;
            drive(&orchestrator, run, &args.execution).await
        }
        Command::Resume(args) => {
            let options = run_options(&args.execution, cli.verbose)?;
            let orchestrator = build_orchestrator(config)?;
            let run = orchestrator
                .resume_workflow(args.session.as_deref(), options)
                .await?;
            drive(&orchestrator, run, &args.execution).await
        }
        Command::Sessions(command) => handle_sessions(&config, command).await,
        Command::Checkpoints(command) => handle_checkpoints(command).await,
        Command::Workflows => {
            for definition in build_catalog(&config)?.list() {
                println!("{}  {}", definition.name, definition.description);
                for (index, phase) in definition.phases.iter().enumerate() {
                    let mut notes = Vec::new();
                    if phase.requires_approval {
                        notes.push("approval".to_string());
                    }
                    notes.extend(phase.pre_phase_hook_ids.iter().map(|h| format!("pre:{}", h)));
                    notes.extend(phase.post_phase_hook_ids.iter().map(|h| format!("post:{}", h)));
                    let notes = if notes.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", notes.join(", "))
                    };
                    println!(
                        "  {}. {} ({}){}",
                        index + 1,
                        phase.display_name,
                        phase.agent_id,
                        notes
                    );
                }
            }
            Ok(())
        }
    }
}
