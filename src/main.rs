use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use persistent_agent::agent::events::{ChannelEvents, ExecutionEvent};
use persistent_agent::agent::execution::{ExecutionDeps, SessionInfo};
use persistent_agent::agent::service::AgentService;
use persistent_agent::config::{AgentProfile, EngineConfig, SearchConfig};
use persistent_agent::llm::{LlmConfig, create_provider};
use persistent_agent::store::{Database, LibSqlBackend};
use persistent_agent::tasks::{TaskManager, TaskStateAnalyzer};
use persistent_agent::tools::ToolRegistry;
use persistent_agent::tools::builtin::{
    BuiltinTools, HttpSearchBackend, SearchBackend, register_builtin_tools,
};

const LOCAL_USER: &str = "local-user";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let engine_config = EngineConfig::from_env()?;

    // Initialize tracing; keep the appender guard alive for the whole run
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match &engine_config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "persistent-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    };

    let llm_config = LlmConfig::from_env()?;
    let mut profile = AgentProfile::from_env()?;
    if std::env::var("PERSISTENT_AGENT_MODEL").is_err() {
        profile.model = llm_config.model.clone();
    }
    let search_config = SearchConfig::from_env()?;

    eprintln!("🤖 Persistent Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", profile.model);

    let llm = create_provider(&llm_config)?;

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&engine_config.db_path, engine_config.busy_timeout)
            .await
            .with_context(|| {
                format!("failed to open database at {}", engine_config.db_path.display())
            })?,
    );
    eprintln!("   Database: {}", engine_config.db_path.display());

    // ── Tools ────────────────────────────────────────────────────────────
    let manager = Arc::new(TaskManager::new(Arc::clone(&db)));
    let analyzer = Arc::new(TaskStateAnalyzer::new());
    let tools = Arc::new(ToolRegistry::new());
    let search = search_config.endpoint.as_ref().map(|endpoint| {
        eprintln!("   Search: {endpoint}");
        Arc::new(HttpSearchBackend::new(endpoint.clone())) as Arc<dyn SearchBackend>
    });
    register_builtin_tools(
        &tools,
        BuiltinTools {
            manager: Arc::clone(&manager),
            analyzer: Arc::clone(&analyzer),
            search,
            search_max_results: search_config.max_results,
            bridge: None,
        },
    );
    eprintln!("   Tools: {} registered", tools.count());

    let service = Arc::new(AgentService::new(
        ExecutionDeps {
            manager,
            llm,
            tools,
            analyzer,
        },
        engine_config.poll_interval,
    ));

    let (events, mut event_rx) = ChannelEvents::new();
    let events = Arc::new(events);

    // ── Startup Recovery ─────────────────────────────────────────────────
    let recovered = {
        let profile = profile.clone();
        service
            .recover_on_startup(
                move |session_id| {
                    Some((
                        SessionInfo {
                            session_id: session_id.to_string(),
                            user_id: LOCAL_USER.to_string(),
                            team_id: profile.team_id.clone(),
                        },
                        profile.clone(),
                    ))
                },
                events.clone(),
            )
            .await?
    };
    if !recovered.is_empty() {
        eprintln!("   Recovered {} interrupted session(s)", recovered.len());
    }

    eprintln!("   Type a message and press Enter. /stop, /resume, /status, /quit\n");

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(event);
        }
    });

    let mut current: Option<String> = recovered.into_iter().next();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprint!("> ");

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line.trim().to_string(),
                None => break,
            },
        };
        if line.is_empty() {
            eprint!("> ");
            continue;
        }

        let session = current.clone();
        match (line.as_str(), session.as_deref()) {
            ("/quit", _) => break,
            ("/stop", Some(id)) => service.stop_session(id).await?,
            ("/resume", Some(id)) => {
                let outcome = service.resume_session(id).await?;
                eprintln!("   resume: {outcome:?}");
            }
            ("/status", Some(id)) => {
                if let Some(state) = service.get_session_task_status(id).await? {
                    let queue = service.get_session_queue_info(id).await?;
                    let usage = service.session_context_usage(id).await?;
                    eprintln!(
                        "   {} | loops {} | mistakes {} | queued {} failed {} | context {:.0}%",
                        state.status,
                        state.current_loop_count,
                        state.consecutive_mistake_count,
                        queue.queued,
                        queue.failed,
                        usage.usage_ratio * 100.0
                    );
                }
            }
            (cmd, None) if cmd.starts_with('/') => eprintln!("   No session yet"),
            (_, Some(id)) if service.is_waiting_for_followup(id) => {
                service.submit_followup_answer(id, &line)?;
            }
            (_, Some(id)) => {
                let check = service.validate_message_submission(id, &line).await;
                if !check.can_submit {
                    eprintln!("   {}", check.reason.unwrap_or_default());
                    eprint!("> ");
                    continue;
                }
                service.submit_user_message(id, &line, LOCAL_USER).await?;
                if !service.active_session_ids().iter().any(|s| s == id) {
                    service.resume_session(id).await?;
                }
            }
            (_, None) => {
                let id = service
                    .start_new_session(profile.clone(), LOCAL_USER, &line, events.clone())
                    .await?;
                eprintln!("   session {id}");
                current = Some(id);
            }
        }
        eprint!("> ");
    }

    if let Some(id) = current {
        tracing::info!(session_id = %id, "Shutting down");
    }
    Ok(())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::Message { chunk, .. } => print!("{chunk}"),
        ExecutionEvent::ToolCall { call, .. } => eprintln!("\n   ⚙ {}", call.name),
        ExecutionEvent::ToolResult {
            call,
            output,
            is_error,
            ..
        } => {
            let preview: String = output.chars().take(200).collect();
            let marker = if is_error { "✗" } else { "✓" };
            eprintln!("   {marker} {}: {preview}", call.name);
        }
        ExecutionEvent::Complete { result, .. } => println!("\n{result}\n"),
        ExecutionEvent::Error { message, .. } => {
            eprintln!("\n   Error: {message} (type a message or /resume to continue)")
        }
        ExecutionEvent::FollowupQuestion {
            question,
            suggestions,
            ..
        } => {
            println!("\n{question}");
            for (i, s) in suggestions.iter().enumerate() {
                println!("  {}. {}", i + 1, s.answer);
            }
        }
    }
}
