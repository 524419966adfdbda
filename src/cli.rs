// ABOUTME: Command-line surface for drover: agents, tasks, dispatch, matching and sessions.
// ABOUTME: Commands run against an Engine and write human or JSON output to any writer.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use drover_agent::AgentMessage;
use drover_core::capability::{requirements_for_task, REQUIREMENTS_KEY};
use drover_core::{
    AgentCapabilities, AgentEntity, AgentRole, DispatchOptions, DispatchResult, Engine,
    MatchOptions, NewTask, RegisterAgent, SessionOptions, Task, TaskCapabilityRequirements,
    TaskFilter, TaskStatus, WorkerMode,
};
use futures_util::StreamExt;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;

/// Dispatch and supervise a fleet of AI coding-agent workers.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./drover.toml, then ~/.config/drover/drover.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register and inspect agents
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Create, list and assign tasks
    #[command(subcommand)]
    Task(TaskCommand),
    /// Dispatch a task; picks the best available worker when no agent is given
    Dispatch {
        task: String,
        agent: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
        /// Sender recorded on the notification
        #[arg(long = "by")]
        dispatched_by: Option<String>,
        /// Also start the agent's session with the task as prompt
        #[arg(long)]
        start_session: bool,
    },
    /// Rank agents against a task's capability requirements
    Match {
        task: String,
        /// Include ineligible agents
        #[arg(long)]
        all: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run and inspect agent sessions
    #[command(subcommand)]
    Session(SessionCommand),
    /// List configured providers and the modes they support
    Providers,
}

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    Register(RegisterArgs),
    List {
        #[arg(long)]
        role: Option<AgentRole>,
    },
    Show {
        /// Agent id or name
        agent: String,
    },
}

#[derive(Args, Debug)]
pub struct RegisterArgs {
    pub name: String,
    #[arg(long, default_value = "worker")]
    pub role: AgentRole,
    /// Worker mode: ephemeral or persistent
    #[arg(long)]
    pub mode: Option<WorkerMode>,
    #[arg(long, value_delimiter = ',')]
    pub skills: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub languages: Vec<String>,
    #[arg(long, default_value_t = 1)]
    pub max_tasks: u32,
    /// Provider name from the config
    #[arg(long)]
    pub provider: Option<String>,
    #[arg(long, default_value = "cli")]
    pub created_by: String,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommand {
    Create(CreateTaskArgs),
    List {
        /// Agent id or name
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long, conflicts_with = "assignee")]
        unassigned: bool,
        #[arg(long, value_delimiter = ',')]
        status: Vec<TaskStatus>,
    },
    Assign {
        task: String,
        /// Agent id or name
        agent: String,
    },
    Unassign {
        task: String,
    },
}

#[derive(Args, Debug)]
pub struct CreateTaskArgs {
    pub title: String,
    /// 1 (highest) to 5
    #[arg(long, default_value_t = drover_core::DEFAULT_PRIORITY)]
    pub priority: u8,
    #[arg(long = "require", value_delimiter = ',')]
    pub required_skills: Vec<String>,
    #[arg(long = "prefer", value_delimiter = ',')]
    pub preferred_skills: Vec<String>,
    #[arg(long = "require-lang", value_delimiter = ',')]
    pub required_languages: Vec<String>,
    #[arg(long = "prefer-lang", value_delimiter = ',')]
    pub preferred_languages: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Send one prompt to an agent's headless session and print the reply
    Run {
        /// Agent id or name
        agent: String,
        prompt: String,
        /// Continue the agent's last session
        #[arg(long)]
        resume: bool,
    },
    /// Print an agent's persisted transcript
    History {
        /// Agent id or name
        agent: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

/// Output helper honouring `--json`
pub struct Output<W: Write> {
    writer: W,
    json: bool,
}

impl<W: Write> Output<W> {
    pub fn new(writer: W, json: bool) -> Self {
        Self { writer, json }
    }

    /// JSON of `value` in json mode, otherwise the text lines
    fn emit<T: Serialize>(&mut self, value: &T, text: impl FnOnce() -> Vec<String>) -> Result<()> {
        if self.json {
            writeln!(self.writer, "{}", serde_json::to_string_pretty(value)?)?;
        } else {
            for line in text() {
                writeln!(self.writer, "{}", line)?;
            }
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn agent_line(agent: &AgentEntity) -> String {
    let mode = agent
        .worker_mode
        .map(|m| format!("/{}", m))
        .unwrap_or_default();
    let skills: Vec<&str> = agent.capabilities.skills.iter().map(|s| s.as_str()).collect();
    format!(
        "{}  {}{}  provider={}  skills=[{}]  max={}  id={}",
        agent.name,
        agent.role,
        mode,
        agent.provider,
        skills.join(","),
        agent.capabilities.max_concurrent_tasks,
        agent.id
    )
}

fn task_line(task: &Task) -> String {
    format!(
        "{}  [{}] p{}  {}{}",
        task.id,
        task.status,
        task.priority,
        task.title,
        task.assignee
            .as_deref()
            .map(|a| format!("  -> {}", a))
            .unwrap_or_default()
    )
}

fn dispatch_lines(result: &DispatchResult) -> Vec<String> {
    let mut lines = vec![
        format!(
            "Dispatched {} to {}{}",
            result.task.id,
            result.agent.name,
            if result.is_new_assignment {
                ""
            } else {
                " (already assigned)"
            }
        ),
        format!("Channel {}: {}", result.channel.name, result.notification.content),
    ];
    if let Some(ref session) = result.session {
        lines.push(format!("Session {} ({})", session.id, session.status));
    }
    lines
}

async fn require_task(engine: &Engine, id: &str) -> Result<Task> {
    engine
        .get_task(id)
        .await?
        .ok_or_else(|| anyhow!("Task not found: {}", id))
}

/// Run one command against the engine
pub async fn run<W: Write>(engine: &Engine, command: Commands, out: &mut Output<W>) -> Result<()> {
    match command {
        Commands::Agent(cmd) => run_agent(engine, cmd, out).await,
        Commands::Task(cmd) => run_task(engine, cmd, out).await,
        Commands::Dispatch {
            task,
            agent,
            priority,
            dispatched_by,
            start_session,
        } => {
            let options = DispatchOptions {
                priority,
                dispatched_by,
                start_session,
            };
            let result = match agent {
                Some(agent) => {
                    let agent = engine.resolve_agent(&agent).await?;
                    engine.dispatch(&task, &agent.id, options).await?
                }
                None => engine.smart_dispatch(&task, options).await?,
            };
            out.emit(&result, || dispatch_lines(&result))
        }
        Commands::Match { task, all, limit } => {
            let task = require_task(engine, &task).await?;
            let options = MatchOptions {
                eligible_only: !all,
                limit,
                ..Default::default()
            };
            let matches = engine.find_agents_for_task(&task.id, &options).await?;
            let rows: Vec<_> = matches
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "agent": m.agent.name,
                        "agentId": m.agent.id,
                        "match": m.result
                    })
                })
                .collect();
            out.emit(&rows, || {
                if matches.is_empty() {
                    return vec![format!("No agents match {:?}", requirements_for_task(&task))];
                }
                matches
                    .iter()
                    .map(|m| {
                        format!(
                            "{:>3}  {}{}",
                            m.result.score,
                            m.agent.name,
                            if m.result.is_eligible {
                                String::new()
                            } else {
                                format!("  missing {:?}", m.result.missing_required_skills)
                            }
                        )
                    })
                    .collect()
            })
        }
        Commands::Session(cmd) => run_session(engine, cmd, out).await,
        Commands::Providers => {
            let providers = engine.providers();
            let rows: Vec<_> = providers
                .names()
                .into_iter()
                .filter_map(|name| providers.get(name))
                .map(|p| serde_json::json!({ "name": p.name(), "modes": p.modes() }))
                .collect();
            out.emit(&rows, || {
                rows.iter()
                    .map(|r| format!("{}  {}", r["name"].as_str().unwrap_or_default(), r["modes"]))
                    .collect()
            })
        }
    }
}

async fn run_agent<W: Write>(
    engine: &Engine,
    cmd: AgentCommand,
    out: &mut Output<W>,
) -> Result<()> {
    match cmd {
        AgentCommand::Register(args) => {
            let mut request = RegisterAgent::new(args.name, args.role)
                .with_capabilities(AgentCapabilities::new(
                    args.skills,
                    args.languages,
                    args.max_tasks,
                ))
                .created_by(args.created_by);
            request.worker_mode = args.mode;
            if let Some(provider) = args.provider {
                request = request.with_provider(provider);
            }
            let agent = engine.register_agent(request).await?;
            out.emit(&agent, || vec![format!("Registered {}", agent_line(&agent))])
        }
        AgentCommand::List { role } => {
            let agents = match role {
                Some(role) => engine.get_agents_by_role(role).await?,
                None => engine.list_agents().await?,
            };
            out.emit(&agents, || agents.iter().map(agent_line).collect())
        }
        AgentCommand::Show { agent } => {
            let agent = engine.resolve_agent(&agent).await?;
            let workload = engine.get_agent_workload(&agent.id).await?;
            let session = engine.get_active_session(&agent.id);
            let value = serde_json::json!({
                "agent": agent,
                "workload": workload,
                "session": session,
            });
            out.emit(&value, || {
                let mut lines = vec![
                    agent_line(&agent),
                    format!(
                        "tasks: {} of {} ({:?})",
                        workload.total_tasks,
                        agent.capabilities.max_concurrent_tasks,
                        workload.by_status
                    ),
                ];
                if let Some(ref id) = agent.last_session_id {
                    lines.push(format!("last session: {}", id));
                }
                lines
            })
        }
    }
}

async fn run_task<W: Write>(engine: &Engine, cmd: TaskCommand, out: &mut Output<W>) -> Result<()> {
    match cmd {
        TaskCommand::Create(args) => {
            let requirements = TaskCapabilityRequirements {
                required_skills: args.required_skills,
                preferred_skills: args.preferred_skills,
                required_languages: args.required_languages,
                preferred_languages: args.preferred_languages,
            };
            let mut new_task = NewTask::new(args.title).with_priority(args.priority);
            if !requirements.is_empty() {
                new_task = new_task.with_metadata(serde_json::json!({
                    REQUIREMENTS_KEY: serde_json::to_value(&requirements)?
                }));
            }
            let task = engine.create_task(new_task).await?;
            out.emit(&task, || vec![format!("Created {}", task_line(&task))])
        }
        TaskCommand::List {
            assignee,
            unassigned,
            status,
        } => {
            let mut filter = match assignee {
                Some(agent) => TaskFilter::assigned_to(engine.resolve_agent(&agent).await?.id),
                None if unassigned => TaskFilter::unassigned(),
                None => TaskFilter::default(),
            };
            filter.statuses = status;
            let tasks = engine.list_tasks(&filter).await?;
            out.emit(&tasks, || tasks.iter().map(task_line).collect())
        }
        TaskCommand::Assign { task, agent } => {
            let agent = engine.resolve_agent(&agent).await?;
            let task = engine.assign_to_agent(&task, &agent.id).await?;
            out.emit(&task, || vec![format!("Assigned {}", task_line(&task))])
        }
        TaskCommand::Unassign { task } => {
            let task = engine.unassign_task(&task).await?;
            out.emit(&task, || vec![format!("Unassigned {}", task_line(&task))])
        }
    }
}

async fn run_session<W: Write>(
    engine: &Engine,
    cmd: SessionCommand,
    out: &mut Output<W>,
) -> Result<()> {
    match cmd {
        SessionCommand::Run {
            agent,
            prompt,
            resume,
        } => {
            let agent = engine.resolve_agent(&agent).await?;
            let options = SessionOptions::default()
                .with_prompt(prompt)
                .with_mode(drover_core::SessionMode::Headless);
            let info = if resume {
                engine.resume_session(&agent.id, options).await?
            } else {
                engine.spawn_or_resume_session(&agent.id, options).await?
            };
            let mut stream = engine
                .session_messages(&agent.id)
                .context("Session has no message stream")?;

            let mut transcript = Vec::new();
            while let Some(msg) = stream.next().await {
                let done = msg.is_result();
                transcript.push(msg);
                if done {
                    break;
                }
            }
            engine.close_session(&agent.id).await?;

            out.emit(&serde_json::json!({ "session": info, "messages": transcript }), || {
                transcript_lines(&transcript)
            })
        }
        SessionCommand::History { agent, limit } => {
            let agent = engine.resolve_agent(&agent).await?;
            let history = engine.get_session_history(&agent.id, limit).await?;
            out.emit(&history, || {
                history
                    .iter()
                    .map(|m| {
                        let body = m
                            .content
                            .clone()
                            .or_else(|| m.tool_name.clone())
                            .or_else(|| m.tool_output.clone())
                            .unwrap_or_default();
                        format!(
                            "{}  {:<11} {}",
                            m.created_at.format("%H:%M:%S"),
                            m.message_type.as_str(),
                            body
                        )
                    })
                    .collect()
            })
        }
    }
}

/// Readable lines for a finished turn; result text only when no assistant text arrived
fn transcript_lines(messages: &[AgentMessage]) -> Vec<String> {
    let mut lines = Vec::new();
    let mut saw_text = false;
    for msg in messages {
        match msg {
            AgentMessage::Assistant { content } => {
                saw_text = true;
                lines.push(content.clone());
            }
            AgentMessage::ToolUse { name, .. } => lines.push(format!("[tool] {}", name)),
            AgentMessage::ToolResult {
                is_error: true,
                content,
                ..
            } => lines.push(format!("[tool error] {}", content)),
            AgentMessage::Error { code, message } => {
                lines.push(format!("[error {:?}] {}", code, message))
            }
            AgentMessage::Result {
                text: Some(text), ..
            } if !saw_text => lines.push(text.clone()),
            _ => {}
        }
    }
    lines
}
