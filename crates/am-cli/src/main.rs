use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

const DEFAULT_DATABASE: &str = "assignment_manager.db";
const DEFAULT_USER: &str = "admin";

#[derive(Parser)]
#[command(name = "am")]
#[command(about = "Assignment manager administration", long_about = None)]
struct Cli {
    /// SQLite database path (else `AM_DATABASE`)
    #[arg(long)]
    database: Option<PathBuf>,
    /// User the command runs as (else `AM_USER`)
    #[arg(long)]
    user: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the database, optionally seeding an admin user
    Init {
        #[arg(long)]
        admin: Option<String>,
    },
    /// Manage users
    User {
        #[command(subcommand)]
        action: UserCommands,
    },
    /// Manage projects
    Project {
        #[command(subcommand)]
        action: ProjectCommands,
    },
    /// Create tasks from a JSON file
    Upload {
        protocol: String,
        project: String,
        file: PathBuf,
        /// Assign the new tasks to this (new) assignment
        #[arg(long)]
        assignment: Option<String>,
    },
    /// Manage assignments
    Assignment {
        #[command(subcommand)]
        action: AssignmentCommands,
    },
    /// Work tasks
    Task {
        #[command(subcommand)]
        action: TaskCommands,
    },
    /// Filtered read, e.g. `am query tasks project=demo size>=50`
    Query { view: String, filters: Vec<String> },
    /// Clear cached vocabulary terms
    Reload,
}

#[derive(Subcommand)]
enum UserCommands {
    Add {
        name: String,
        #[arg(long = "permission")]
        permissions: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    Create {
        protocol: String,
        name: String,
        #[arg(long)]
        priority: Option<i64>,
        /// name=value
        #[arg(long = "prop")]
        properties: Vec<String>,
    },
    Activate { name: String },
    Deactivate { name: String },
    Reprioritize { name: String, priority: i64 },
    Delete { name: String },
}

#[derive(Subcommand)]
enum AssignmentCommands {
    Create {
        project: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "for")]
        for_user: Option<String>,
        #[arg(long)]
        tasks: Option<usize>,
        #[arg(long, default_value_t = false)]
        start: bool,
    },
    Start { name: String },
    Complete {
        name: String,
        #[arg(long, default_value_t = false)]
        allow_incomplete: bool,
    },
    Reset { name: String },
    Reassign { name: String, user: String },
    Closeout { name: String },
    Delete { name: String },
    /// Print the task list JSON
    Json { name: String },
}

#[derive(Subcommand)]
enum TaskCommands {
    Start {
        id: i64,
        #[arg(long)]
        disposition: Option<String>,
    },
    Complete {
        id: i64,
        #[arg(long)]
        disposition: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let database = cli
        .database
        .or_else(|| env_value("AM_DATABASE").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE));
    let user = cli
        .user
        .or_else(|| env_value("AM_USER"))
        .unwrap_or_else(|| DEFAULT_USER.to_string());
    let mut session = commands::Session::open(&database, &user)?;
    let output = match cli.command {
        Commands::Init { admin } => session.init(admin.as_deref())?,
        Commands::User { action } => match action {
            UserCommands::Add { name, permissions } => session.add_user(&name, &permissions)?,
        },
        Commands::Project { action } => match action {
            ProjectCommands::Create {
                protocol,
                name,
                priority,
                properties,
            } => session.create_project(&protocol, &name, priority, &properties)?,
            ProjectCommands::Activate { name } => session.set_project_active(&name, true)?,
            ProjectCommands::Deactivate { name } => session.set_project_active(&name, false)?,
            ProjectCommands::Reprioritize { name, priority } => {
                session.reprioritize(&name, priority)?
            }
            ProjectCommands::Delete { name } => session.delete_project(&name)?,
        },
        Commands::Upload {
            protocol,
            project,
            file,
            assignment,
        } => session.upload(&protocol, &project, &file, assignment.as_deref())?,
        Commands::Assignment { action } => match action {
            AssignmentCommands::Create {
                project,
                name,
                for_user,
                tasks,
                start,
            } => session.create_assignment(&project, name, for_user, tasks, start)?,
            AssignmentCommands::Start { name } => session.start_assignment(&name)?,
            AssignmentCommands::Complete {
                name,
                allow_incomplete,
            } => session.complete_assignment(&name, allow_incomplete)?,
            AssignmentCommands::Reset { name } => session.reset_assignment(&name)?,
            AssignmentCommands::Reassign { name, user } => {
                session.reassign_assignment(&name, &user)?
            }
            AssignmentCommands::Closeout { name } => session.close_out(&name)?,
            AssignmentCommands::Delete { name } => session.delete_assignment(&name)?,
            AssignmentCommands::Json { name } => session.assignment_json(&name)?,
        },
        Commands::Task { action } => match action {
            TaskCommands::Start { id, disposition } => {
                session.start_task(id, disposition.as_deref())?
            }
            TaskCommands::Complete { id, disposition } => {
                session.complete_task(id, disposition.as_deref())?
            }
        },
        Commands::Query { view, filters } => session.query(&view, &filters)?,
        Commands::Reload => session.reload()?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
