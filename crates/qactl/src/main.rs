//! qactl - CLI client for qad
//!
//! Drives the QA test execution workflow through the daemon's HTTP API.

mod client;
mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use client::{
    Client, ClientError, CreateAssignmentRequest, ExecutionUpdateRequest, TestDefinition,
};
use qa_core::{Role, StepResult};

/// CLI client for the qad workflow daemon.
#[derive(Parser)]
#[command(name = "qactl")]
#[command(about = "Assign and execute QA tests through qad")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7710)
    #[arg(long, global = true, env = "QAD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "QAD_TOKEN")]
    token: Option<String>,

    /// Organization to act in
    #[arg(long, global = true, env = "QA_ORG")]
    org: Option<String>,

    /// User id to act as
    #[arg(long, global = true, env = "QA_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a member to the organization or change their role
    Member {
        /// User id
        user_id: String,

        /// Role: admin, manager, tester, or viewer
        #[arg(value_parser = parse_role)]
        role: Role,
    },

    /// Manage test definitions
    Test {
        #[command(subcommand)]
        command: TestCommand,
    },

    /// Assign a test to a member
    Assign {
        /// Test ID
        test_id: String,

        /// Member to assign
        assignee: String,

        /// Due date (RFC 3339)
        #[arg(long)]
        due: Option<DateTime<Utc>>,

        /// Assignment notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// List the assignments of a test visible to you
    List {
        /// Test ID
        test_id: String,
    },

    /// Start or resume an execution of a test
    Start {
        /// Test ID
        test_id: String,

        /// Assignee (defaults to yourself)
        #[arg(long)]
        assignee: Option<String>,
    },

    /// Record the verdict of one step
    Step {
        /// Assignment ID
        assignment_id: String,

        /// Zero-based step index
        index: u32,

        /// Verdict: pass, fail, or skip
        status: String,

        /// Step notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Save progress without finishing
    Save {
        /// Assignment ID
        assignment_id: String,

        /// File with step results (JSON or YAML list)
        #[arg(long)]
        steps: Option<PathBuf>,

        /// Assignment notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Finish an execution
    Finish {
        /// Assignment ID
        assignment_id: String,

        /// File with step results (JSON or YAML list)
        #[arg(long)]
        steps: Option<PathBuf>,

        /// Assignment notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// Reset an assignment for a new attempt
    Reassign {
        /// Assignment ID
        assignment_id: String,
    },

    /// Delete an assignment
    Delete {
        /// Assignment ID
        assignment_id: String,
    },

    /// Show pass statistics for a test
    Stats {
        /// Test ID
        test_id: String,
    },

    /// Show the manager dashboard for a test
    Dashboard {
        /// Test ID
        test_id: String,
    },

    /// Show the judgments of one assignment
    Summary {
        /// Assignment ID
        assignment_id: String,
    },

    /// Show detailed information about an assignment
    Show {
        /// Assignment ID
        assignment_id: String,
    },

    /// List archived attempts of an assignment
    History {
        /// Assignment ID
        assignment_id: String,
    },

    /// List audit events of an assignment
    Events {
        /// Assignment ID
        assignment_id: String,
    },
}

#[derive(Subcommand)]
enum TestCommand {
    /// Create or replace a test from a JSON or YAML file
    Put {
        /// Path to the test definition
        file: PathBuf,

        /// Test ID (overrides `id` in the file)
        #[arg(long)]
        id: Option<String>,
    },
}

fn parse_role(s: &str) -> Result<Role, String> {
    Role::parse(&s.to_lowercase()).ok_or_else(|| {
        format!(
            "invalid role '{}', expected: admin, manager, tester, viewer",
            s
        )
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (org, user) = match (cli.org, cli.user) {
        (Some(org), Some(user)) => (org, user),
        (None, _) => {
            eprintln!("error: no organization given (use --org or set QA_ORG)");
            std::process::exit(1);
        }
        (_, None) => {
            eprintln!("error: no user given (use --user or set QA_USER)");
            std::process::exit(1);
        }
    };

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7710".to_string());
    let client = Client::new(&addr, cli.token.as_deref(), &org, &user);

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Member { user_id, role } => run_member(&client, &user_id, role).await,
        Command::Test {
            command: TestCommand::Put { file, id },
        } => run_test_put(&client, &file, id).await,
        Command::Assign {
            test_id,
            assignee,
            due,
            notes,
        } => run_assign(&client, &test_id, assignee, due, notes).await,
        Command::List { test_id } => run_list(&client, &test_id).await,
        Command::Start { test_id, assignee } => run_start(&client, &test_id, assignee).await,
        Command::Step {
            assignment_id,
            index,
            status,
            notes,
        } => run_step(&client, &assignment_id, index, &status, notes).await,
        Command::Save {
            assignment_id,
            steps,
            notes,
        } => run_save(&client, &assignment_id, steps, notes, false).await,
        Command::Finish {
            assignment_id,
            steps,
            notes,
        } => run_save(&client, &assignment_id, steps, notes, true).await,
        Command::Reassign { assignment_id } => run_reassign(&client, &assignment_id).await,
        Command::Delete { assignment_id } => run_delete(&client, &assignment_id).await,
        Command::Stats { test_id } => run_stats(&client, &test_id).await,
        Command::Dashboard { test_id } => run_dashboard(&client, &test_id).await,
        Command::Summary { assignment_id } => run_summary(&client, &assignment_id).await,
        Command::Show { assignment_id } => run_show(&client, &assignment_id).await,
        Command::History { assignment_id } => run_history(&client, &assignment_id).await,
        Command::Events { assignment_id } => run_events(&client, &assignment_id).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run_member(client: &Client, user_id: &str, role: Role) -> Result<(), ClientError> {
    let member = client.put_member(user_id, role).await?;
    render::print_member(&member);
    Ok(())
}

async fn run_test_put(
    client: &Client,
    file: &Path,
    id: Option<String>,
) -> Result<(), ClientError> {
    let def = load_test_definition(file)?;
    let test_id = id.or_else(|| def.id.clone()).ok_or_else(|| {
        ClientError::InvalidInput(format!(
            "{} has no id; pass --id or add an `id` field",
            file.display()
        ))
    })?;
    let test = client.put_test(&test_id, &def).await?;
    render::print_test_saved(&test);
    Ok(())
}

async fn run_assign(
    client: &Client,
    test_id: &str,
    assignee_id: String,
    due_date: Option<DateTime<Utc>>,
    notes: Option<String>,
) -> Result<(), ClientError> {
    let req = CreateAssignmentRequest {
        assignee_id,
        due_date,
        notes,
    };
    let assignment = client.create_assignment(test_id, &req).await?;
    render::print_assignment_created(&assignment);
    Ok(())
}

async fn run_list(client: &Client, test_id: &str) -> Result<(), ClientError> {
    let assignments = client.list_assignments(test_id).await?;
    render::print_assignment_list(&assignments);
    Ok(())
}

async fn run_start(
    client: &Client,
    test_id: &str,
    assignee: Option<String>,
) -> Result<(), ClientError> {
    let assignment = client.start_execution(test_id, assignee).await?;
    render::print_assignment_details(&assignment);
    Ok(())
}

async fn run_step(
    client: &Client,
    assignment_id: &str,
    index: u32,
    status: &str,
    notes: Option<String>,
) -> Result<(), ClientError> {
    let assignment = client
        .record_step(assignment_id, index, status, notes)
        .await?;
    println!(
        "Recorded step {} as {} on {}",
        index, status, assignment.id
    );
    Ok(())
}

async fn run_save(
    client: &Client,
    assignment_id: &str,
    steps: Option<PathBuf>,
    notes: Option<String>,
    finish: bool,
) -> Result<(), ClientError> {
    let steps = steps.as_deref().map(load_step_results).transpose()?;
    let req = ExecutionUpdateRequest { steps, notes };

    let assignment = if finish {
        client.finish(assignment_id, &req).await?
    } else {
        client.save_progress(assignment_id, &req).await?
    };
    println!(
        "Assignment {}: {} ({} step(s) recorded)",
        assignment.id,
        assignment.state.as_str(),
        assignment.ledger.len()
    );
    Ok(())
}

async fn run_reassign(client: &Client, assignment_id: &str) -> Result<(), ClientError> {
    let assignment = client.reassign(assignment_id).await?;
    render::print_assignment_created(&assignment);
    Ok(())
}

async fn run_delete(client: &Client, assignment_id: &str) -> Result<(), ClientError> {
    client.delete_assignment(assignment_id).await?;
    println!("Deleted assignment: {}", assignment_id);
    Ok(())
}

async fn run_stats(client: &Client, test_id: &str) -> Result<(), ClientError> {
    let stats = client.test_statistics(test_id).await?;
    println!("Test: {}", test_id);
    render::print_statistics(&stats);
    Ok(())
}

async fn run_dashboard(client: &Client, test_id: &str) -> Result<(), ClientError> {
    let dashboard = client.test_dashboard(test_id).await?;
    render::print_dashboard(&dashboard);
    Ok(())
}

async fn run_summary(client: &Client, assignment_id: &str) -> Result<(), ClientError> {
    let summary = client.summary(assignment_id).await?;
    render::print_summary(&summary);
    Ok(())
}

async fn run_show(client: &Client, assignment_id: &str) -> Result<(), ClientError> {
    let assignment = client.get_assignment(assignment_id).await?;
    render::print_assignment_details(&assignment);
    Ok(())
}

async fn run_history(client: &Client, assignment_id: &str) -> Result<(), ClientError> {
    let attempts = client.history(assignment_id).await?;
    render::print_history(&attempts);
    Ok(())
}

async fn run_events(client: &Client, assignment_id: &str) -> Result<(), ClientError> {
    let events = client.events(assignment_id).await?;
    render::print_events(&events);
    Ok(())
}

fn read_file(path: &Path) -> Result<String, ClientError> {
    std::fs::read_to_string(path)
        .map_err(|e| ClientError::IoError(format!("failed to read {}: {}", path.display(), e)))
}

/// Load a test definition. JSON is accepted as a subset of YAML.
fn load_test_definition(path: &Path) -> Result<TestDefinition, ClientError> {
    let content = read_file(path)?;
    parse_test_definition(&content)
        .map_err(|e| ClientError::InvalidInput(format!("{}: {}", path.display(), e)))
}

fn parse_test_definition(content: &str) -> Result<TestDefinition, serde_yaml::Error> {
    serde_yaml::from_str(content)
}

fn load_step_results(path: &Path) -> Result<Vec<StepResult>, ClientError> {
    let content = read_file(path)?;
    serde_yaml::from_str(&content)
        .map_err(|e| ClientError::InvalidInput(format!("{}: {}", path.display(), e)))
}
