use clap::{Args, Parser, Subcommand};

use hostgate::middleware::rbac::{Actor, Role};

/// Human approval gate for privileged host operations
#[derive(Parser)]
#[command(name = "hostgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the approvals API server
    Serve {
        /// Port to bind (defaults to HOSTGATE_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Work with approval requests
    Approval {
        #[command(flatten)]
        actor: ActorArgs,
        #[command(subcommand)]
        command: ApprovalCommands,
    },

    /// Inspect approval policies
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
}

/// Identity the command acts as. The CLI trusts the operator the same way
/// the API trusts its authenticating proxy.
#[derive(Args)]
pub struct ActorArgs {
    #[arg(long = "as", env = "HOSTGATE_ACTOR_ID", global = true, default_value = "cli")]
    pub actor_id: String,
    #[arg(long = "name", env = "HOSTGATE_ACTOR_NAME", global = true)]
    pub actor_name: Option<String>,
    #[arg(long = "role", env = "HOSTGATE_ACTOR_ROLE", global = true, default_value = "admin")]
    pub actor_role: String,
}

impl ActorArgs {
    pub fn actor(&self) -> Actor {
        Actor::new(
            self.actor_id.clone(),
            self.actor_name.clone().unwrap_or_else(|| self.actor_id.clone()),
            Role::parse(&self.actor_role),
        )
    }
}

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// Propose a privileged action
    Create {
        #[arg(long = "type")]
        request_type: String,
        /// Payload as a JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// List pending requests, or your own with --mine
    List {
        #[arg(long)]
        mine: bool,
        #[arg(long = "type")]
        request_type: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "1")]
        page: i64,
        #[arg(long, default_value = "20")]
        per_page: i64,
    },
    /// Show one request with its verified history
    Show { request_id: String },
    /// Approve a pending request
    Approve {
        request_id: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Reject a pending request
    Reject {
        request_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        emergency: bool,
    },
    /// Cancel your own pending request
    Cancel { request_id: String },
    /// Run the executor for an approved request
    Execute { request_id: String },
    /// Expire overdue pending requests now
    Expire,
    /// Audit history with signature checks
    History {
        #[arg(long)]
        request_id: Option<String>,
        #[arg(long)]
        actor: Option<String>,
        #[arg(long)]
        action: Option<String>,
        #[arg(long, default_value = "1")]
        page: i64,
        #[arg(long, default_value = "50")]
        per_page: i64,
    },
    /// Aggregate counts over 7d, 30d, 90d or all
    Stats {
        #[arg(long, default_value = "30d")]
        period: String,
    },
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// List configured policies
    List,
}
