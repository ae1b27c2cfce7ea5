use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hieracl_core::{ModelError, ObjectIdentity, Sid};

#[derive(Debug, Parser)]
#[command(name = "hieracl-admin", version)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate,
    /// Print an ACL with its parent chain.
    Show {
        #[arg(long = "type")]
        object_type: String,
        #[arg(long)]
        id: i64,
    },
    Children {
        #[arg(long = "type")]
        object_type: String,
        #[arg(long)]
        id: i64,
    },
    DeleteSid {
        #[arg(long, conflicts_with = "authority", required_unless_present = "authority")]
        principal: Option<String>,
        #[arg(long)]
        authority: Option<String>,
    },
}

impl Command {
    pub fn object_identity(&self) -> Option<Result<ObjectIdentity, ModelError>> {
        match self {
            Command::Show { object_type, id } | Command::Children { object_type, id } => {
                Some(ObjectIdentity::new(object_type.as_str(), *id))
            }
            _ => None,
        }
    }

    pub fn sid(&self) -> Option<Result<Sid, ModelError>> {
        match self {
            Command::DeleteSid {
                principal: Some(name),
                ..
            } => Some(Sid::principal(name.as_str())),
            Command::DeleteSid {
                authority: Some(name),
                ..
            } => Some(Sid::authority(name.as_str())),
            _ => None,
        }
    }
}
