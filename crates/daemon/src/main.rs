// CLI modules
mod cli;

use anyhow::Context;

use cli::args::{self, ArgsError, Invocation, Operation};
use cli::op::{Op, OpContext};
use cli::{Create, CreateBucket, Delete, DeleteBucket, Fsck, List, Mount, Unmount};
use cloudfs::process::{init_logging, report_build_info};
use cloudfs::{FileConfig, Settings};

command_enum! {
    (CreateBucket, CreateBucket),
    (DeleteBucket, DeleteBucket),
    (Create, Create),
    (Mount, Mount),
    (Unmount, Unmount),
    (List, List),
    (Fsck, Fsck),
    (Delete, Delete),
}

impl From<Operation> for Command {
    fn from(operation: Operation) -> Self {
        match operation {
            Operation::CreateBucket => Command::CreateBucket(CreateBucket),
            Operation::DeleteBucket => Command::DeleteBucket(DeleteBucket),
            Operation::Create => Command::Create(Create),
            Operation::Mount(path) => Command::Mount(Mount { path }),
            Operation::Unmount(path) => Command::Unmount(Unmount { path }),
            Operation::List => Command::List(List),
            Operation::Fsck { repair } => Command::Fsck(Fsck { repair }),
            Operation::Delete => Command::Delete(Delete),
        }
    }
}

#[tokio::main]
async fn main() {
    let invocation = match args::parse_from(std::env::args_os()) {
        Ok(invocation) => invocation,
        Err(ArgsError::Clap(e)) => {
            eprint!("{}", e.render());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match run(invocation).await {
        Ok(output) => {
            println!("{}", output);
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(invocation: Invocation) -> anyhow::Result<String> {
    let Invocation { args, operation } = invocation;

    // Flags > config file > defaults
    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::load_default()?,
    };
    let settings =
        Settings::try_from(args.file_config().overlay(file)).context("invalid configuration")?;

    let _guards = init_logging(settings.log_level, settings.log.as_deref());
    report_build_info(&common::build_info!());

    let ctx = OpContext::new(settings);
    let command = Command::from(operation);
    tracing::debug!(?command, "executing");

    let result = command.execute(&ctx).await;
    ctx.shutdown().await;

    match result {
        Ok(output) => Ok(output.to_string()),
        Err(e) => {
            tracing::debug!(error = %e, "operation failed");
            Err(e.into())
        }
    }
}
