use std::ffi::OsString;
use std::path::PathBuf;

use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};

use cloudfs::config::{FileConfig, SizeValue};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("REPO_VERSION"),
    ", built ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

/// Options that each select the operation to run. At most one may be given.
const EXCLUSIVE: [&str; 8] = [
    "create_bucket",
    "delete_bucket",
    "create",
    "mount",
    "unmount",
    "list",
    "fsck",
    "delete",
];

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "cloudfs", version = VERSION)]
#[command(about = "Mount an object storage bucket as an encrypted, cached volume")]
pub struct Args {
    /// Storage service: dummy, amazon or google
    #[arg(long)]
    pub store: Option<String>,
    #[arg(long)]
    pub bucket: Option<String>,
    #[arg(long)]
    pub volume: Option<String>,

    /// Write logs to this file as well
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,
    /// Default log level; RUST_LOG overrides it
    #[arg(long)]
    pub log_level: Option<String>,
    /// Config file (defaults to ~/.cloudfs.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Encryption password
    #[arg(long, value_name = "KEY")]
    pub password: Option<String>,
    /// Read the encryption password from stdin
    #[arg(long)]
    pub password_prompt: bool,
    #[arg(long)]
    pub readonly: bool,
    /// Accepted for compatibility; mounts always run in the foreground
    #[arg(long)]
    pub nofork: bool,
    /// Use a seeded generator instead of the OS random source
    #[arg(long)]
    pub norandom: bool,
    /// Mount over another session's marker, or delete a mounted volume
    #[arg(long)]
    pub force: bool,
    /// Use HTTPS for storage requests
    #[arg(long)]
    pub use_https: bool,

    /// Cache type: memory or file
    #[arg(long, value_name = "TYPE")]
    pub cache_type: Option<String>,
    /// Maximum size of the cache, e.g. 512M
    #[arg(long, value_name = "SIZE")]
    pub cache_max: Option<String>,
    /// Directory for the file cache
    #[arg(long, value_name = "PATH")]
    pub cache_path: Option<PathBuf>,

    #[arg(long)]
    pub create_bucket: bool,
    /// Create the bucket if it does not exist
    #[arg(long)]
    pub auto_create_bucket: bool,
    #[arg(long)]
    pub delete_bucket: bool,

    /// Create the volume
    #[arg(long)]
    pub create: bool,
    /// Mount the volume and hold it until SIGINT or SIGTERM
    #[arg(long, value_name = "PATH")]
    pub mount: Option<PathBuf>,
    /// Stop the session that mounted PATH
    #[arg(long, value_name = "PATH")]
    pub unmount: Option<PathBuf>,
    /// List volumes in the bucket
    #[arg(long)]
    pub list: bool,
    /// Check the volume
    #[arg(long)]
    pub fsck: bool,
    /// With --fsck, drop damaged blocks and delete orphans
    #[arg(long)]
    pub repair: bool,
    /// Delete the volume
    #[arg(long)]
    pub delete: bool,

    /// Volume format: vfs or block
    #[arg(long)]
    pub format: Option<String>,
    /// Volume size, e.g. 10G
    #[arg(long)]
    pub size: Option<String>,

    #[arg(long, value_name = "KEY")]
    pub amazon_key: Option<String>,
    #[arg(long, value_name = "KEY")]
    pub amazon_secret: Option<String>,
    /// S3-compatible endpoint (defaults to AWS)
    #[arg(long, value_name = "HOST")]
    pub amazon_endpoint: Option<String>,
    #[arg(long)]
    pub amazon_region: Option<String>,

    #[arg(long, value_name = "ID")]
    pub google_client_id: Option<String>,
    #[arg(long, value_name = "KEY")]
    pub google_client_secret: Option<String>,
    #[arg(long, value_name = "ID")]
    pub google_project_id: Option<String>,
    #[arg(long, value_name = "FILE")]
    pub google_token_file: Option<PathBuf>,

    /// Path to the storage directory of the dummy store
    #[arg(long, value_name = "PATH")]
    pub dummy_path: Option<PathBuf>,
}

/// The operation an invocation asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateBucket,
    DeleteBucket,
    Create,
    Mount(PathBuf),
    Unmount(PathBuf),
    List,
    Fsck { repair: bool },
    Delete,
}

#[derive(Debug, thiserror::Error)]
pub enum ArgsError {
    /// Also carries --help and --version output
    #[error("{}", .0.render())]
    Clap(#[from] clap::Error),
    #[error("Cannot use --{second} with --{first}")]
    Conflict { first: String, second: String },
    #[error("No operation given, use one of --create, --mount, --unmount, --list, --fsck, --delete, --create-bucket or --delete-bucket")]
    NoOperation,
    #[error("--repair only applies to --fsck")]
    RepairWithoutFsck,
}

#[derive(Debug)]
pub struct Invocation {
    pub args: Args,
    pub operation: Operation,
}

fn flag_name(id: &str) -> String {
    id.replace('_', "-")
}

/// Parse the command line, enforcing that exactly one operation is given.
pub fn parse_from<I, T>(itr: I) -> Result<Invocation, ArgsError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = Args::command().try_get_matches_from(itr)?;
    let args = Args::from_arg_matches(&matches)?;
    let operation = args.operation(&matches)?;
    Ok(Invocation { args, operation })
}

impl Args {
    fn operation(&self, matches: &ArgMatches) -> Result<Operation, ArgsError> {
        let mut given: Vec<(usize, &str)> = EXCLUSIVE
            .iter()
            .enumerate()
            .filter(|(_, id)| matches.value_source(id) == Some(ValueSource::CommandLine))
            .map(|(order, id)| (matches.index_of(id).unwrap_or(order), *id))
            .collect();
        given.sort();

        let first = match given.as_slice() {
            [] => return Err(ArgsError::NoOperation),
            [(_, only)] => *only,
            [(_, first), (_, second), ..] => {
                return Err(ArgsError::Conflict {
                    first: flag_name(first),
                    second: flag_name(second),
                })
            }
        };
        if self.repair && first != "fsck" {
            return Err(ArgsError::RepairWithoutFsck);
        }

        Ok(match first {
            "create_bucket" => Operation::CreateBucket,
            "delete_bucket" => Operation::DeleteBucket,
            "create" => Operation::Create,
            "mount" => Operation::Mount(self.mount.clone().unwrap_or_default()),
            "unmount" => Operation::Unmount(self.unmount.clone().unwrap_or_default()),
            "list" => Operation::List,
            "fsck" => Operation::Fsck {
                repair: self.repair,
            },
            _ => Operation::Delete,
        })
    }

    /// The flags as a config layer; switches that were not given stay
    /// unset so the config file can supply them.
    pub fn file_config(&self) -> FileConfig {
        let switch = |on: bool| on.then_some(true);
        FileConfig {
            store: self.store.clone(),
            bucket: self.bucket.clone(),
            volume: self.volume.clone(),
            log: self.log.clone(),
            log_level: self.log_level.clone(),
            password: self.password.clone(),
            password_prompt: switch(self.password_prompt),
            readonly: switch(self.readonly),
            nofork: switch(self.nofork),
            norandom: switch(self.norandom),
            force: switch(self.force),
            use_https: switch(self.use_https),
            cache_type: self.cache_type.clone(),
            cache_max: self.cache_max.clone().map(SizeValue::Text),
            cache_path: self.cache_path.clone(),
            auto_create_bucket: switch(self.auto_create_bucket),
            format: self.format.clone(),
            size: self.size.clone().map(SizeValue::Text),
            workers: None,
            writeback_secs: None,
            kdf_memory_kib: None,
            kdf_iterations: None,
            state_dir: None,
            amazon_key: self.amazon_key.clone(),
            amazon_secret: self.amazon_secret.clone(),
            amazon_endpoint: self.amazon_endpoint.clone(),
            amazon_region: self.amazon_region.clone(),
            google_client_id: self.google_client_id.clone(),
            google_client_secret: self.google_client_secret.clone(),
            google_project_id: self.google_project_id.clone(),
            google_token_file: self.google_token_file.clone(),
            dummy_path: self.dummy_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Invocation, ArgsError> {
        parse_from(std::iter::once("cloudfs").chain(args.iter().copied()))
    }

    #[test]
    fn test_single_operation() {
        let inv = parse(&["--volume", "v", "--mount", "/mnt/v", "--readonly"]).unwrap();
        assert_eq!(inv.operation, Operation::Mount(PathBuf::from("/mnt/v")));
        assert!(inv.args.readonly);

        let inv = parse(&["--fsck", "--repair"]).unwrap();
        assert_eq!(inv.operation, Operation::Fsck { repair: true });
        assert_eq!(parse(&["--list"]).unwrap().operation, Operation::List);
    }

    #[test]
    fn test_two_operations_conflict() {
        let err = parse(&["--create", "--volume", "v", "--delete"]).unwrap_err();
        assert_eq!(err.to_string(), "Cannot use --delete with --create");

        let err = parse(&["--mount", "/m", "--list"]).unwrap_err();
        assert_eq!(err.to_string(), "Cannot use --list with --mount");
    }

    #[test]
    fn test_no_operation() {
        assert!(matches!(
            parse(&["--volume", "v"]),
            Err(ArgsError::NoOperation)
        ));
        assert!(matches!(
            parse(&["--list", "--repair"]),
            Err(ArgsError::RepairWithoutFsck)
        ));
    }

    #[test]
    fn test_help_and_version_are_errors() {
        match parse(&["--help"]) {
            Err(ArgsError::Clap(e)) => assert_eq!(e.kind(), clap::error::ErrorKind::DisplayHelp),
            other => panic!("unexpected {other:?}"),
        }
        match parse(&["--version"]) {
            Err(ArgsError::Clap(e)) => {
                assert_eq!(e.kind(), clap::error::ErrorKind::DisplayVersion)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unset_switches_do_not_override_file() {
        let inv = parse(&["--list", "--cache-max", "64M"]).unwrap();
        let config = inv.args.file_config();
        assert_eq!(config.readonly, None);
        assert_eq!(config.force, None);
        assert_eq!(config.cache_max, Some(SizeValue::Text("64M".to_string())));
    }
}
