use std::error::Error;

use common::pool::{PoolHandle, WorkerPool};
use store::{open_store, SharedStore, StoreError};
use zeroize::Zeroizing;

use cloudfs::{ConfigError, SessionError, Settings};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Volume(#[from] common::volume::VolumeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    Failed(String),
}

/// Everything an operation needs: resolved settings and the worker pool
/// that carries store I/O.
pub struct OpContext {
    pub settings: Settings,
    pool: WorkerPool,
}

impl OpContext {
    pub fn new(settings: Settings) -> Self {
        let pool = WorkerPool::new(settings.engine.workers);
        Self { settings, pool }
    }

    pub fn pool(&self) -> PoolHandle {
        self.pool.handle()
    }

    /// Open the configured bucket, creating it first with
    /// `--auto-create-bucket`.
    pub async fn open_store(&self) -> Result<SharedStore, StoreError> {
        open_store(
            &self.settings.store,
            &self.settings.bucket,
            self.settings.engine.retry,
            self.settings.auto_create_bucket,
        )
        .await
    }

    pub fn password(&self) -> Result<Zeroizing<String>, ConfigError> {
        self.settings.password.resolve()
    }

    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}

#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: Error + Send + Sync + 'static;
    type Output;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

#[macro_export]
macro_rules! command_enum {
    ($(($variant:ident, $type:ty)),* $(,)?) => {
        #[derive(Debug, Clone)]
        pub enum Command {
            $($variant($type),)*
        }

        #[derive(Debug)]
        pub enum OpOutput {
            $($variant(<$type as $crate::cli::op::Op>::Output),)*
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                #[error(transparent)]
                $variant(<$type as $crate::cli::op::Op>::Error),
            )*
        }

        #[async_trait::async_trait]
        impl $crate::cli::op::Op for Command {
            type Output = OpOutput;
            type Error = OpError;

            async fn execute(&self, ctx: &$crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
                match self {
                    $(
                        Command::$variant(op) => {
                            op.execute(ctx).await
                                .map(OpOutput::$variant)
                                .map_err(OpError::$variant)
                        },
                    )*
                }
            }
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(
                        OpOutput::$variant(output) => write!(f, "{}", output),
                    )*
                }
            }
        }
    };
}
