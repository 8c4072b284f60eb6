use crate::cli::op::{CliError, Op, OpContext};

#[derive(Debug, Clone)]
pub struct CreateBucket;

#[async_trait::async_trait]
impl Op for CreateBucket {
    type Error = CliError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let bucket = &ctx.settings.bucket;
        ctx.settings.store.create_bucket(bucket).await?;
        Ok(format!("created bucket '{bucket}'"))
    }
}

/// Only empty buckets can be deleted.
#[derive(Debug, Clone)]
pub struct DeleteBucket;

#[async_trait::async_trait]
impl Op for DeleteBucket {
    type Error = CliError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let bucket = &ctx.settings.bucket;
        ctx.settings.store.delete_bucket(bucket).await?;
        Ok(format!("deleted bucket '{bucket}'"))
    }
}
