use apis::errors::Error;

use crate::format;

use super::CommandContext;

pub(super) async fn run(ctx: &CommandContext) -> Result<String, Error> {
    let streams = ctx.schedule.live().await?;
    Ok(format::stream_list("Live now:", &streams))
}
