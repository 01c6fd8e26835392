use apis::errors::Error;

use crate::format;

use super::CommandContext;

pub(super) async fn run(ctx: &CommandContext, hours: u32) -> Result<String, Error> {
    let streams = ctx.schedule.upcoming(hours).await?;
    Ok(format::stream_list(
        &format!("Upcoming within {hours}h:"),
        &streams,
    ))
}
