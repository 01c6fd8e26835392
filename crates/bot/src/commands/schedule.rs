use chrono::Utc;
use tracing::warn;

use apis::errors::Error;
use utility::streams::NextStream;

use crate::{format, scheduler};

use super::CommandContext;

/// One channel's next stream. Served from the scheduler's next-stream
/// summary when it is warm; a cold summary falls back to a schedule
/// fetch.
pub(super) async fn run(ctx: &CommandContext, member_query: &str) -> Result<String, Error> {
    if member_query.trim().is_empty() {
        return Err(Error::Validation {
            field: "member",
            value: String::new(),
        });
    }

    let Some(channel) = ctx.resolver.resolve(member_query).await? else {
        return Ok(member_not_found(member_query));
    };

    let summary_key = scheduler::next_stream_key(&channel.id);

    match ctx.kv.get::<NextStream>(&summary_key).await {
        Ok(Some(summary)) => {
            return Ok(format::next_stream(channel.display_name(), &summary));
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Next-stream summary read failed."),
    }

    let streams = ctx.schedule.channel_schedule(&channel.id, 48, true).await?;
    let summary = scheduler::next_stream_summary(&streams, Utc::now());

    Ok(format::next_stream(channel.display_name(), &summary))
}

pub(super) fn member_not_found(query: &str) -> String {
    format!("No member found matching \"{}\".", query.trim())
}
