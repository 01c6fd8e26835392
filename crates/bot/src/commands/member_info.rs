use tracing::warn;

use apis::errors::Error;

use crate::format;

use super::{schedule::member_not_found, CommandContext};

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

    let record = match ctx.profiles.by_channel_id(&channel.id).await {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "Profile lookup failed.");
            None
        }
    };

    // Statistics are an enrichment; a refused quota gate or disabled
    // secondary source never fails the reply.
    let stats = match ctx.schedule.channel_stats(&[channel.id.clone()]).await {
        Ok(stats) => stats.get(&channel.id).cloned(),
        Err(e) => {
            warn!(error = %e, "Channel statistics unavailable.");
            None
        }
    };

    Ok(format::channel_info(
        &channel,
        record.as_ref(),
        stats.as_ref(),
    ))
}
