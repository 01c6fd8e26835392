use apis::errors::Error;

use crate::{format, subscriptions::{AddOutcome, RemoveOutcome}};

use super::{schedule::member_not_found, CommandContext};

pub(super) async fn add(
    ctx: &CommandContext,
    room_id: &str,
    user_id: &str,
    member_query: &str,
) -> Result<String, Error> {
    if member_query.trim().is_empty() {
        return Err(Error::Validation {
            field: "member",
            value: String::new(),
        });
    }

    let Some(channel) = ctx.resolver.resolve(member_query).await? else {
        return Ok(member_not_found(member_query));
    };

    let name = channel.display_name();

    match ctx
        .registry
        .add(room_id, user_id, &channel.id, name)
        .await?
    {
        AddOutcome::Added => Ok(format!("Alarm set for {name}.")),
        AddOutcome::AlreadyPresent => Ok(format!("You already have an alarm for {name}.")),
    }
}

pub(super) async fn remove(
    ctx: &CommandContext,
    room_id: &str,
    user_id: &str,
    member_query: &str,
) -> Result<String, Error> {
    if member_query.trim().is_empty() {
        return Err(Error::Validation {
            field: "member",
            value: String::new(),
        });
    }

    let Some(channel) = ctx.resolver.resolve(member_query).await? else {
        return Ok(member_not_found(member_query));
    };

    let name = channel.display_name();

    match ctx.registry.remove(room_id, user_id, &channel.id).await? {
        RemoveOutcome::Removed => Ok(format!("Alarm removed for {name}.")),
        RemoveOutcome::NotSubscribed => Ok(format!("You have no alarm for {name}.")),
    }
}

pub(super) async fn list(
    ctx: &CommandContext,
    room_id: &str,
    user_id: &str,
) -> Result<String, Error> {
    let subscriptions = ctx.registry.list(room_id, user_id).await?;
    Ok(format::alarm_list(&subscriptions))
}

pub(super) async fn clear(
    ctx: &CommandContext,
    room_id: &str,
    user_id: &str,
) -> Result<String, Error> {
    let removed = ctx.registry.clear(room_id, user_id).await?;

    if removed == 0 {
        Ok("No stream alarms to remove.".to_owned())
    } else {
        Ok(format!("Removed {removed} stream alarm(s)."))
    }
}
