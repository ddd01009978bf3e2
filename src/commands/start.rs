use crate::access::ApprovalState;
use crate::transport::discord::sender_from_user;
use crate::{Context, Error};
use tracing::debug;

/// Say hello. New users are sent for approval first.
///
/// The answer is ephemeral, so it never becomes a reply target.
#[poise::command(slash_command)]
pub async fn start(ctx: Context<'_>) -> Result<(), Error> {
    // The approval request may outlast the interaction's response deadline.
    ctx.defer_ephemeral().await?;
    let sender = sender_from_user(ctx.author());

    let data = ctx.data();
    let token = data.shutdown.child_token();
    let state = data
        .orchestrator
        .gate()
        .check_or_request(ctx.channel_id().get() as i64, &sender, &token)
        .await?;

    let content = match state {
        ApprovalState::Approved(_) => "Welcome!",
        ApprovalState::Pending => {
            debug!("/start from unapproved user {}", sender.id);
            "Your access request is waiting for approval."
        }
    };
    ctx.send(poise::CreateReply::default().content(content).ephemeral(true))
        .await?;
    Ok(())
}
