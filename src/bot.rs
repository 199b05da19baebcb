use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, ChatAction, ParseMode};
use tracing::{debug, info, warn};

use crate::api::RecordsClient;
use crate::commands::{self, Invocation, Limits, Reply};
use crate::config::Config;

/// Telegram rejects messages over 4096 characters; leave some headroom.
const MAX_MESSAGE_LEN: usize = 4000;

/// Shared application state
pub struct AppState {
    records: RecordsClient,
    config: Config,
    bot_username: Option<String>,
}

impl AppState {
    pub fn new(config: Config, bot_username: Option<String>) -> Self {
        let records = RecordsClient::new(config.api.clone());
        Self {
            records,
            config,
            bot_username,
        }
    }

    fn limits(&self) -> Limits {
        Limits {
            per_page: self.config.api.per_page,
            max_results: self.config.api.max_results,
        }
    }
}

/// Split long messages on line or word boundaries
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or_else(|| keep_escape_together(text, start, end))
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Pull a hard cut back by one byte if it would separate a MarkdownV2 `\`
/// from the character it escapes.
fn keep_escape_together(text: &str, start: usize, end: usize) -> usize {
    let trailing = text.as_bytes()[start..end]
        .iter()
        .rev()
        .take_while(|&&b| b == b'\\')
        .count();
    if trailing % 2 == 1 && end - 1 > start {
        end - 1
    } else {
        end
    }
}

/// Publish the command menu shown by Telegram clients
async fn register_commands(bot: &Bot) -> Result<()> {
    let menu = commands::MENU
        .iter()
        .map(|(name, description)| BotCommand::new(*name, *description));
    bot.set_my_commands(menu)
        .await
        .context("Failed to register bot commands")?;
    Ok(())
}

/// Start the Telegram bot
pub async fn run(config: Config) -> Result<()> {
    let bot = Bot::new(&config.telegram.bot_token);

    info!("Starting Telegram bot...");

    let me = bot
        .get_me()
        .await
        .context("Failed to fetch bot identity (is the token valid?)")?;
    let bot_username = me.user.username.clone();
    info!("Logged in as @{}", bot_username.as_deref().unwrap_or("unknown"));

    if let Err(e) = register_commands(&bot).await {
        warn!("{:#}", e);
    }

    let state = Arc::new(AppState::new(config, bot_username));

    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            debug!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let Some(invocation) = Invocation::parse(text, state.bot_username.as_deref()) else {
        debug!("Ignoring non-command message in chat {}", msg.chat.id);
        return Ok(());
    };

    let user_id = msg.from.as_ref().map(|user| user.id.0).unwrap_or_default();
    info!(
        "Command /{} from user {} ({} args)",
        invocation.name,
        user_id,
        invocation.args.len()
    );

    if commands::needs_lookup(&invocation) {
        bot.send_chat_action(msg.chat.id, ChatAction::Typing)
            .await
            .ok();
    }

    match commands::dispatch(&invocation, &state.records, state.limits()).await {
        Some(reply) => send_reply(&bot, msg.chat.id, reply).await,
        None => {
            debug!("Unknown command /{}", invocation.name);
            Ok(())
        }
    }
}

async fn send_reply(bot: &Bot, chat_id: ChatId, reply: Reply) -> ResponseResult<()> {
    if reply.text.trim().is_empty() {
        warn!("Skipping empty reply to chat {}", chat_id);
        return Ok(());
    }

    for chunk in split_message(&reply.text, MAX_MESSAGE_LEN) {
        let request = bot.send_message(chat_id, chunk);
        if reply.markdown {
            request.parse_mode(ParseMode::MarkdownV2).await?;
        } else {
            request.await?;
        }
    }

    Ok(())
}
