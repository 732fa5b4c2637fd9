//! Outgoing routing: picks the channel that owns a JID and delivers text to it.
//!
//! Centralizes the `owns_jid` dispatch that both message processing and
//! scheduled-task execution need, so the two paths can't drift apart.

use std::sync::Arc;

use intercom_core::TypingState;

use crate::channels::{MailPollChannel, TelegramChannel};

/// Deliver `text` to whichever channel owns `jid`.
pub async fn send_to_jid(
    telegram: &Arc<TelegramChannel>,
    mail: &Arc<MailPollChannel>,
    jid: &str,
    text: &str,
) -> anyhow::Result<()> {
    if TelegramChannel::owns_jid(jid) {
        telegram.send_text_to_jid(jid, text).await
    } else {
        mail.send_text_to_jid(jid, text).await
    }
}

/// Relay a typing indicator to `jid`'s owning channel, if it supports one.
pub async fn set_typing(telegram: &Arc<TelegramChannel>, jid: &str, typing: TypingState) -> anyhow::Result<()> {
    if TelegramChannel::owns_jid(jid) {
        telegram.set_typing(jid, typing).await
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telegram_owns_tg_prefixed_jids() {
        assert!(TelegramChannel::owns_jid("tg:12345"));
        assert!(!TelegramChannel::owns_jid("mail:inbox"));
    }
}
