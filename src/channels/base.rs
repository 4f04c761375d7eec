use crate::bus::OutboundMessage;
use crate::config::BotParams;
use crate::errors::GatewayError;
use crate::store::Conversation;
use crate::utils::regex::RegexPatterns;
use async_trait::async_trait;

/// One send strategy per channel family. The dispatcher selects the strategy
/// from the conversation's stored channel and invokes it polymorphically, so
/// channel-specific rendering applies uniformly no matter where a send
/// originates (live webhook, broadcast, scheduled).
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        bot: &BotParams,
        conversation: &Conversation,
        message: &OutboundMessage,
    ) -> Result<(), GatewayError>;
}

/// Split `text` into chunks of at most `limit` characters, breaking only at
/// word boundaries. Concatenating the chunks reproduces `text` exactly,
/// whitespace included. A single word longer than the limit is hard-split so
/// the length bound always holds.
pub fn split_text_at_word(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if limit == 0 {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for run in whitespace_runs(text) {
        let run_len = run.chars().count();
        if current_len + run_len <= limit {
            current.push_str(run);
            current_len += run_len;
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if run_len <= limit {
            current.push_str(run);
            current_len = run_len;
        } else {
            // Oversized single run: hard-split at the limit
            let mut rest = run;
            loop {
                match rest.char_indices().nth(limit) {
                    Some((byte_idx, _)) => {
                        chunks.push(rest[..byte_idx].to_string());
                        rest = &rest[byte_idx..];
                    }
                    None => break,
                }
            }
            current.push_str(rest);
            current_len = rest.chars().count();
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Alternating runs of whitespace and non-whitespace, in order, lossless.
fn whitespace_runs(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let first_is_ws = rest.chars().next().is_some_and(char::is_whitespace);
        let end = rest
            .char_indices()
            .find(|(_, c)| c.is_whitespace() != first_is_ws)
            .map_or(rest.len(), |(i, _)| i);
        let (run, tail) = rest.split_at(end);
        rest = tail;
        Some(run)
    })
}

/// Strip markdown for channels that would otherwise show it verbatim.
/// Links keep their target as a parenthetical.
pub fn strip_markdown(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let text = RegexPatterns::markdown_link().replace_all(text, "$1 ($2)");
    let text = RegexPatterns::markdown_code().replace_all(&text, "$1");
    let text = RegexPatterns::markdown_bold().replace_all(&text, "$1");
    let text = RegexPatterns::markdown_italic().replace_all(&text, "$1$2");
    RegexPatterns::markdown_heading()
        .replace_all(&text, "")
        .to_string()
}
