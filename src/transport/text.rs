use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use std::ops::Range;

/// Replace `<@id>` / `<@!id>` pings of the bot with `@name` so mention
/// detection can work on plain text.
pub fn replace_bot_mentions(input: &str, bot_id: u64, bot_name: &str) -> String {
    let mention = format!("<@{}>", bot_id);
    let mention_nick = format!("<@!{}>", bot_id);
    let named = format!("@{}", bot_name);

    input
        .replace(&mention, &named)
        .replace(&mention_nick, &named)
        .trim()
        .to_string()
}

/// Turns Markdown headings into bold lines; everything else passes through untouched.
pub fn format_reply(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;
    let mut heading: Option<(Range<usize>, String)> = None;

    for (event, range) in Parser::new(input).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { .. }) => heading = Some((range, String::new())),
            Event::End(TagEnd::Heading(_)) => {
                let Some((span, title)) = heading.take() else {
                    continue;
                };
                out.push_str(&input[cursor..span.start]);
                let title = title.trim();
                if !title.is_empty() {
                    out.push_str("**");
                    out.push_str(title);
                    out.push_str("**");
                }
                if input[span.clone()].ends_with('\n') {
                    out.push('\n');
                }
                cursor = span.end;
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some((_, title)) = heading.as_mut() {
                    title.push_str(&text);
                }
            }
            _ => {}
        }
    }

    out.push_str(&input[cursor..]);
    out
}

/// Splits `text` into chunks of at most `limit` characters, preferring line breaks.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > limit {
        let hard_end = rest
            .char_indices()
            .nth(limit)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        let end = match rest[..hard_end].rfind('\n') {
            Some(newline) if newline > hard_end / 2 => newline + 1,
            _ => hard_end,
        };
        chunks.push(rest[..end].to_string());
        rest = &rest[end..];
    }

    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}
